//! Lazily created session handle, replaced one generation at a time.

use crate::ensemble::EnsembleProvider;
use crate::error::Error;
use crate::session::{SessionClient, SessionFactory, Watcher};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Generation {
    connection_string: String,
    session: Option<Arc<dyn SessionClient>>,
}

/// Owns the current session generation. A generation records the connect string it
/// was created for and creates its session at most once, on first use.
pub(crate) struct HandleHolder {
    factory: Arc<dyn SessionFactory>,
    ensemble: Arc<dyn EnsembleProvider>,
    session_timeout: Duration,
    can_be_read_only: bool,
    watcher: Arc<dyn Watcher>,
    current: Mutex<Option<Generation>>,
}

impl fmt::Debug for HandleHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleHolder")
            .field("connection_string", &self.connection_string())
            .field("session_timeout", &self.session_timeout)
            .field("can_be_read_only", &self.can_be_read_only)
            .finish()
    }
}

impl HandleHolder {
    pub(crate) fn new(
        factory: Arc<dyn SessionFactory>,
        ensemble: Arc<dyn EnsembleProvider>,
        session_timeout: Duration,
        can_be_read_only: bool,
        watcher: Arc<dyn Watcher>,
    ) -> Self {
        Self { factory, ensemble, session_timeout, can_be_read_only, watcher, current: Mutex::new(None) }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Generation>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session of the current generation, creating it on first use.
    pub(crate) fn session(&self) -> Result<Arc<dyn SessionClient>, Error> {
        let mut guard = self.lock();
        let generation = guard.as_mut().ok_or(Error::Closed)?;
        if let Some(session) = &generation.session {
            return Ok(session.clone());
        }
        let session = self.factory.new_session(
            &generation.connection_string,
            self.session_timeout,
            self.watcher.clone(),
            self.can_be_read_only,
        )?;
        generation.session = Some(session.clone());
        Ok(session)
    }

    /// Session of the current generation if it has been created.
    pub(crate) fn existing_session(&self) -> Option<Arc<dyn SessionClient>> {
        self.lock().as_ref().and_then(|g| g.session.clone())
    }

    /// Close the current session and start a new, not yet connected generation.
    pub(crate) fn close_and_reset(&self) {
        let next = Generation { connection_string: self.ensemble.connection_string(), session: None };
        let previous = self.lock().replace(next);
        close_generation(previous);
    }

    /// Close the current session and leave no generation behind.
    pub(crate) fn close_and_clear(&self) {
        let previous = self.lock().take();
        close_generation(previous);
    }

    pub(crate) fn connection_string(&self) -> Option<String> {
        self.lock().as_ref().map(|g| g.connection_string.clone())
    }

    /// The provider's connect string when it differs from the current generation's.
    pub(crate) fn new_connection_string(&self) -> Option<String> {
        let current = self.connection_string()?;
        let latest = self.ensemble.connection_string();
        (latest != current).then_some(latest)
    }

    /// Adopt `connection_string` for the current generation after an in-place update.
    pub(crate) fn record_connection_string(&self, connection_string: String) {
        if let Some(generation) = self.lock().as_mut() {
            generation.connection_string = connection_string;
        }
    }

    pub(crate) fn session_id(&self) -> Option<i64> {
        self.existing_session().map(|s| s.session_id())
    }

    pub(crate) fn negotiated_session_timeout(&self) -> Duration {
        self.existing_session().map(|s| s.negotiated_session_timeout()).unwrap_or_default()
    }
}

fn close_generation(generation: Option<Generation>) {
    if let Some(session) = generation.and_then(|g| g.session) {
        session.close();
    }
}
