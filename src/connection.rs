//! Connection manager: owns the session handle and tracks connectivity.
//!
//! Session events arrive on the wire client's callback context through an internal
//! watcher. They update the connected flag, trigger resets on expiry or on a changed
//! connect string, and are then forwarded to every registered parent watcher. Nothing
//! on that path raises: failures are buffered and re-raised on the next
//! [`ConnectionManager::get_session`] call.
//!
//! Timeout rules applied while disconnected (see [`ConnectionManager::check_timeouts`]):
//! - `elapsed >= min(session, connection)` with a changed connect string: reset.
//! - `elapsed > max(session, connection)`: reset and give the ensemble another chance.
//! - otherwise past the minimum: [`Error::ConnectionTimeout`].

use crate::ensemble::EnsembleProvider;
use crate::error::Error;
use crate::handle::HandleHolder;
use crate::listener::{ListenerContainer, ListenerHandle};
use crate::session::{EventType, KeeperState, SessionClient, SessionFactory, WatchedEvent, Watcher};
use crate::session_fail::SessionScope;
use crate::tracer::Tracer;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Default bound of the background error buffer.
pub const DEFAULT_MAX_BACKGROUND_ERRORS: usize = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings for a [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionSettings {
    pub factory: Arc<dyn SessionFactory>,
    pub ensemble: Arc<dyn EnsembleProvider>,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub default_watcher: Option<Arc<dyn Watcher>>,
    pub can_be_read_only: bool,
    pub max_background_errors: usize,
    pub tracer: Tracer,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("ensemble", &self.ensemble)
            .field("session_timeout", &self.session_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("can_be_read_only", &self.can_be_read_only)
            .field("max_background_errors", &self.max_background_errors)
            .finish()
    }
}

struct Inner {
    handle: HandleHolder,
    ensemble: Arc<dyn EnsembleProvider>,
    session_timeout: Duration,
    connection_timeout: Duration,
    connected: AtomicBool,
    connection_start: Mutex<Instant>,
    instance_index: AtomicU64,
    negotiated_timeout_ms: AtomicU64,
    background_errors: Mutex<VecDeque<Error>>,
    max_background_errors: usize,
    parent_watchers: ListenerContainer<dyn Watcher>,
    tracer: Tracer,
    reset_lock: Mutex<()>,
    timeouts_lock: Mutex<()>,
}

/// Routes session events back into the manager without keeping it alive.
struct ConnectionWatcher(Weak<Inner>);

impl Watcher for ConnectionWatcher {
    fn process(&self, event: &WatchedEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.process(event);
        }
    }
}

/// Hides session (re)creation and reports connectivity.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connected", &self.is_connected())
            .field("instance_index", &self.instance_index())
            .field("handle", &self.inner.handle)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let watcher: Arc<dyn Watcher> = Arc::new(ConnectionWatcher(weak.clone()));
            let parent_watchers = ListenerContainer::new();
            if let Some(default_watcher) = settings.default_watcher.clone() {
                parent_watchers.add(default_watcher);
            }
            Inner {
                handle: HandleHolder::new(
                    settings.factory.clone(),
                    settings.ensemble.clone(),
                    settings.session_timeout,
                    settings.can_be_read_only,
                    watcher,
                ),
                ensemble: settings.ensemble.clone(),
                session_timeout: settings.session_timeout,
                connection_timeout: settings.connection_timeout,
                connected: AtomicBool::new(false),
                connection_start: Mutex::new(Instant::now()),
                instance_index: AtomicU64::new(0),
                negotiated_timeout_ms: AtomicU64::new(0),
                background_errors: Mutex::new(VecDeque::new()),
                max_background_errors: settings.max_background_errors.max(1),
                parent_watchers,
                tracer: settings.tracer.clone(),
                reset_lock: Mutex::new(()),
                timeouts_lock: Mutex::new(()),
            }
        });
        Self { inner }
    }

    /// Start the ensemble provider and create the first session generation.
    pub fn start(&self) -> Result<(), Error> {
        tracing::debug!("starting connection manager");
        self.inner.ensemble.start()?;
        self.inner.reset()
    }

    /// Stop the provider and close the session; safe to call twice.
    pub fn close(&self) {
        tracing::debug!("closing connection manager");
        self.inner.ensemble.close();
        self.inner.handle.close_and_clear();
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    /// Current session, failing fast for a failed scope and re-raising buffered
    /// background errors first.
    pub fn get_session(&self, scope: Option<&SessionScope>) -> Result<Arc<dyn SessionClient>, Error> {
        if scope.is_some_and(SessionScope::has_failed) {
            return Err(Error::SessionFailed);
        }
        if let Some(err) = lock(&self.inner.background_errors).pop_front() {
            self.inner.tracer.event("background-exceptions").commit();
            return Err(err);
        }
        if !self.is_connected() {
            self.inner.check_timeouts()?;
        }
        self.inner.handle.session()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Apply the disconnected-timeout rules described in the module docs.
    pub fn check_timeouts(&self) -> Result<(), Error> {
        self.inner.check_timeouts()
    }

    /// Replace the session with a fresh generation.
    pub fn reset(&self) -> Result<(), Error> {
        self.inner.reset()
    }

    /// Generation counter; bumped by every reset.
    pub fn instance_index(&self) -> u64 {
        self.inner.instance_index.load(Ordering::SeqCst)
    }

    pub fn add_parent_watcher(&self, watcher: Arc<dyn Watcher>) -> ListenerHandle {
        self.inner.parent_watchers.add(watcher)
    }

    pub fn remove_parent_watcher(&self, handle: ListenerHandle) -> bool {
        self.inner.parent_watchers.remove(handle)
    }

    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.connection_timeout
    }

    /// Session timeout negotiated on the last successful connect (zero before that).
    pub fn negotiated_session_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.negotiated_timeout_ms.load(Ordering::SeqCst))
    }

    /// Connect string of the current generation.
    pub fn connection_string(&self) -> Option<String> {
        self.inner.handle.connection_string()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.inner.handle.session_id()
    }

    /// Number of buffered background errors awaiting a `get_session` call.
    pub fn pending_background_errors(&self) -> usize {
        lock(&self.inner.background_errors).len()
    }
}

impl Inner {
    fn reset(&self) -> Result<(), Error> {
        let _guard = lock(&self.reset_lock);
        tracing::debug!("reset");
        self.instance_index.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.connection_start) = Instant::now();
        self.handle.close_and_reset();
        self.handle.session().map(|_| ())
    }

    fn check_timeouts(&self) -> Result<(), Error> {
        let _guard = lock(&self.timeouts_lock);
        let min_timeout = self.session_timeout.min(self.connection_timeout);
        let elapsed = lock(&self.connection_start).elapsed();
        if elapsed < min_timeout {
            return Ok(());
        }

        if let Some(connection_string) = self.handle.new_connection_string() {
            self.handle_new_connection_string(connection_string);
            return Ok(());
        }

        let max_timeout = self.session_timeout.max(self.connection_timeout);
        if elapsed > max_timeout {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                max_timeout_ms = max_timeout.as_millis() as u64,
                "connection attempt unsuccessful past max timeout; resetting connection"
            );
            return self.reset();
        }

        let err = Error::ConnectionTimeout {
            connect_string: self.handle.connection_string().unwrap_or_default(),
            timeout: self.connection_timeout,
            elapsed,
        };
        tracing::error!(error = %err, "connection timed out");
        self.tracer.event("connections-timed-out").commit();
        Err(err)
    }

    fn process(&self, event: &WatchedEvent) {
        tracing::debug!(?event, "connection watcher event");
        if event.event_type == EventType::None {
            let was_connected = self.connected.load(Ordering::SeqCst);
            let now_connected = self.check_state(event.state, was_connected);
            if now_connected != was_connected {
                self.connected.store(now_connected, Ordering::SeqCst);
                *lock(&self.connection_start) = Instant::now();
                if now_connected {
                    let negotiated = self.handle.negotiated_session_timeout();
                    self.negotiated_timeout_ms.store(negotiated.as_millis() as u64, Ordering::SeqCst);
                    tracing::debug!(negotiated_ms = negotiated.as_millis() as u64, "negotiated session timeout");
                }
            }
        }

        let session_id = self.handle.session_id();
        self.parent_watchers.for_each(|watcher| {
            let mut trace = self.tracer.start("connection-state-parent-process");
            if let Some(id) = session_id {
                trace = trace.with_session_id(id);
            }
            watcher.process(event);
            trace.commit();
        });
    }

    fn check_state(&self, state: KeeperState, was_connected: bool) -> bool {
        let mut connected = was_connected;
        let mut check_connection_string = true;
        match state {
            KeeperState::Disconnected | KeeperState::Closed => connected = false,
            KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => connected = true,
            KeeperState::AuthFailed => {
                connected = false;
                tracing::error!("authentication failed");
            }
            KeeperState::Expired => {
                connected = false;
                check_connection_string = false;
                self.handle_expired_session();
            }
            KeeperState::SaslAuthenticated => {}
        }

        if check_connection_string {
            if let Some(connection_string) = self.handle.new_connection_string() {
                self.handle_new_connection_string(connection_string);
            }
        }
        connected
    }

    fn handle_new_connection_string(&self, connection_string: String) {
        tracing::info!(connection_string = %connection_string, "connection string changed");
        self.tracer.event("connection-string-changed").commit();

        let result = if self.ensemble.update_server_list_enabled() {
            match self.handle.existing_session() {
                Some(session) => session
                    .update_server_list(&connection_string)
                    .map(|()| self.handle.record_connection_string(connection_string)),
                None => {
                    tracing::warn!("no session to update; new connect string applies on next reset");
                    Ok(())
                }
            }
        } else {
            self.reset()
        };

        if let Err(err) = result {
            self.queue_background_error(err);
        }
    }

    fn handle_expired_session(&self) {
        tracing::warn!("session expired event received");
        self.tracer.event("session-expired").commit();
        if let Err(err) = self.reset() {
            self.queue_background_error(err);
        }
    }

    fn queue_background_error(&self, err: Error) {
        let mut errors = lock(&self.background_errors);
        while errors.len() >= self.max_background_errors {
            if let Some(dropped) = errors.pop_front() {
                tracing::debug!(error = %dropped, "dropping oldest background error");
            }
        }
        errors.push_back(err);
    }
}
