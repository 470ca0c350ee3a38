//! The resilient client: connection manager, retry policy and tracer in one handle.
//!
//! [`ResilientClient`] is what higher layers (and the background scheduler) hold.
//! It is cheap to clone; clones share the connection. A clone created for a
//! session-fail loop additionally carries that loop's [`SessionScope`], so every
//! `get_session` made through it fails fast once the session has expired.

use crate::connection::{ConnectionManager, ConnectionSettings, DEFAULT_MAX_BACKGROUND_ERRORS};
use crate::ensemble::{EnsembleProvider, FixedEnsembleProvider};
use crate::error::Error;
use crate::listener::ListenerHandle;
use crate::retry::RetryLoop;
use crate::retry_policy::RetryPolicy;
use crate::session::{SessionClient, SessionFactory, WatchedEvent, Watcher};
use crate::session_fail::{SessionFailMode, SessionFailRetryLoop, SessionScope};
use crate::sleeper::{Shutdown, Sleeper, TokioSleeper};
use crate::tracer::{OperationTrace, Tracer};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest single wait inside [`ResilientClient::block_until_connected_or_timed_out`].
const MAX_CONNECT_WAIT: Duration = Duration::from_secs(1);

/// Construction parameters for a [`ResilientClient`].
#[derive(Clone)]
pub struct ClientConfig {
    pub ensemble: Arc<dyn EnsembleProvider>,
    pub factory: Arc<dyn SessionFactory>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub default_watcher: Option<Arc<dyn Watcher>>,
    pub can_be_read_only: bool,
    pub max_background_errors: usize,
    pub tracer: Tracer,
    pub sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("ensemble", &self.ensemble)
            .field("retry_policy", &self.retry_policy)
            .field("session_timeout", &self.session_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("can_be_read_only", &self.can_be_read_only)
            .field("max_background_errors", &self.max_background_errors)
            .finish()
    }
}

impl ClientConfig {
    /// Config for a fixed connect string; rejects an empty one.
    pub fn new(
        connect_string: &str,
        factory: Arc<dyn SessionFactory>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Result<Self, Error> {
        let ensemble = Arc::new(FixedEnsembleProvider::new(connect_string)?);
        Ok(Self::with_ensemble(ensemble, factory, retry_policy))
    }

    pub fn with_ensemble(
        ensemble: Arc<dyn EnsembleProvider>,
        factory: Arc<dyn SessionFactory>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            ensemble,
            factory,
            retry_policy,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            default_watcher: None,
            can_be_read_only: false,
            max_background_errors: DEFAULT_MAX_BACKGROUND_ERRORS,
            tracer: Tracer::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn default_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.default_watcher = Some(watcher);
        self
    }

    pub fn can_be_read_only(mut self, allowed: bool) -> Self {
        self.can_be_read_only = allowed;
        self
    }

    pub fn max_background_errors(mut self, max: usize) -> Self {
        self.max_background_errors = max;
        self
    }

    pub fn tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.ensemble.connection_string().trim().is_empty() {
            return Err(Error::InvalidConfig("connection string cannot be empty".into()));
        }
        if self.max_background_errors == 0 {
            return Err(Error::InvalidConfig("max_background_errors must be > 0".into()));
        }
        if self.session_timeout.is_zero() || self.connection_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be > 0".into()));
        }
        Ok(())
    }
}

struct ClientInner {
    connection: ConnectionManager,
    retry_policy: ArcSwap<Arc<dyn RetryPolicy>>,
    sleeper: Arc<dyn Sleeper>,
    tracer: Tracer,
    started: AtomicBool,
    shutdown: Shutdown,
}

/// Connection-aware client handle shared by retry loops and the background scheduler.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<ClientInner>,
    scope: Option<SessionScope>,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("connection", &self.inner.connection)
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

impl ResilientClient {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        if config.session_timeout < config.connection_timeout {
            tracing::warn!(
                session_timeout_ms = config.session_timeout.as_millis() as u64,
                connection_timeout_ms = config.connection_timeout.as_millis() as u64,
                "session timeout is less than connection timeout"
            );
        }

        let connection = ConnectionManager::new(ConnectionSettings {
            factory: config.factory,
            ensemble: config.ensemble,
            session_timeout: config.session_timeout,
            connection_timeout: config.connection_timeout,
            default_watcher: config.default_watcher,
            can_be_read_only: config.can_be_read_only,
            max_background_errors: config.max_background_errors,
            tracer: config.tracer.clone(),
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                retry_policy: ArcSwap::from_pointee(config.retry_policy),
                sleeper: config.sleeper,
                tracer: config.tracer,
                started: AtomicBool::new(false),
                shutdown: Shutdown::new(),
            }),
            scope: None,
        })
    }

    /// Start the connection manager. A client starts once.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.shutdown.is_triggered() {
            return Err(Error::Closed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        tracing::debug!("starting client");
        self.inner.connection.start()
    }

    /// Close the connection and interrupt every pending wait; idempotent.
    pub fn close(&self) {
        tracing::debug!("closing client");
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.shutdown.trigger();
        self.inner.connection.close();
    }

    /// Current session. See [`ConnectionManager::get_session`].
    pub fn get_session(&self) -> Result<Arc<dyn SessionClient>, Error> {
        self.ensure_started()?;
        self.inner.connection.get_session(self.scope.as_ref())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Wait up to the connection timeout for a connection; returns whether connected.
    pub async fn block_until_connected_or_timed_out(&self) -> Result<bool, Error> {
        self.ensure_started()?;
        let trace = self.start_tracer("blockUntilConnectedOrTimedOut");
        self.wait_for_connection().await?;
        trace.commit();

        let connected = self.is_connected();
        tracing::debug!(connected, "block_until_connected_or_timed_out finished");
        Ok(connected)
    }

    async fn wait_for_connection(&self) -> Result<(), Error> {
        let mut remaining = self.inner.connection.connection_timeout();
        while !self.is_connected() && !remaining.is_zero() {
            let notify = Arc::new(Notify::new());
            let signal = notify.clone();
            let handle = self
                .inner
                .connection
                .add_parent_watcher(Arc::new(move |_: &WatchedEvent| signal.notify_one()));

            let started = Instant::now();
            let wait = remaining.min(MAX_CONNECT_WAIT);
            let closed = tokio::select! {
                _ = notify.notified() => false,
                _ = tokio::time::sleep(wait) => false,
                _ = self.inner.shutdown.closed() => true,
            };
            self.inner.connection.remove_parent_watcher(handle);
            if closed {
                return Err(Error::Closed);
            }

            let elapsed = started.elapsed().max(Duration::from_millis(1));
            remaining = remaining.saturating_sub(elapsed);
        }
        Ok(())
    }

    pub fn new_retry_loop(&self) -> RetryLoop {
        RetryLoop::new(
            self.retry_policy(),
            self.inner.sleeper.clone(),
            self.inner.shutdown.clone(),
            self.inner.tracer.clone(),
        )
    }

    pub fn new_session_fail_retry_loop(&self, mode: SessionFailMode) -> SessionFailRetryLoop {
        SessionFailRetryLoop::new(self.clone(), mode)
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::clone(&**self.inner.retry_policy.load())
    }

    /// Swap the policy used by retry loops created from now on.
    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        self.inner.retry_policy.store(Arc::new(policy));
    }

    pub fn start_tracer(&self, name: &'static str) -> OperationTrace {
        self.inner.tracer.start(name)
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.inner.sleeper.clone()
    }

    pub fn instance_index(&self) -> u64 {
        self.inner.connection.instance_index()
    }

    pub fn add_parent_watcher(&self, watcher: Arc<dyn Watcher>) -> ListenerHandle {
        self.inner.connection.add_parent_watcher(watcher)
    }

    pub fn remove_parent_watcher(&self, handle: ListenerHandle) -> bool {
        self.inner.connection.remove_parent_watcher(handle)
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.connection.connection_timeout()
    }

    pub fn session_timeout(&self) -> Duration {
        self.inner.connection.session_timeout()
    }

    pub fn negotiated_session_timeout(&self) -> Duration {
        self.inner.connection.negotiated_session_timeout()
    }

    pub fn connection_string(&self) -> Option<String> {
        self.inner.connection.connection_string()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.inner.connection.session_id()
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// Clone of this client whose sessions are checked against `scope`.
    pub(crate) fn scoped(&self, scope: SessionScope) -> Self {
        Self { inner: self.inner.clone(), scope: Some(scope) }
    }

    fn ensure_started(&self) -> Result<(), Error> {
        if self.inner.shutdown.is_triggered() {
            return Err(Error::Closed);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        Ok(())
    }
}
