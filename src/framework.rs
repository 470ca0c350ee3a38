//! The framework: client, connection states and background scheduler together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sessionkeeper::{ExponentialBackoffRetry, Framework};
//! # use sessionkeeper::SessionFactory;
//! # async fn demo(factory: Arc<dyn SessionFactory>) -> Result<(), sessionkeeper::Error> {
//! let framework = Framework::builder()
//!     .connect_string("zk1:2181,zk2:2181")
//!     .session_factory(factory)
//!     .retry_policy(ExponentialBackoffRetry::new(Duration::from_millis(100), 5))
//!     .build()?;
//! framework.start()?;
//! framework.block_until_connected(Some(Duration::from_secs(10))).await;
//! framework.close();
//! # Ok(())
//! # }
//! ```

use crate::background::{self, OperationQueue};
use crate::client::{ClientConfig, ResilientClient, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_SESSION_TIMEOUT};
use crate::connection::DEFAULT_MAX_BACKGROUND_ERRORS;
use crate::ensemble::{EnsembleProvider, FixedEnsembleProvider};
use crate::error::{Code, Error};
use crate::event::{ClientEvent, ClientListener, EventKind, UnhandledErrorListener};
use crate::listener::{ListenerContainer, ListenerHandle};
use crate::retry_policy::RetryPolicy;
use crate::session::{SessionFactory, WatchedEvent, Watcher};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::state::{
    ConnectionStateListener, ConnectionStateManager, StateManagerConfig, DEFAULT_SESSION_EXPIRATION_PERCENT,
    DEFAULT_STATE_QUEUE_SIZE,
};
use crate::tracer::Tracer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const LIFECYCLE_LATENT: u8 = 0;
const LIFECYCLE_STARTED: u8 = 1;
const LIFECYCLE_STOPPED: u8 = 2;

/// Lifecycle of a [`Framework`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkState {
    Latent,
    Started,
    Stopped,
}

impl FrameworkState {
    fn to_u8(self) -> u8 {
        match self {
            FrameworkState::Latent => LIFECYCLE_LATENT,
            FrameworkState::Started => LIFECYCLE_STARTED,
            FrameworkState::Stopped => LIFECYCLE_STOPPED,
        }
    }
}

fn u8_to_state(value: u8) -> FrameworkState {
    match value {
        LIFECYCLE_LATENT => FrameworkState::Latent,
        LIFECYCLE_STARTED => FrameworkState::Started,
        _ => FrameworkState::Stopped,
    }
}

pub(crate) struct FrameworkInner {
    pub(crate) client: ResilientClient,
    pub(crate) state: ConnectionStateManager,
    pub(crate) queue: Arc<OperationQueue>,
    pub(crate) listeners: ListenerContainer<dyn ClientListener>,
    pub(crate) unhandled_error_listeners: ListenerContainer<dyn UnhandledErrorListener>,
    pub(crate) log_connection_loss_as_error: AtomicBool,
    lifecycle: AtomicU8,
}

/// Forwards session events into the framework without keeping it alive.
struct FrameworkWatcher(Weak<FrameworkInner>);

impl Watcher for FrameworkWatcher {
    fn process(&self, event: &WatchedEvent) {
        if let Some(inner) = self.0.upgrade() {
            Framework::from_inner(inner).process_event(&ClientEvent::watched(event.clone()));
        }
    }
}

/// Connection-managed client with connection-state notifications and background
/// operations. Cheap to clone.
#[derive(Clone)]
pub struct Framework {
    pub(crate) inner: Arc<FrameworkInner>,
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framework")
            .field("state", &self.state())
            .field("client", &self.inner.client)
            .field("pending_operations", &self.pending_operations())
            .finish()
    }
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<FrameworkInner>) -> Self {
        Self { inner }
    }

    fn new(client: ResilientClient, state_config: StateManagerConfig) -> Result<Self, Error> {
        let state = ConnectionStateManager::new(client.clone(), state_config)?;
        let inner = Arc::new(FrameworkInner {
            client: client.clone(),
            state,
            queue: Arc::new(OperationQueue::new()),
            listeners: ListenerContainer::new(),
            unhandled_error_listeners: ListenerContainer::new(),
            log_connection_loss_as_error: AtomicBool::new(true),
            lifecycle: AtomicU8::new(FrameworkState::Latent.to_u8()),
        });
        client.add_parent_watcher(Arc::new(FrameworkWatcher(Arc::downgrade(&inner))));
        Ok(Self { inner })
    }

    /// Connect and start both workers. Must be called within a tokio runtime; a
    /// framework starts once.
    pub fn start(&self) -> Result<(), Error> {
        self.inner
            .lifecycle
            .compare_exchange(
                FrameworkState::Latent.to_u8(),
                FrameworkState::Started.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::AlreadyStarted)?;
        tracing::info!("starting framework");

        self.inner.state.start()?;
        self.inner.client.start()?;
        tokio::spawn(background::run_worker(
            Arc::downgrade(&self.inner),
            self.inner.queue.clone(),
            self.inner.client.shutdown().clone(),
        ));
        Ok(())
    }

    /// Stop everything; idempotent. Listeners see a final `Closing` event.
    pub fn close(&self) {
        let previous = self.inner.lifecycle.swap(FrameworkState::Stopped.to_u8(), Ordering::SeqCst);
        if u8_to_state(previous) == FrameworkState::Stopped {
            return;
        }
        tracing::info!("closing framework");
        if u8_to_state(previous) == FrameworkState::Started {
            self.process_event(&ClientEvent::new(EventKind::Closing, Code::Ok));
        }
        self.inner.listeners.clear();
        self.inner.unhandled_error_listeners.clear();
        self.inner.state.close();
        self.inner.client.close();
        self.inner.queue.clear();
    }

    pub fn state(&self) -> FrameworkState {
        u8_to_state(self.inner.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_started(&self) -> bool {
        self.state() == FrameworkState::Started
    }

    pub fn client(&self) -> &ResilientClient {
        &self.inner.client
    }

    pub fn connection_state_manager(&self) -> &ConnectionStateManager {
        &self.inner.state
    }

    pub fn add_connection_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerHandle {
        self.inner.state.add_listener(listener)
    }

    pub fn remove_connection_state_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.state.remove_listener(handle)
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) -> ListenerHandle {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.remove(handle)
    }

    pub fn add_unhandled_error_listener(&self, listener: Arc<dyn UnhandledErrorListener>) -> ListenerHandle {
        self.inner.unhandled_error_listeners.add(listener)
    }

    pub fn remove_unhandled_error_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.unhandled_error_listeners.remove(handle)
    }

    /// See [`ConnectionStateManager::block_until_connected`].
    pub async fn block_until_connected(&self, max_wait: Option<Duration>) -> bool {
        self.inner.state.block_until_connected(max_wait).await
    }
}

/// Builder for [`Framework`]; see the module example.
#[derive(Clone)]
pub struct FrameworkBuilder {
    connect_string: Option<String>,
    ensemble: Option<Arc<dyn EnsembleProvider>>,
    factory: Option<Arc<dyn SessionFactory>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    session_timeout: Duration,
    connection_timeout: Duration,
    default_watcher: Option<Arc<dyn Watcher>>,
    can_be_read_only: bool,
    max_background_errors: usize,
    state_queue_size: usize,
    session_expiration_percent: u32,
    tracer: Tracer,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for FrameworkBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkBuilder")
            .field("connect_string", &self.connect_string)
            .field("ensemble", &self.ensemble)
            .field("retry_policy", &self.retry_policy)
            .field("session_timeout", &self.session_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("can_be_read_only", &self.can_be_read_only)
            .field("max_background_errors", &self.max_background_errors)
            .field("state_queue_size", &self.state_queue_size)
            .field("session_expiration_percent", &self.session_expiration_percent)
            .finish()
    }
}

impl Default for FrameworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkBuilder {
    pub fn new() -> Self {
        Self {
            connect_string: None,
            ensemble: None,
            factory: None,
            retry_policy: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            default_watcher: None,
            can_be_read_only: false,
            max_background_errors: DEFAULT_MAX_BACKGROUND_ERRORS,
            state_queue_size: DEFAULT_STATE_QUEUE_SIZE,
            session_expiration_percent: DEFAULT_SESSION_EXPIRATION_PERCENT,
            tracer: Tracer::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Fixed connect string; ignored when an ensemble provider is set.
    pub fn connect_string(mut self, connect_string: impl Into<String>) -> Self {
        self.connect_string = Some(connect_string.into());
        self
    }

    pub fn ensemble_provider(mut self, ensemble: Arc<dyn EnsembleProvider>) -> Self {
        self.ensemble = Some(ensemble);
        self
    }

    /// The wire client that creates sessions.
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn retry_policy_arc(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
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

    pub fn state_queue_size(mut self, size: usize) -> Self {
        self.state_queue_size = size;
        self
    }

    /// Percentage of the negotiated session timeout a connection may stay suspended
    /// before it is reported lost; 0 disables.
    pub fn session_expiration_percent(mut self, percent: u32) -> Self {
        self.session_expiration_percent = percent;
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

    pub fn build(self) -> Result<Framework, Error> {
        let ensemble: Arc<dyn EnsembleProvider> = match (self.ensemble, self.connect_string) {
            (Some(ensemble), _) => ensemble,
            (None, Some(connect_string)) => Arc::new(FixedEnsembleProvider::new(connect_string)?),
            (None, None) => return Err(Error::InvalidConfig("connection string or ensemble provider is required".into())),
        };
        let factory = self
            .factory
            .ok_or_else(|| Error::InvalidConfig("session factory is required".into()))?;
        let retry_policy = self
            .retry_policy
            .ok_or_else(|| Error::InvalidConfig("retry policy is required".into()))?;

        let mut config = ClientConfig::with_ensemble(ensemble, factory, retry_policy)
            .session_timeout(self.session_timeout)
            .connection_timeout(self.connection_timeout)
            .can_be_read_only(self.can_be_read_only)
            .max_background_errors(self.max_background_errors)
            .tracer(self.tracer)
            .sleeper(self.sleeper);
        if let Some(watcher) = self.default_watcher {
            config = config.default_watcher(watcher);
        }
        let client = ResilientClient::new(config)?;

        Framework::new(
            client,
            StateManagerConfig {
                queue_size: self.state_queue_size,
                session_expiration_percent: self.session_expiration_percent,
            },
        )
    }
}
