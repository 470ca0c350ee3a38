//! Client-facing connection states and their dispatch.
//!
//! Raw session events are folded into five [`ConnectionState`]s. Producers call
//! [`ConnectionStateManager::add_state_change`] or
//! [`ConnectionStateManager::set_to_suspended`]; both only enqueue. A single dispatch
//! task drains the bounded queue and calls every listener in turn.
//!
//! Invariants:
//! - Re-posting the current state is a no-op.
//! - The first non-negative state ever posted reaches listeners as `Connected`.
//! - A full queue drops its oldest entry; posting never waits.
//! - A session suspended for longer than the (scaled) negotiated session timeout is
//!   reported `Lost` once and the connection is reset.

use crate::client::ResilientClient;
use crate::error::{Error, ListenerError};
use crate::listener::{ListenerContainer, ListenerHandle};
use crate::sleeper::Shutdown;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

pub const DEFAULT_STATE_QUEUE_SIZE: usize = 25;
pub const DEFAULT_SESSION_EXPIRATION_PERCENT: u32 = 100;

const LIFECYCLE_LATENT: u8 = 0;
const LIFECYCLE_STARTED: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// Connection state as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// First successful connection.
    Connected,
    /// Connection lost; the session may still be alive.
    Suspended,
    /// Connection re-established after a suspension or loss.
    Reconnected,
    /// The session is considered gone.
    Lost,
    /// Connected to a read-only server.
    ReadOnly,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected | ConnectionState::ReadOnly)
    }

    fn is_negative(self) -> bool {
        matches!(self, ConnectionState::Lost | ConnectionState::Suspended | ConnectionState::ReadOnly)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Suspended => "SUSPENDED",
            ConnectionState::Reconnected => "RECONNECTED",
            ConnectionState::Lost => "LOST",
            ConnectionState::ReadOnly => "READ_ONLY",
        };
        f.write_str(name)
    }
}

/// Receives connection state changes on the dispatch task.
pub trait ConnectionStateListener: Send + Sync {
    fn state_changed(&self, new_state: ConnectionState) -> Result<(), ListenerError>;
}

impl<F> ConnectionStateListener for F
where
    F: Fn(ConnectionState) -> Result<(), ListenerError> + Send + Sync,
{
    fn state_changed(&self, new_state: ConnectionState) -> Result<(), ListenerError> {
        self(new_state)
    }
}

/// Settings for a [`ConnectionStateManager`].
#[derive(Debug, Clone, Copy)]
pub struct StateManagerConfig {
    pub queue_size: usize,
    /// Percentage of the negotiated session timeout after which a suspended
    /// connection is reported lost; 0 disables the check.
    pub session_expiration_percent: u32,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_STATE_QUEUE_SIZE,
            session_expiration_percent: DEFAULT_SESSION_EXPIRATION_PERCENT,
        }
    }
}

#[derive(Debug, Default)]
struct Current {
    state: Option<ConnectionState>,
    suspended_since: Option<Instant>,
}

struct StateInner {
    client: ResilientClient,
    lifecycle: AtomicU8,
    current: Mutex<Current>,
    initial_connect_sent: AtomicBool,
    queue: Mutex<VecDeque<ConnectionState>>,
    config: StateManagerConfig,
    posted: Notify,
    connected: watch::Sender<bool>,
    listeners: ListenerContainer<dyn ConnectionStateListener>,
    shutdown: Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Funnel from session events to connection-state listeners.
#[derive(Clone)]
pub struct ConnectionStateManager {
    inner: Arc<StateInner>,
}

impl fmt::Debug for ConnectionStateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateManager")
            .field("state", &self.current_state())
            .field("listeners", &self.inner.listeners.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ConnectionStateManager {
    pub fn new(client: ResilientClient, config: StateManagerConfig) -> Result<Self, Error> {
        if config.queue_size == 0 {
            return Err(Error::InvalidConfig("connection state queue size must be > 0".into()));
        }
        if config.session_expiration_percent > 100 {
            return Err(Error::InvalidConfig("session expiration percent must be 0..=100".into()));
        }
        let (connected, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(StateInner {
                client,
                lifecycle: AtomicU8::new(LIFECYCLE_LATENT),
                current: Mutex::new(Current::default()),
                initial_connect_sent: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::with_capacity(config.queue_size)),
                config,
                posted: Notify::new(),
                connected,
                listeners: ListenerContainer::new(),
                shutdown: Shutdown::new(),
            }),
        })
    }

    /// Spawn the dispatch task. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), Error> {
        self.inner
            .lifecycle
            .compare_exchange(LIFECYCLE_LATENT, LIFECYCLE_STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyStarted)?;
        tokio::spawn(dispatch(self.inner.clone()));
        Ok(())
    }

    /// Stop dispatching and drop every listener; idempotent.
    pub fn close(&self) {
        if self.inner.lifecycle.swap(LIFECYCLE_CLOSED, Ordering::SeqCst) == LIFECYCLE_STARTED {
            tracing::debug!("closing connection state manager");
        }
        self.inner.shutdown.trigger();
        self.inner.listeners.clear();
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionStateListener>) -> ListenerHandle {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.listeners.remove(handle)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn current_state(&self) -> Option<ConnectionState> {
        lock(&self.inner.current).state
    }

    pub fn is_connected(&self) -> bool {
        self.current_state().is_some_and(ConnectionState::is_connected)
    }

    /// Move to `Suspended` if currently connected; returns whether it moved.
    pub fn set_to_suspended(&self) -> bool {
        self.inner.set_to_suspended()
    }

    /// Record a new state; returns `false` for a repeat or when not started.
    pub fn add_state_change(&self, new_state: ConnectionState) -> bool {
        self.inner.add_state_change(new_state)
    }

    /// Wait until a connected state is posted, for at most `max_wait` if given.
    /// Returns whether the manager is connected afterwards.
    pub async fn block_until_connected(&self, max_wait: Option<Duration>) -> bool {
        let mut rx = self.inner.connected.subscribe();
        let wait = async {
            let _ = rx.wait_for(|connected| *connected).await;
        };
        tokio::select! {
            _ = async {
                match max_wait {
                    Some(limit) => {
                        let _ = tokio::time::timeout(limit, wait).await;
                    }
                    None => wait.await,
                }
            } => {}
            _ = self.inner.shutdown.closed() => {}
        }
        self.is_connected()
    }
}

impl StateInner {
    fn is_started(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_STARTED
    }

    fn set_to_suspended(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        let mut current = lock(&self.current);
        if !current.state.is_some_and(ConnectionState::is_connected) {
            return false;
        }
        current.state = Some(ConnectionState::Suspended);
        current.suspended_since = Some(Instant::now());
        // Posting under the `current` lock keeps queue order equal to update order.
        self.post_state(ConnectionState::Suspended);
        true
    }

    fn add_state_change(&self, new_state: ConnectionState) -> bool {
        if !self.is_started() {
            return false;
        }
        let mut current = lock(&self.current);
        if current.state == Some(new_state) {
            return false;
        }
        let previous = current.state.replace(new_state);
        current.suspended_since = (new_state == ConnectionState::Suspended).then(Instant::now);

        let mut posted = new_state;
        if !new_state.is_negative()
            && self
                .initial_connect_sent
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            posted = ConnectionState::Connected;
        }
        tracing::debug!(?previous, %new_state, %posted, "connection state change");
        self.post_state(posted);
        drop(current);
        true
    }

    fn post_state(&self, state: ConnectionState) {
        tracing::info!(state = %state, "state change");
        self.connected.send_replace(state.is_connected());
        {
            let mut queue = lock(&self.queue);
            while queue.len() >= self.config.queue_size {
                queue.pop_front();
                tracing::warn!("connection state queue full; dropping oldest state to make room");
            }
            queue.push_back(state);
        }
        self.posted.notify_one();
    }

    fn session_timeout_in_use(&self) -> Duration {
        let negotiated = self.client.negotiated_session_timeout();
        if negotiated.is_zero() {
            self.client.session_timeout()
        } else {
            negotiated
        }
    }

    fn poll_interval(&self) -> Duration {
        (self.session_timeout_in_use() * 2 / 3).max(Duration::from_millis(1))
    }

    fn on_idle(&self) {
        let (state, suspended_since) = {
            let current = lock(&self.current);
            (current.state, current.suspended_since)
        };

        if state == Some(ConnectionState::Lost) && self.client.is_connected() {
            tracing::warn!("connection state is LOST but the client reports connected; forcing RECONNECTED");
            self.add_state_change(ConnectionState::Reconnected);
            return;
        }

        let (Some(ConnectionState::Suspended), Some(since)) = (state, suspended_since) else {
            return;
        };
        let percent = self.config.session_expiration_percent;
        if percent == 0 {
            return;
        }
        let limit = self.session_timeout_in_use() * percent / 100;
        let elapsed = since.elapsed();
        if elapsed >= limit {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                session_timeout_ms = limit.as_millis() as u64,
                "session timeout elapsed while SUSPENDED; treating session as lost"
            );
            self.add_state_change(ConnectionState::Lost);
            if let Err(err) = self.client.connection_manager().reset() {
                tracing::error!(error = %err, "reset after suspended session expiration failed");
            }
        }
    }

    fn dispatch_one(&self, state: ConnectionState) {
        if self.listeners.is_empty() {
            tracing::warn!(state = %state, "no connection state listeners registered");
        }
        self.listeners.for_each(|listener| {
            if let Err(err) = listener.state_changed(state) {
                tracing::error!(error = %err, state = %state, "connection state listener failed");
            }
        });
    }
}

async fn dispatch(inner: Arc<StateInner>) {
    while inner.is_started() {
        let next = lock(&inner.queue).pop_front();
        match next {
            Some(state) => inner.dispatch_one(state),
            None => {
                tokio::select! {
                    _ = inner.posted.notified() => {}
                    _ = tokio::time::sleep(inner.poll_interval()) => inner.on_idle(),
                    _ = inner.shutdown.closed() => break,
                }
            }
        }
    }
    tracing::debug!("connection state dispatch exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::retry_policy::RetryOneTime;
    use crate::testing::FakeEnsemble;

    fn client(ensemble: &FakeEnsemble) -> ResilientClient {
        let config = ClientConfig::new(
            "a:2181",
            Arc::new(ensemble.clone()),
            Arc::new(RetryOneTime::new(Duration::ZERO)),
        )
        .unwrap()
        .session_timeout(Duration::from_secs(3))
        .connection_timeout(Duration::from_secs(3));
        let client = ResilientClient::new(config).unwrap();
        client.start().unwrap();
        client
    }

    fn recorder(manager: &ConnectionStateManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.add_listener(Arc::new(move |state: ConnectionState| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(state);
            Ok(())
        }));
        seen
    }

    #[test]
    fn connected_states() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnected.is_connected());
        assert!(ConnectionState::ReadOnly.is_connected());
        assert!(!ConnectionState::Suspended.is_connected());
        assert!(!ConnectionState::Lost.is_connected());
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let ensemble = FakeEnsemble::new();
        let bad_queue = StateManagerConfig { queue_size: 0, ..Default::default() };
        assert!(ConnectionStateManager::new(client(&ensemble), bad_queue).is_err());
        let bad_percent = StateManagerConfig { session_expiration_percent: 101, ..Default::default() };
        assert!(ConnectionStateManager::new(client(&ensemble), bad_percent).is_err());
    }

    #[tokio::test]
    async fn changes_ignored_until_started() {
        let ensemble = FakeEnsemble::new();
        let manager = ConnectionStateManager::new(client(&ensemble), StateManagerConfig::default()).unwrap();
        assert!(!manager.add_state_change(ConnectionState::Connected));
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(Error::AlreadyStarted)));
        assert!(manager.add_state_change(ConnectionState::Connected));
        manager.close();
        assert!(!manager.add_state_change(ConnectionState::Lost));
    }

    #[tokio::test]
    async fn suspend_only_from_connected_states() {
        let ensemble = FakeEnsemble::new();
        let manager = ConnectionStateManager::new(client(&ensemble), StateManagerConfig::default()).unwrap();
        manager.start().unwrap();

        assert!(!manager.set_to_suspended());
        manager.add_state_change(ConnectionState::Connected);
        assert!(manager.set_to_suspended());
        assert!(!manager.set_to_suspended());
        manager.add_state_change(ConnectionState::Lost);
        assert!(!manager.set_to_suspended());
        manager.add_state_change(ConnectionState::ReadOnly);
        assert!(manager.set_to_suspended());
        manager.close();
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let ensemble = FakeEnsemble::new();
        let config = StateManagerConfig { queue_size: 2, ..Default::default() };
        let manager = ConnectionStateManager::new(client(&ensemble), config).unwrap();
        // Mark started without spawning the dispatcher so the queue is observable.
        manager.inner.lifecycle.store(LIFECYCLE_STARTED, Ordering::SeqCst);

        manager.add_state_change(ConnectionState::Connected);
        manager.add_state_change(ConnectionState::Suspended);
        manager.add_state_change(ConnectionState::Reconnected);

        let queued: Vec<_> = lock(&manager.inner.queue).iter().copied().collect();
        assert_eq!(queued, vec![ConnectionState::Suspended, ConnectionState::Reconnected]);
    }

    #[tokio::test]
    async fn concurrent_producers_keep_queue_in_update_order() {
        let ensemble = FakeEnsemble::new();
        let config = StateManagerConfig { queue_size: 4, ..Default::default() };
        let manager = ConnectionStateManager::new(client(&ensemble), config).unwrap();
        manager.inner.lifecycle.store(LIFECYCLE_STARTED, Ordering::SeqCst);
        manager.add_state_change(ConnectionState::Connected);

        std::thread::scope(|s| {
            for worker in 0..4 {
                let manager = &manager;
                s.spawn(move || {
                    for _ in 0..500 {
                        if worker % 2 == 0 {
                            manager.set_to_suspended();
                        } else {
                            manager.add_state_change(ConnectionState::Reconnected);
                        }
                    }
                });
            }
        });

        let last_queued = lock(&manager.inner.queue).back().copied();
        assert_eq!(last_queued, manager.current_state());
        assert_eq!(*manager.inner.connected.borrow(), manager.is_connected());
    }

    #[tokio::test]
    async fn block_until_connected_times_out() {
        let ensemble = FakeEnsemble::new();
        let manager = ConnectionStateManager::new(client(&ensemble), StateManagerConfig::default()).unwrap();
        manager.start().unwrap();
        assert!(!manager.block_until_connected(Some(Duration::from_millis(20))).await);

        manager.add_state_change(ConnectionState::Reconnected);
        assert!(manager.block_until_connected(None).await);
        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn long_suspension_is_reported_lost() {
        let ensemble = FakeEnsemble::new();
        let client = client(&ensemble);
        ensemble.connect();
        let manager = ConnectionStateManager::new(client.clone(), StateManagerConfig::default()).unwrap();
        let seen = recorder(&manager);
        manager.start().unwrap();

        manager.add_state_change(ConnectionState::Connected);
        manager.set_to_suspended();
        let index = client.instance_index();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Suspended, ConnectionState::Lost]
        );
        assert_eq!(client.instance_index(), index + 1);
        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_percent_disables_expiration() {
        let ensemble = FakeEnsemble::new();
        let client = client(&ensemble);
        ensemble.connect();
        let config = StateManagerConfig { session_expiration_percent: 0, ..Default::default() };
        let manager = ConnectionStateManager::new(client, config).unwrap();
        let seen = recorder(&manager);
        manager.start().unwrap();

        manager.add_state_change(ConnectionState::Connected);
        manager.set_to_suspended();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Connected, ConnectionState::Suspended]);
        manager.close();
    }

    #[tokio::test(start_paused = true)]
    async fn lost_while_connected_forces_reconnected() {
        let ensemble = FakeEnsemble::new();
        let client = client(&ensemble);
        ensemble.connect();
        let manager = ConnectionStateManager::new(client, StateManagerConfig::default()).unwrap();
        let seen = recorder(&manager);
        manager.start().unwrap();

        manager.add_state_change(ConnectionState::Connected);
        manager.add_state_change(ConnectionState::Lost);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Lost, ConnectionState::Reconnected]
        );
        manager.close();
    }
}
