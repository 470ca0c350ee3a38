//! Background operation scheduler.
//!
//! Work submitted through [`Framework::queue_operation`] is wrapped in an
//! [`OperationAndData`] and pushed into a delay queue ordered by `(ready_at, ordinal)`.
//! One worker task per framework takes ready entries and performs them:
//!
//! - connected: the operation runs on its own task and its result re-enters the
//!   scheduler;
//! - not connected: the session is touched (so timeouts and resets happen) and the
//!   entry is re-queued one second later, or treated as a connection loss once the
//!   connection timeout has passed since it was created.
//!
//! Retryable results consult the client's retry policy. The policy only computes a
//! delay; the scheduler stores it as the entry's new ready time and re-queues it.
//! Exhausted entries get their error callback exactly once, the implied wire state is
//! pushed into the connection state manager, and the failure is logged and handed to
//! unhandled-error listeners.

/// Built-in operations.
pub mod operation;
pub(crate) mod queue;

use crate::error::{Code, Error, ListenerError};
use crate::event::{ClientEvent, EventKind};
use crate::framework::{Framework, FrameworkInner};
use crate::session::{KeeperState, SessionClient};
use crate::sleeper::Shutdown;
use crate::state::ConnectionState;
use async_trait::async_trait;
use operation::SyncOperation;
use queue::DelayQueue;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Delay before an entry is retried when no connection is available.
const NOT_CONNECTED_RETRY_DELAY: Duration = Duration::from_secs(1);

static NEXT_ORDINAL: AtomicU64 = AtomicU64::new(0);

fn next_ordinal() -> u64 {
    NEXT_ORDINAL.fetch_add(1, Ordering::SeqCst)
}

/// Success/result callback of a background entry.
pub type BackgroundCallback = Arc<dyn Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Called once when an entry's retries are exhausted.
pub type ErrorCallback<T> = Arc<dyn Fn(&OperationAndData<T>) + Send + Sync>;

/// Asynchronous operation performed against the current session.
#[async_trait]
pub trait BackgroundOperation<T>: Send + Sync {
    /// Kind reported in events built from this operation's failures.
    fn kind(&self) -> EventKind;

    async fn perform(&self, session: Arc<dyn SessionClient>, data: &T) -> Result<ClientEvent, Error>;
}

/// A unit of deferred work plus its retry bookkeeping.
pub struct OperationAndData<T> {
    operation: Arc<dyn BackgroundOperation<T>>,
    data: T,
    callback: Option<BackgroundCallback>,
    error_callback: Option<ErrorCallback<T>>,
    context: Option<Arc<dyn Any + Send + Sync>>,
    retry_count: u32,
    created: Instant,
    ready_at: Instant,
    ordinal: u64,
}

impl<T: fmt::Debug> fmt::Debug for OperationAndData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationAndData")
            .field("data", &self.data)
            .field("retry_count", &self.retry_count)
            .field("ordinal", &self.ordinal)
            .field("has_callback", &self.callback.is_some())
            .field("has_error_callback", &self.error_callback.is_some())
            .finish()
    }
}

impl<T: Send + Sync> OperationAndData<T> {
    pub fn new(operation: Arc<dyn BackgroundOperation<T>>, data: T) -> Self {
        let now = Instant::now();
        Self {
            operation,
            data,
            callback: None,
            error_callback: None,
            context: None,
            retry_count: 0,
            created: now,
            ready_at: now,
            ordinal: next_ordinal(),
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OperationAndData<T>) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_context(mut self, context: Arc<dyn Any + Send + Sync>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn context(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.context.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// Time since creation (or the last [`OperationAndData::reset`]).
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Start over: new ordinal, creation time and retry count.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.retry_count = 0;
        self.created = now;
        self.ready_at = now;
        self.ordinal = next_ordinal();
    }

    fn delay_by(&mut self, delay: Duration) {
        self.ready_at = Instant::now() + delay;
    }

    fn next_retry_count(&mut self) -> u32 {
        let count = self.retry_count;
        self.retry_count = self.retry_count.saturating_add(1);
        count
    }
}

/// Type-erased queue entry.
pub(crate) trait PendingOperation: Send {
    fn perform(self: Box<Self>, framework: &Framework);
}

impl<T: Send + Sync + 'static> PendingOperation for OperationAndData<T> {
    fn perform(self: Box<Self>, framework: &Framework) {
        framework.perform_background_operation(*self);
    }
}

pub(crate) type OperationQueue = DelayQueue<Box<dyn PendingOperation>>;

/// Map a result code to the session state it implies.
pub(crate) fn code_to_state(code: Code) -> Option<KeeperState> {
    match code {
        Code::AuthFailed | Code::NoAuth => Some(KeeperState::AuthFailed),
        Code::ConnectionLoss | Code::OperationTimeout => Some(KeeperState::Disconnected),
        Code::SessionExpired => Some(KeeperState::Expired),
        Code::Ok | Code::SessionMoved => Some(KeeperState::SyncConnected),
        _ => None,
    }
}

/// Worker loop: one per framework, the only consumer of its queue.
pub(crate) async fn run_worker(weak: Weak<FrameworkInner>, queue: Arc<OperationQueue>, shutdown: Shutdown) {
    loop {
        let entry = tokio::select! {
            entry = queue.take() => entry,
            _ = shutdown.closed() => break,
        };
        let Some(inner) = weak.upgrade() else { break };
        let framework = Framework::from_inner(inner);
        if !framework.is_started() {
            break;
        }
        entry.perform(&framework);
    }
    tracing::debug!("background worker exited");
}

impl Framework {
    /// Queue `entry` for the background worker; `false` unless the framework is started.
    pub fn queue_operation<T: Send + Sync + 'static>(&self, entry: OperationAndData<T>) -> bool {
        if !self.is_started() {
            tracing::debug!(ordinal = entry.ordinal, "framework not started; dropping background operation");
            return false;
        }
        self.inner.queue.push(entry.ready_at, entry.ordinal, Box::new(entry));
        true
    }

    /// Entries waiting in the background queue.
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.len()
    }

    pub(crate) fn perform_background_operation<T: Send + Sync + 'static>(&self, mut entry: OperationAndData<T>) {
        let client = &self.inner.client;
        if client.is_connected() {
            let framework = self.clone();
            tokio::spawn(async move { framework.run_operation(entry).await });
            return;
        }

        // Touch the session so resets and connection timeouts are applied.
        match client.get_session() {
            Ok(_) => {}
            Err(e) if e.is_connection_timeout() => return self.background_connection_loss(entry),
            Err(e) => return self.handle_background_exception(entry, e),
        }

        if entry.elapsed() >= client.connection_timeout() {
            return self.background_connection_loss(entry);
        }
        tracing::trace!(ordinal = entry.ordinal, "not connected; deferring background operation");
        entry.delay_by(NOT_CONNECTED_RETRY_DELAY);
        self.queue_operation(entry);
    }

    async fn run_operation<T: Send + Sync + 'static>(self, entry: OperationAndData<T>) {
        let session = match self.inner.client.get_session() {
            Ok(session) => session,
            Err(e) => return self.handle_background_exception(entry, e),
        };
        let result = entry.operation.perform(session, &entry.data).await;
        self.process_background_result(entry, result);
    }

    fn background_connection_loss<T: Send + Sync + 'static>(&self, entry: OperationAndData<T>) {
        let event = ClientEvent::connection_loss(entry.context.clone());
        if let Some(entry) = self.check_background_retry(entry, &event) {
            self.queue_operation(entry);
        }
    }

    fn process_background_result<T: Send + Sync + 'static>(
        &self,
        entry: OperationAndData<T>,
        result: Result<ClientEvent, Error>,
    ) {
        let event = match result {
            Ok(event) => event.with_context(entry.context.clone()),
            Err(e) => match e.keeper_code() {
                Some(code) => {
                    let mut event = ClientEvent::new(entry.operation.kind(), code).with_context(entry.context.clone());
                    if let Error::Keeper { path: Some(path), .. } = e {
                        event = event.with_path(path);
                    }
                    event
                }
                None => return self.handle_background_exception(entry, e),
            },
        };

        if event.code != Code::Ok && event.code.is_retryable() {
            if let Some(entry) = self.check_background_retry(entry, &event) {
                self.queue_operation(entry);
            }
            return;
        }
        if entry.callback.is_some() {
            self.send_to_callback(entry, &event);
            return;
        }
        self.process_event(&event);
    }

    /// Consult the retry policy. Returns the entry (with its new ready time) when it
    /// should be queued again.
    fn check_background_retry<T: Send + Sync + 'static>(
        &self,
        mut entry: OperationAndData<T>,
        event: &ClientEvent,
    ) -> Option<OperationAndData<T>> {
        let attempt = entry.next_retry_count();
        if let Some(delay) = self.inner.client.retry_policy().retry_delay(attempt, entry.elapsed()) {
            tracing::debug!(ordinal = entry.ordinal, attempt, delay_ms = delay.as_millis() as u64, "retrying background operation");
            entry.delay_by(delay);
            return Some(entry);
        }

        if let Some(error_callback) = entry.error_callback.clone() {
            error_callback(&entry);
        }
        let err = Error::Keeper { code: event.code, path: event.path.clone() };
        if entry.callback.is_some() {
            self.send_to_callback(entry, event);
        }
        if let Some(state) = code_to_state(event.code) {
            self.validate_connection(state);
        }
        self.log_error("background operation retry gave up", &err);
        None
    }

    fn send_to_callback<T: Send + Sync + 'static>(&self, entry: OperationAndData<T>, event: &ClientEvent) {
        let Some(callback) = entry.callback.clone() else { return };
        if let Err(e) = callback(event) {
            self.handle_background_exception(entry, Error::from_listener(e));
        }
    }

    fn handle_background_exception<T: Send + Sync + 'static>(&self, mut entry: OperationAndData<T>, err: Error) {
        if err.is_retryable() {
            if err.keeper_code() != Some(Code::ConnectionLoss) {
                tracing::debug!(error = %err, "retryable exception received");
            }
            let attempt = entry.next_retry_count();
            match self.inner.client.retry_policy().retry_delay(attempt, entry.elapsed()) {
                Some(delay) => {
                    tracing::debug!(ordinal = entry.ordinal, attempt, "retrying background operation");
                    entry.delay_by(delay);
                    self.queue_operation(entry);
                    return;
                }
                None => {
                    tracing::debug!(ordinal = entry.ordinal, "retry policy did not allow retry");
                    if let Some(error_callback) = entry.error_callback.clone() {
                        error_callback(&entry);
                    }
                }
            }
        }
        self.log_error("background exception was not retryable or retry gave up", &err);
        if let Some(state) = err.keeper_code().and_then(code_to_state) {
            self.validate_connection(state);
        }
    }

    /// Log a background failure and tell unhandled-error listeners.
    pub(crate) fn log_error(&self, reason: &str, err: &Error) {
        if err.keeper_code() == Some(Code::ConnectionLoss) {
            if self.inner.log_connection_loss_as_error.swap(false, Ordering::SeqCst) {
                tracing::error!(error = %err, reason, "background connection loss");
            } else {
                tracing::debug!(error = %err, reason, "background connection loss");
            }
        } else {
            tracing::error!(error = %err, reason, "background error");
        }
        self.inner.unhandled_error_listeners.for_each(|listener| listener.unhandled_error(reason, err));
    }

    /// Push the connection state implied by a session state.
    pub(crate) fn validate_connection(&self, state: KeeperState) {
        let states = &self.inner.state;
        match state {
            KeeperState::Disconnected => self.suspend_connection(),
            KeeperState::Expired => {
                states.add_state_change(ConnectionState::Lost);
            }
            KeeperState::SyncConnected => {
                self.inner.log_connection_loss_as_error.store(true, Ordering::SeqCst);
                states.add_state_change(ConnectionState::Reconnected);
            }
            KeeperState::ConnectedReadOnly => {
                self.inner.log_connection_loss_as_error.store(true, Ordering::SeqCst);
                states.add_state_change(ConnectionState::ReadOnly);
            }
            KeeperState::AuthFailed | KeeperState::SaslAuthenticated | KeeperState::Closed => {}
        }
    }

    fn suspend_connection(&self) {
        if self.inner.state.set_to_suspended() {
            self.do_sync_for_suspended(Some(self.inner.client.instance_index()));
        }
    }

    /// Probe a suspended connection with `sync("/")`. Exhausting the probe's retries
    /// marks the connection lost, unless the session was replaced meanwhile, in which
    /// case the probe runs once more with no index.
    fn do_sync_for_suspended(&self, instance_index: Option<u64>) {
        let on_result = Arc::downgrade(&self.inner);
        let on_exhausted = Arc::downgrade(&self.inner);
        let entry = OperationAndData::new(Arc::new(SyncOperation), "/".to_string())
            .with_callback(move |event: &ClientEvent| {
                if event.code == Code::Ok {
                    if let Some(inner) = on_result.upgrade() {
                        Framework::from_inner(inner).validate_connection(KeeperState::SyncConnected);
                    }
                }
                Ok(())
            })
            .with_error_callback(move |_: &OperationAndData<String>| {
                let Some(inner) = on_exhausted.upgrade() else { return };
                let framework = Framework::from_inner(inner);
                match instance_index {
                    Some(index) if index != framework.inner.client.instance_index() => {
                        tracing::debug!("suspended-connection sync failed after the session was replaced; retrying");
                        framework.do_sync_for_suspended(None);
                    }
                    _ => {
                        framework.inner.state.add_state_change(ConnectionState::Lost);
                    }
                }
            });
        self.queue_operation(entry);
    }

    /// Validate watch events, then hand the event to every client listener.
    pub(crate) fn process_event(&self, event: &ClientEvent) {
        if event.kind == EventKind::Watched {
            if let Some(watched) = &event.watched_event {
                self.validate_connection(watched.state);
            }
        }
        self.inner.listeners.for_each(|listener| {
            let trace = self.inner.client.start_tracer("EventListener");
            if let Err(e) = listener.event_received(event) {
                self.log_error("event listener failed", &Error::from_listener(e));
            }
            trace.commit();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl BackgroundOperation<u32> for Noop {
        fn kind(&self) -> EventKind {
            EventKind::Sync
        }

        async fn perform(&self, _session: Arc<dyn SessionClient>, _data: &u32) -> Result<ClientEvent, Error> {
            Ok(ClientEvent::new(EventKind::Sync, Code::Ok))
        }
    }

    #[test]
    fn ordinals_increase() {
        let first = OperationAndData::new(Arc::new(Noop), 1u32);
        let second = OperationAndData::new(Arc::new(Noop), 2u32);
        assert!(second.ordinal() > first.ordinal());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_refreshes_ordinal_and_retry_count() {
        let mut entry = OperationAndData::new(Arc::new(Noop), 1u32);
        let other = OperationAndData::new(Arc::new(Noop), 2u32);
        entry.next_retry_count();
        entry.next_retry_count();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(entry.retry_count(), 2);
        assert_eq!(entry.elapsed(), Duration::from_secs(3));

        entry.reset();
        assert_eq!(entry.retry_count(), 0);
        assert_eq!(entry.elapsed(), Duration::ZERO);
        assert!(entry.ordinal() > other.ordinal());
    }

    #[test]
    fn retry_count_saturates() {
        let mut entry = OperationAndData::new(Arc::new(Noop), 1u32);
        entry.retry_count = u32::MAX;
        assert_eq!(entry.next_retry_count(), u32::MAX);
        assert_eq!(entry.retry_count(), u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_moves_ready_time() {
        let mut entry = OperationAndData::new(Arc::new(Noop), 1u32);
        let before = entry.ready_at();
        entry.delay_by(Duration::from_millis(250));
        assert_eq!(entry.ready_at(), before + Duration::from_millis(250));
    }

    #[test]
    fn codes_map_to_session_states() {
        assert_eq!(code_to_state(Code::ConnectionLoss), Some(KeeperState::Disconnected));
        assert_eq!(code_to_state(Code::OperationTimeout), Some(KeeperState::Disconnected));
        assert_eq!(code_to_state(Code::SessionExpired), Some(KeeperState::Expired));
        assert_eq!(code_to_state(Code::SessionMoved), Some(KeeperState::SyncConnected));
        assert_eq!(code_to_state(Code::NoAuth), Some(KeeperState::AuthFailed));
        assert_eq!(code_to_state(Code::NoNode), None);
    }
}
