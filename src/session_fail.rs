//! Retry loop that also protects against *session* loss.
//!
//! A plain [`RetryLoop`] survives connection blips, but ephemeral state created
//! earlier in a block is gone once the session expires. A [`SessionFailRetryLoop`]
//! registers a parent watcher that flags its [`SessionScope`] on expiry. Every
//! `get_session` made through the loop's scoped client then fails with
//! [`Error::SessionFailed`] until the loop handles it:
//!
//! - [`SessionFailMode::Retry`]: the flag is cleared and the whole block runs again.
//! - [`SessionFailMode::Fail`]: the error propagates and the loop ends.
//!
//! The scope is a value owned by the loop, not ambient state: only calls made through
//! [`SessionFailRetryLoop::client`] (or the client handed to the closure of
//! [`SessionFailRetryLoop::call_with_retry`]) observe it.

use crate::client::ResilientClient;
use crate::error::Error;
use crate::listener::ListenerHandle;
use crate::retry::RetryLoop;
use crate::session::{KeeperState, WatchedEvent};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "session has failed" flag for one protected block.
#[derive(Debug, Clone, Default)]
pub struct SessionScope {
    failed: Arc<AtomicBool>,
}

impl SessionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.failed.store(false, Ordering::SeqCst);
    }
}

/// What to do when the session expires inside the protected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailMode {
    /// Re-run the whole block.
    Retry,
    /// Propagate [`Error::SessionFailed`].
    Fail,
}

/// Session-aware wrapper around a [`RetryLoop`]; see the module docs.
pub struct SessionFailRetryLoop {
    client: ResilientClient,
    scoped: ResilientClient,
    mode: SessionFailMode,
    scope: SessionScope,
    watcher: Option<ListenerHandle>,
    retry_loop: RetryLoop,
    done: bool,
}

impl fmt::Debug for SessionFailRetryLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFailRetryLoop")
            .field("mode", &self.mode)
            .field("session_failed", &self.scope.has_failed())
            .field("done", &self.done)
            .finish()
    }
}

impl SessionFailRetryLoop {
    pub(crate) fn new(client: ResilientClient, mode: SessionFailMode) -> Self {
        let scope = SessionScope::new();
        let flag = scope.clone();
        let watcher = client.add_parent_watcher(Arc::new(move |event: &WatchedEvent| {
            if event.state == KeeperState::Expired {
                flag.mark_failed();
            }
        }));
        let scoped = client.scoped(scope.clone());
        let retry_loop = client.new_retry_loop();
        Self { client, scoped, mode, scope, watcher: Some(watcher), retry_loop, done: false }
    }

    /// Run `operation` as a session-protected block. The closure receives the scoped
    /// client; nested [`RetryLoop::call_with_retry`] calls should use it.
    pub async fn call_with_retry<T, F, Fut>(
        client: &ResilientClient,
        mode: SessionFailMode,
        mut operation: F,
    ) -> Result<T, Error>
    where
        F: FnMut(ResilientClient) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut session_loop = client.new_session_fail_retry_loop(mode);
        let mut result = Err(Error::SessionFailed);
        while session_loop.should_continue() {
            match operation(session_loop.client().clone()).await {
                Ok(value) => result = Ok(value),
                Err(e) => {
                    if let Err(e) = session_loop.take_exception(e).await {
                        result = Err(e);
                        break;
                    }
                }
            }
        }
        session_loop.close();
        result
    }

    /// Client whose `get_session` observes this loop's scope.
    pub fn client(&self) -> &ResilientClient {
        &self.scoped
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    pub fn mode(&self) -> SessionFailMode {
        self.mode
    }

    /// True once per pass through the block. In [`SessionFailMode::Retry`] a session
    /// expiry seen during the pass clears the scope and grants another pass, even when
    /// the block itself finished without error.
    pub fn should_continue(&mut self) -> bool {
        if self.mode == SessionFailMode::Retry && self.scope.has_failed() {
            tracing::info!("session expired during protected block; running block again");
            self.scope.clear();
            self.done = false;
        }
        !std::mem::replace(&mut self.done, true)
    }

    /// Handle an error raised inside the block; returns it when the loop must end.
    pub async fn take_exception(&mut self, err: Error) -> Result<(), Error> {
        if self.scope.has_failed() && self.mode == SessionFailMode::Retry {
            self.scope.clear();
            if err.is_session_failed() {
                tracing::info!("session expired inside protected block; retrying block");
                self.done = false;
                return Ok(());
            }
        }

        self.retry_loop.take_exception(err).await?;
        self.done = false;
        Ok(())
    }

    /// Remove the expiry watcher and clear the scope; idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.watcher.take() {
            self.client.remove_parent_watcher(handle);
        }
        self.scope.clear();
    }
}

impl Drop for SessionFailRetryLoop {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::retry_policy::RetryOneTime;
    use crate::testing::FakeEnsemble;
    use std::time::Duration;

    fn started_client(ensemble: &FakeEnsemble) -> ResilientClient {
        let config = ClientConfig::new(
            "a:2181",
            Arc::new(ensemble.clone()),
            Arc::new(RetryOneTime::new(Duration::ZERO)),
        )
        .unwrap();
        let client = ResilientClient::new(config).unwrap();
        client.start().unwrap();
        ensemble.connect();
        client
    }

    #[tokio::test]
    async fn should_continue_runs_block_once() {
        let ensemble = FakeEnsemble::new();
        let client = started_client(&ensemble);
        let mut session_loop = client.new_session_fail_retry_loop(SessionFailMode::Fail);
        assert!(session_loop.should_continue());
        assert!(!session_loop.should_continue());
    }

    #[tokio::test]
    async fn retry_mode_grants_another_pass_after_expiry() {
        let ensemble = FakeEnsemble::new();
        let client = started_client(&ensemble);
        let mut session_loop = client.new_session_fail_retry_loop(SessionFailMode::Retry);

        assert!(session_loop.should_continue());
        ensemble.expire();
        ensemble.connect();
        assert!(session_loop.should_continue());
        assert!(!session_loop.scope().has_failed());
        assert!(!session_loop.should_continue());
    }

    #[tokio::test]
    async fn fail_mode_does_not_rerun_a_finished_block() {
        let ensemble = FakeEnsemble::new();
        let client = started_client(&ensemble);
        let mut session_loop = client.new_session_fail_retry_loop(SessionFailMode::Fail);

        assert!(session_loop.should_continue());
        ensemble.expire();
        assert!(!session_loop.should_continue());
        assert!(session_loop.scope().has_failed());
    }

    #[tokio::test]
    async fn expiry_flags_scope_and_close_clears_it() {
        let ensemble = FakeEnsemble::new();
        let client = started_client(&ensemble);
        let mut session_loop = client.new_session_fail_retry_loop(SessionFailMode::Fail);

        ensemble.expire();
        assert!(session_loop.scope().has_failed());
        assert!(session_loop.client().get_session().unwrap_err().is_session_failed());
        assert!(client.get_session().is_ok());

        session_loop.close();
        assert!(!session_loop.scope().has_failed());
        assert!(session_loop.client().get_session().is_ok());
    }

    #[tokio::test]
    async fn drop_removes_watcher() {
        let ensemble = FakeEnsemble::new();
        let client = started_client(&ensemble);
        let scope = {
            let session_loop = client.new_session_fail_retry_loop(SessionFailMode::Retry);
            session_loop.scope().clone()
        };
        ensemble.expire();
        assert!(!scope.has_failed());
    }
}
