//! Foreground retry loop.
//!
//! Semantics:
//! - The loop is *running* until [`RetryLoop::mark_complete`] is called.
//! - [`RetryLoop::take_exception`] swallows a retryable error when the policy allows
//!   another attempt (after sleeping the policy's delay) and returns every other
//!   error to the caller.
//! - Non-retryable errors never consult the policy.
//!
//! Most callers use [`RetryLoop::call_with_retry`]:
//!
//! ```rust,no_run
//! # use sessionkeeper::{ResilientClient, RetryLoop, Error};
//! # async fn demo(client: &ResilientClient) -> Result<(), Error> {
//! let children = RetryLoop::call_with_retry(client, || async {
//!     client.get_session()?.get_children("/services", false).await
//! })
//! .await?;
//! # let _ = children;
//! # Ok(())
//! # }
//! ```
//!
//! Hand-driven form, for blocks that need the loop state:
//!
//! ```rust,no_run
//! # use sessionkeeper::{ResilientClient, Error};
//! # async fn demo(client: &ResilientClient) -> Result<(), Error> {
//! let mut retry_loop = client.new_retry_loop();
//! while retry_loop.should_continue() {
//!     match client.get_session()?.sync("/").await {
//!         Ok(()) => retry_loop.mark_complete(),
//!         Err(e) => retry_loop.take_exception(e).await?,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::client::ResilientClient;
use crate::error::Error;
use crate::retry_policy::RetryPolicy;
use crate::sleeper::{Shutdown, Sleeper};
use crate::tracer::Tracer;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Running/done state machine around a retry policy.
pub struct RetryLoop {
    done: bool,
    retry_count: u32,
    started: Instant,
    policy: Arc<dyn RetryPolicy>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Shutdown,
    tracer: Tracer,
}

impl fmt::Debug for RetryLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLoop")
            .field("done", &self.done)
            .field("retry_count", &self.retry_count)
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryLoop {
    pub(crate) fn new(
        policy: Arc<dyn RetryPolicy>,
        sleeper: Arc<dyn Sleeper>,
        shutdown: Shutdown,
        tracer: Tracer,
    ) -> Self {
        Self { done: false, retry_count: 0, started: Instant::now(), policy, sleeper, shutdown, tracer }
    }

    /// Run `operation` until it succeeds, the policy gives up, or a non-retryable
    /// error occurs. Each attempt first waits for a connection (bounded by the
    /// connection timeout).
    pub async fn call_with_retry<T, F, Fut>(client: &ResilientClient, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut retry_loop = client.new_retry_loop();
        loop {
            client.block_until_connected_or_timed_out().await?;
            match operation().await {
                Ok(value) => {
                    retry_loop.mark_complete();
                    return Ok(value);
                }
                Err(e) => retry_loop.take_exception(e).await?,
            }
        }
    }

    pub fn should_continue(&self) -> bool {
        !self.done
    }

    pub fn mark_complete(&mut self) {
        self.done = true;
    }

    /// Attempts the policy has approved so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Swallow `err` if it is retryable and the policy allows another attempt;
    /// otherwise hand it back.
    pub async fn take_exception(&mut self, err: Error) -> Result<(), Error> {
        if !err.is_retryable() {
            tracing::debug!(error = %err, "non-retryable error");
            return Err(err);
        }

        let attempt = self.retry_count;
        self.retry_count = self.retry_count.saturating_add(1);
        match self.policy.retry_delay(attempt, self.started.elapsed()) {
            Some(delay) => {
                self.tracer.event("retries-allowed").commit();
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying operation");
                if !self.shutdown.sleep(self.sleeper.as_ref(), delay).await {
                    return Err(Error::Closed);
                }
                Ok(())
            }
            None => {
                self.tracer.event("retries-disallowed").commit();
                tracing::debug!(attempt, error = %err, "retry policy exhausted");
                Err(err)
            }
        }
    }
}
