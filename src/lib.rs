#![forbid(unsafe_code)]

//! # sessionkeeper
//!
//! Connection, session and retry management for clients of a tree-structured
//! coordination service (ZooKeeper-style ensembles).
//!
//! The wire protocol is abstracted behind [`SessionFactory`] / [`SessionClient`]; this
//! crate supplies everything around it:
//!
//! - **Connection management**: session (re)creation on expiry, connect-string changes
//!   and timeouts ([`ConnectionManager`]).
//! - **Retry policies** and the foreground [`RetryLoop`], plus the session-aware
//!   [`SessionFailRetryLoop`].
//! - **Connection states** (`CONNECTED`, `SUSPENDED`, `RECONNECTED`, `LOST`,
//!   `READ_ONLY`) delivered to listeners in order ([`ConnectionStateManager`]).
//! - **Background operations** retried on a delay queue ([`Framework`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessionkeeper::{ExponentialBackoffRetry, Framework, RetryLoop, SessionFactory};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo(factory: Arc<dyn SessionFactory>) -> Result<(), sessionkeeper::Error> {
//! let framework = Framework::builder()
//!     .connect_string("zk1:2181,zk2:2181")
//!     .session_factory(factory)
//!     .retry_policy(ExponentialBackoffRetry::new(Duration::from_millis(100), 3))
//!     .build()?;
//! framework.start()?;
//!
//! let client = framework.client();
//! let exists = RetryLoop::call_with_retry(client, || async {
//!     client.get_session()?.exists("/config", false).await
//! })
//! .await?;
//! # let _ = exists;
//! framework.close();
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod client;
pub mod connection;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod framework;
mod handle;
pub mod listener;
pub mod prelude;
pub mod retry;
pub mod retry_policy;
pub mod session;
pub mod session_fail;
pub mod sleeper;
pub mod state;
pub mod testing;
pub mod tracer;

// Re-exports
pub use background::operation::{CreateOperation, CreateRequest, SyncOperation};
pub use background::{BackgroundOperation, OperationAndData};
pub use client::{ClientConfig, ResilientClient};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use ensemble::{EnsembleProvider, FixedEnsembleProvider};
pub use error::{Code, Error, ListenerError};
pub use event::{ClientEvent, ClientListener, EventKind, UnhandledErrorListener};
pub use framework::{Framework, FrameworkBuilder, FrameworkState};
pub use listener::{ListenerContainer, ListenerHandle};
pub use retry::RetryLoop;
pub use retry_policy::{
    ExponentialBackoffRetry, RetryForever, RetryNTimes, RetryOneTime, RetryPolicy, RetryUntilElapsed,
};
pub use session::{
    Acl, CreateMode, EventType, KeeperState, Op, OpResult, SessionClient, SessionFactory, Stat, WatchedEvent,
    Watcher,
};
pub use session_fail::{SessionFailMode, SessionFailRetryLoop, SessionScope};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use state::{ConnectionState, ConnectionStateListener, ConnectionStateManager, StateManagerConfig};
pub use tracer::{LogTracerDriver, MemoryTracerDriver, NullTracerDriver, Tracer, TracerDriver};
