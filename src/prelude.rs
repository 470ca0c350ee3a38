//! Convenient re-exports for common sessionkeeper types.
pub use crate::{
    background::{
        operation::{CreateOperation, CreateRequest, SyncOperation},
        BackgroundOperation, OperationAndData,
    },
    client::{ClientConfig, ResilientClient},
    error::{Code, Error},
    event::{ClientEvent, EventKind},
    framework::Framework,
    retry::RetryLoop,
    retry_policy::{ExponentialBackoffRetry, RetryNTimes, RetryOneTime, RetryPolicy},
    session::{CreateMode, KeeperState, SessionClient, SessionFactory, WatchedEvent, Watcher},
    session_fail::{SessionFailMode, SessionFailRetryLoop},
    state::ConnectionState,
};
