//! Interfaces of the wire-level session client.
//!
//! The core never talks to the network itself. A [`SessionFactory`] creates
//! [`SessionClient`] handles for a connect string; each handle delivers session and
//! node notifications to the [`Watcher`] it was created with. Implementations must not
//! invoke the watcher synchronously from inside [`SessionFactory::new_session`].

use crate::error::Error;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Session-level state carried by watch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeeperState {
    Disconnected,
    SyncConnected,
    AuthFailed,
    ConnectedReadOnly,
    SaslAuthenticated,
    Expired,
    Closed,
}

/// Kind of change a watch event reports; `None` means a session state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventType {
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    DataWatchRemoved,
    ChildWatchRemoved,
}

/// A notification delivered by the session client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub state: KeeperState,
    pub path: Option<String>,
}

impl WatchedEvent {
    /// A session state change with no node path.
    pub fn session(state: KeeperState) -> Self {
        Self { event_type: EventType::None, state, path: None }
    }
}

/// Receives watch events. Called on the session client's callback context; must not
/// block for long.
pub trait Watcher: Send + Sync {
    fn process(&self, event: &WatchedEvent);
}

impl<F> Watcher for F
where
    F: Fn(&WatchedEvent) + Send + Sync,
{
    fn process(&self, event: &WatchedEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// Node metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
}

/// Access-control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub perms: u32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub const PERM_ALL: u32 = 0x1f;

    /// `world:anyone` with every permission.
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl { perms: Self::PERM_ALL, scheme: "world".into(), id: "anyone".into() }]
    }
}

/// One step of a multi-operation transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create { path: String, data: Vec<u8>, acl: Vec<Acl>, mode: CreateMode },
    Delete { path: String, version: Option<i32> },
    SetData { path: String, data: Vec<u8>, version: Option<i32> },
    Check { path: String, version: Option<i32> },
}

/// Outcome of one transaction step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Create { path: String },
    Delete,
    SetData { stat: Stat },
    Check,
    Error { code: crate::error::Code },
}

/// A live session handle. Results report wire failures as [`Error::Keeper`].
#[async_trait]
pub trait SessionClient: Send + Sync + fmt::Debug {
    fn session_id(&self) -> i64;

    /// Timeout agreed with the server; zero until the session has connected.
    fn negotiated_session_timeout(&self) -> Duration;

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<String, Error>;

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), Error>;

    async fn exists(&self, path: &str, watch: bool) -> Result<Option<Stat>, Error>;

    async fn get_data(&self, path: &str, watch: bool) -> Result<(Vec<u8>, Stat), Error>;

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>)
        -> Result<Stat, Error>;

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, Error>;

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), Error>;

    async fn set_acl(&self, path: &str, acl: &[Acl], version: Option<i32>) -> Result<Stat, Error>;

    async fn sync(&self, path: &str) -> Result<(), Error>;

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, Error>;

    /// Point the session at a new server list without replacing it.
    fn update_server_list(&self, connect_string: &str) -> Result<(), Error>;

    /// Close the session; must not block.
    fn close(&self);
}

/// Creates session handles for a connect string.
pub trait SessionFactory: Send + Sync + fmt::Debug {
    fn new_session(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        watcher: Arc<dyn Watcher>,
        can_be_read_only: bool,
    ) -> Result<Arc<dyn SessionClient>, Error>;
}
