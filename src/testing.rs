//! In-memory session client for tests.
//!
//! [`FakeEnsemble`] implements [`SessionFactory`]; the sessions it creates keep their
//! nodes in a tree shared by the whole ensemble. Session events are scripted from the
//! test: [`FakeEnsemble::connect`], [`FakeEnsemble::disconnect`],
//! [`FakeEnsemble::expire`] and friends deliver them synchronously to the watcher of the
//! most recently created session, the way a wire client's event thread would.

use crate::error::{Code, Error};
use crate::session::{
    Acl, CreateMode, KeeperState, Op, OpResult, SessionClient, SessionFactory, Stat, WatchedEvent, Watcher,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

#[derive(Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    next_zxid: i64,
    next_sequence: u64,
    sessions: Vec<Arc<FakeSession>>,
    sessions_closed: usize,
    last_connect_string: Option<String>,
    creation_failure: Option<Code>,
    reachable: bool,
    failures: Vec<Code>,
}

struct Shared {
    state: Mutex<EnsembleState>,
    next_session_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scriptable in-memory ensemble; cheap to clone.
#[derive(Clone)]
pub struct FakeEnsemble {
    shared: Arc<Shared>,
}

impl fmt::Debug for FakeEnsemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeEnsemble")
            .field("sessions_created", &self.sessions_created())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

impl Default for FakeEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEnsemble {
    pub fn new() -> Self {
        let mut state = EnsembleState { reachable: true, ..EnsembleState::default() };
        state.nodes.insert("/".into(), Node { data: Vec::new(), acl: Acl::open_unsafe(), stat: Stat::default() });
        Self { shared: Arc::new(Shared { state: Mutex::new(state), next_session_id: AtomicU64::new(0x1000) }) }
    }

    fn latest(&self) -> Option<Arc<FakeSession>> {
        self.shared.lock().sessions.last().cloned()
    }

    /// Deliver `event` to the latest session's watcher.
    pub fn emit_event(&self, event: WatchedEvent) {
        if let Some(session) = self.latest() {
            session.watcher.process(&event);
        }
    }

    /// Deliver a session state change to the latest session's watcher.
    pub fn emit(&self, state: KeeperState) {
        self.emit_event(WatchedEvent::session(state));
    }

    /// Mark the latest session connected and report `SyncConnected`.
    pub fn connect(&self) {
        if let Some(session) = self.latest() {
            session.connected.store(true, Ordering::SeqCst);
        }
        self.emit(KeeperState::SyncConnected);
    }

    pub fn connect_read_only(&self) {
        if let Some(session) = self.latest() {
            session.connected.store(true, Ordering::SeqCst);
        }
        self.emit(KeeperState::ConnectedReadOnly);
    }

    pub fn disconnect(&self) {
        self.emit(KeeperState::Disconnected);
    }

    /// Expire the latest session, drop its ephemeral nodes and report `Expired`.
    pub fn expire(&self) {
        if let Some(session) = self.latest() {
            session.expired.store(true, Ordering::SeqCst);
            self.shared.lock().remove_ephemerals(session.id);
        }
        self.emit(KeeperState::Expired);
    }

    /// While unreachable, session operations fail with `ConnectionLoss`.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    /// Make session creation fail with `code` (or succeed again with `None`).
    pub fn fail_session_creation(&self, code: Option<Code>) {
        self.shared.lock().creation_failure = code;
    }

    /// Fail the next operations, one code per operation, in order.
    pub fn fail_next_operations(&self, codes: impl IntoIterator<Item = Code>) {
        self.shared.lock().failures.extend(codes);
    }

    pub fn sessions_created(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    pub fn open_sessions(&self) -> usize {
        let state = self.shared.lock();
        state.sessions.len() - state.sessions_closed
    }

    pub fn last_connect_string(&self) -> Option<String> {
        self.shared.lock().last_connect_string.clone()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.shared.lock().nodes.contains_key(path)
    }

    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.lock().nodes.get(path).map(|n| n.data.clone())
    }
}

impl SessionFactory for FakeEnsemble {
    fn new_session(
        &self,
        connect_string: &str,
        session_timeout: Duration,
        watcher: Arc<dyn Watcher>,
        _can_be_read_only: bool,
    ) -> Result<Arc<dyn SessionClient>, Error> {
        let mut state = self.shared.lock();
        if let Some(code) = state.creation_failure {
            return Err(Error::code(code));
        }
        let session = Arc::new(FakeSession {
            id: self.shared.next_session_id.fetch_add(1, Ordering::SeqCst) as i64,
            shared: self.shared.clone(),
            watcher,
            session_timeout,
            connected: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connect_string: Mutex::new(connect_string.to_string()),
        });
        state.sessions.push(session.clone());
        state.last_connect_string = Some(connect_string.to_string());
        Ok(session)
    }
}

/// Session handle created by [`FakeEnsemble`].
pub struct FakeSession {
    id: i64,
    shared: Arc<Shared>,
    watcher: Arc<dyn Watcher>,
    session_timeout: Duration,
    connected: AtomicBool,
    expired: AtomicBool,
    closed: AtomicBool,
    connect_string: Mutex<String>,
}

impl fmt::Debug for FakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSession")
            .field("id", &self.id)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("expired", &self.expired.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(index) => Some(&path[..index]),
    }
}

fn validate_path(path: &str) -> Result<(), Error> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
        return Err(Error::code_at(Code::BadArguments, path));
    }
    Ok(())
}

fn check_version(node: &Node, version: Option<i32>, path: &str) -> Result<(), Error> {
    match version {
        Some(expected) if expected != node.stat.version => Err(Error::code_at(Code::BadVersion, path)),
        _ => Ok(()),
    }
}

fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    nodes.keys().any(|k| parent_of(k) == Some(path))
}

impl EnsembleState {
    fn remove_ephemerals(&mut self, owner: i64) {
        let owned: Vec<String> =
            self.nodes.iter().filter(|(_, n)| n.stat.ephemeral_owner == owner).map(|(p, _)| p.clone()).collect();
        for path in owned {
            let _ = self.delete_node(&path, None);
        }
    }

    fn create_node(
        &mut self,
        owner: i64,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<String, Error> {
        validate_path(path)?;
        let parent = parent_of(path).ok_or_else(|| Error::code_at(Code::NodeExists, path))?;
        let parent_node = self.nodes.get(parent).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(Error::code_at(Code::NoChildrenForEphemerals, path));
        }

        let name = if mode.is_sequential() {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            format!("{path}{sequence:010}")
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&name) {
            return Err(Error::code_at(Code::NodeExists, name));
        }

        self.next_zxid += 1;
        let stat = Stat {
            czxid: self.next_zxid,
            mzxid: self.next_zxid,
            ephemeral_owner: if mode.is_ephemeral() { owner } else { 0 },
            data_length: data.len() as i32,
            ..Stat::default()
        };
        self.nodes.insert(name.clone(), Node { data: data.to_vec(), acl: acl.to_vec(), stat });
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
        }
        Ok(name)
    }

    fn delete_node(&mut self, path: &str, version: Option<i32>) -> Result<(), Error> {
        let node = self.nodes.get(path).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        check_version(node, version, path)?;
        if has_children(&self.nodes, path) {
            return Err(Error::code_at(Code::NotEmpty, path));
        }
        self.nodes.remove(path);
        if let Some(parent_node) = parent_of(path).and_then(|p| self.nodes.get_mut(p)) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children -= 1;
        }
        Ok(())
    }

    fn set_node_data(&mut self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat, Error> {
        self.next_zxid += 1;
        let zxid = self.next_zxid;
        let node = self.nodes.get_mut(path).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        check_version(node, version, path)?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.data_length = data.len() as i32;
        Ok(node.stat.clone())
    }
}

impl FakeSession {
    fn check(&self) -> Result<MutexGuard<'_, EnsembleState>, Error> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::code(Code::SessionExpired));
        }
        let mut state = self.shared.lock();
        if self.closed.load(Ordering::SeqCst) || !state.reachable {
            return Err(Error::code(Code::ConnectionLoss));
        }
        if !state.failures.is_empty() {
            let code = state.failures.remove(0);
            return Err(Error::code(code));
        }
        Ok(state)
    }

    /// Connect string this session currently points at.
    pub fn connect_string(&self) -> String {
        self.connect_string.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionClient for FakeSession {
    fn session_id(&self) -> i64 {
        self.id
    }

    fn negotiated_session_timeout(&self) -> Duration {
        if self.connected.load(Ordering::SeqCst) {
            self.session_timeout
        } else {
            Duration::ZERO
        }
    }

    async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String, Error> {
        self.check()?.create_node(self.id, path, data, acl, mode)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), Error> {
        self.check()?.delete_node(path, version)
    }

    async fn exists(&self, path: &str, _watch: bool) -> Result<Option<Stat>, Error> {
        Ok(self.check()?.nodes.get(path).map(|n| n.stat.clone()))
    }

    async fn get_data(&self, path: &str, _watch: bool) -> Result<(Vec<u8>, Stat), Error> {
        let state = self.check()?;
        let node = state.nodes.get(path).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        Ok((node.data.clone(), node.stat.clone()))
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat, Error> {
        self.check()?.set_node_data(path, data, version)
    }

    async fn get_children(&self, path: &str, _watch: bool) -> Result<Vec<String>, Error> {
        let state = self.check()?;
        if !state.nodes.contains_key(path) {
            return Err(Error::code_at(Code::NoNode, path));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        Ok(state
            .nodes
            .keys()
            .filter(|k| parent_of(k) == Some(path))
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn get_acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), Error> {
        let state = self.check()?;
        let node = state.nodes.get(path).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        Ok((node.acl.clone(), node.stat.clone()))
    }

    async fn set_acl(&self, path: &str, acl: &[Acl], version: Option<i32>) -> Result<Stat, Error> {
        let mut state = self.check()?;
        let node = state.nodes.get_mut(path).ok_or_else(|| Error::code_at(Code::NoNode, path))?;
        if let Some(expected) = version {
            if expected != node.stat.aversion {
                return Err(Error::code_at(Code::BadVersion, path));
            }
        }
        node.acl = acl.to_vec();
        node.stat.aversion += 1;
        Ok(node.stat.clone())
    }

    async fn sync(&self, _path: &str) -> Result<(), Error> {
        self.check().map(|_| ())
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, Error> {
        let mut state = self.check()?;
        let saved_nodes = state.nodes.clone();
        let saved_zxid = state.next_zxid;
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match op {
                Op::Create { path, data, acl, mode } => {
                    state.create_node(self.id, &path, &data, &acl, mode).map(|path| OpResult::Create { path })
                }
                Op::Delete { path, version } => state.delete_node(&path, version).map(|()| OpResult::Delete),
                Op::SetData { path, data, version } => {
                    state.set_node_data(&path, &data, version).map(|stat| OpResult::SetData { stat })
                }
                Op::Check { path, version } => match state.nodes.get(&path) {
                    Some(node) => check_version(node, version, &path).map(|()| OpResult::Check),
                    None => Err(Error::code_at(Code::NoNode, path)),
                },
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    state.nodes = saved_nodes;
                    state.next_zxid = saved_zxid;
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    fn update_server_list(&self, connect_string: &str) -> Result<(), Error> {
        if let Ok(mut current) = self.connect_string.lock() {
            *current = connect_string.to_string();
        }
        self.shared.lock().last_connect_string = Some(connect_string.to_string());
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.shared.lock();
            state.sessions_closed += 1;
            state.remove_ephemerals(self.id);
        }
    }
}
