use super::BackgroundOperation;
use crate::error::{Code, Error};
use crate::event::{ClientEvent, EventKind};
use crate::session::{Acl, CreateMode, SessionClient};
use async_trait::async_trait;
use std::sync::Arc;

/// `sync(path)`; the data is the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOperation;

#[async_trait]
impl BackgroundOperation<String> for SyncOperation {
    fn kind(&self) -> EventKind {
        EventKind::Sync
    }

    async fn perform(&self, session: Arc<dyn SessionClient>, path: &String) -> Result<ClientEvent, Error> {
        session.sync(path).await?;
        Ok(ClientEvent::new(EventKind::Sync, Code::Ok).with_path(path.clone()))
    }
}

/// Node creation request for [`CreateOperation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub mode: CreateMode,
    pub create_parents: bool,
}

impl CreateRequest {
    /// Persistent node, no data, open ACL.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            acl: Acl::open_unsafe(),
            mode: CreateMode::Persistent,
            create_parents: false,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = acl;
        self
    }

    /// Create missing parents (as persistent nodes) when the first attempt reports `NoNode`.
    pub fn creating_parents_if_needed(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

/// Background node creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOperation;

#[async_trait]
impl BackgroundOperation<CreateRequest> for CreateOperation {
    fn kind(&self) -> EventKind {
        EventKind::Create
    }

    async fn perform(&self, session: Arc<dyn SessionClient>, request: &CreateRequest) -> Result<ClientEvent, Error> {
        let created = match create(session.as_ref(), request).await {
            Err(e) if request.create_parents && e.keeper_code() == Some(Code::NoNode) => {
                ensure_parents(session.as_ref(), &request.path, &request.acl).await?;
                create(session.as_ref(), request).await?
            }
            other => other?,
        };
        Ok(ClientEvent::new(EventKind::Create, Code::Ok).with_path(request.path.clone()).with_name(created))
    }
}

async fn create(session: &dyn SessionClient, request: &CreateRequest) -> Result<String, Error> {
    session.create(&request.path, &request.data, &request.acl, request.mode).await
}

async fn ensure_parents(session: &dyn SessionClient, path: &str, acl: &[Acl]) -> Result<(), Error> {
    for parent in parent_paths(path) {
        match session.create(&parent, &[], acl, CreateMode::Persistent).await {
            Ok(_) => {}
            Err(e) if e.keeper_code() == Some(Code::NodeExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Proper ancestors of `path`, shallowest first.
fn parent_paths(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        parents.push(current.clone());
    }
    parents
}
