//! Events delivered to client listeners, plus the listener traits.

use crate::error::{Code, Error, ListenerError};
use crate::session::{KeeperState, WatchedEvent};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// What produced a [`ClientEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    Children,
    Sync,
    GetAcl,
    SetAcl,
    Transaction,
    /// A watch or session event passed through from the session client.
    Watched,
    /// The framework is closing.
    Closing,
}

/// Result of a background operation or a forwarded watch event.
#[derive(Clone)]
pub struct ClientEvent {
    pub kind: EventKind,
    pub code: Code,
    pub path: Option<String>,
    /// Created node name for `Create`, which may differ from `path` for sequential nodes.
    pub name: Option<String>,
    pub watched_event: Option<WatchedEvent>,
    pub context: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEvent")
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("watched_event", &self.watched_event)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl ClientEvent {
    pub fn new(kind: EventKind, code: Code) -> Self {
        Self {
            kind,
            code,
            path: None,
            name: None,
            watched_event: None,
            context: None,
        }
    }

    /// `Watched` event wrapping a session notification; the code is `Ok`.
    pub fn watched(event: WatchedEvent) -> Self {
        let mut this = Self::new(EventKind::Watched, Code::Ok);
        this.path = event.path.clone();
        this.watched_event = Some(event);
        this
    }

    /// Synthesized `Watched` event reporting a lost connection.
    pub(crate) fn connection_loss(context: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        let mut this = Self::new(EventKind::Watched, Code::ConnectionLoss);
        this.watched_event = Some(WatchedEvent::session(KeeperState::Disconnected));
        this.context = context;
        this
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_context(mut self, context: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        self.context = context;
        self
    }

    /// The result code as an error, `None` for `Ok`.
    pub fn error(&self) -> Option<Error> {
        (self.code != Code::Ok).then(|| Error::Keeper { code: self.code, path: self.path.clone() })
    }
}

/// Receives background results that have no callback, and forwarded watch events.
pub trait ClientListener: Send + Sync {
    fn event_received(&self, event: &ClientEvent) -> Result<(), ListenerError>;
}

impl<F> ClientListener for F
where
    F: Fn(&ClientEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn event_received(&self, event: &ClientEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

/// Told about background errors nobody else handled.
pub trait UnhandledErrorListener: Send + Sync {
    fn unhandled_error(&self, message: &str, error: &Error);
}

impl<F> UnhandledErrorListener for F
where
    F: Fn(&str, &Error) + Send + Sync,
{
    fn unhandled_error(&self, message: &str, error: &Error) {
        self(message, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reflects_code_and_path() {
        let ok = ClientEvent::new(EventKind::Create, Code::Ok).with_path("/a");
        assert!(ok.error().is_none());

        let failed = ClientEvent::new(EventKind::Create, Code::NodeExists).with_path("/a");
        let err = failed.error().unwrap();
        assert_eq!(err.keeper_code(), Some(Code::NodeExists));
        assert_eq!(err.to_string(), "node exists for /a");
    }

    #[test]
    fn connection_loss_event_carries_disconnected_state() {
        let event = ClientEvent::connection_loss(None);
        assert_eq!(event.kind, EventKind::Watched);
        assert_eq!(event.code, Code::ConnectionLoss);
        assert_eq!(event.watched_event.map(|e| e.state), Some(KeeperState::Disconnected));
    }
}
