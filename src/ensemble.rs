//! Sources of the server list (connect string).

use crate::error::Error;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

/// Supplies the current connect string. The connection manager polls it on every
/// session event and timeout check, so a provider may change its answer at any time.
pub trait EnsembleProvider: Send + Sync + fmt::Debug {
    fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    fn connection_string(&self) -> String;

    /// Replace the connect string; providers that discover servers themselves may ignore it.
    fn set_connection_string(&self, _connection_string: &str) {}

    /// When `true`, a changed connect string is pushed into the live session instead of
    /// resetting it.
    fn update_server_list_enabled(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Provider backed by a connect string held in memory.
#[derive(Debug)]
pub struct FixedEnsembleProvider {
    connection_string: ArcSwap<String>,
    update_server_list: bool,
}

impl FixedEnsembleProvider {
    /// Rejects empty connect strings.
    pub fn new(connection_string: impl Into<String>) -> Result<Self, Error> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(Error::InvalidConfig("connection string cannot be empty".into()));
        }
        Ok(Self { connection_string: ArcSwap::from_pointee(connection_string), update_server_list: false })
    }

    /// Push connect-string changes into the live session rather than resetting it.
    pub fn with_server_list_updates(mut self) -> Self {
        self.update_server_list = true;
        self
    }
}

impl EnsembleProvider for FixedEnsembleProvider {
    fn connection_string(&self) -> String {
        self.connection_string.load().as_ref().clone()
    }

    fn set_connection_string(&self, connection_string: &str) {
        self.connection_string.store(Arc::new(connection_string.to_string()));
    }

    fn update_server_list_enabled(&self) -> bool {
        self.update_server_list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_connection_string() {
        assert!(matches!(FixedEnsembleProvider::new("  "), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn connection_string_can_change() {
        let provider = FixedEnsembleProvider::new("a:2181").unwrap();
        assert_eq!(provider.connection_string(), "a:2181");
        assert!(!provider.update_server_list_enabled());

        provider.set_connection_string("b:2181,c:2181");
        assert_eq!(provider.connection_string(), "b:2181,c:2181");
    }
}
