//! Error types shared by the connection, retry, and background layers.
//!
//! Wire-level failures carry a [`Code`] mirroring the coordination service's
//! result codes. Everything the client raises on its own (local connection
//! timeouts, session-fail protection, lifecycle misuse) has a dedicated variant so
//! retry loops can classify errors without string matching.

use std::fmt;
use std::time::Duration;

/// Boxed error returned by listeners and callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result codes reported by the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Code {
    Ok,
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    ApiError,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidCallback,
    InvalidAcl,
    AuthFailed,
    SessionMoved,
    NotReadOnly,
}

impl Code {
    /// Integer value used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::SystemError => -1,
            Code::RuntimeInconsistency => -2,
            Code::DataInconsistency => -3,
            Code::ConnectionLoss => -4,
            Code::MarshallingError => -5,
            Code::Unimplemented => -6,
            Code::OperationTimeout => -7,
            Code::BadArguments => -8,
            Code::ApiError => -100,
            Code::NoNode => -101,
            Code::NoAuth => -102,
            Code::BadVersion => -103,
            Code::NoChildrenForEphemerals => -108,
            Code::NodeExists => -110,
            Code::NotEmpty => -111,
            Code::SessionExpired => -112,
            Code::InvalidCallback => -113,
            Code::InvalidAcl => -114,
            Code::AuthFailed => -115,
            Code::SessionMoved => -118,
            Code::NotReadOnly => -119,
        }
    }

    /// Decode a wire value; unknown values yield `None`.
    pub fn from_i32(value: i32) -> Option<Self> {
        let code = match value {
            0 => Code::Ok,
            -1 => Code::SystemError,
            -2 => Code::RuntimeInconsistency,
            -3 => Code::DataInconsistency,
            -4 => Code::ConnectionLoss,
            -5 => Code::MarshallingError,
            -6 => Code::Unimplemented,
            -7 => Code::OperationTimeout,
            -8 => Code::BadArguments,
            -100 => Code::ApiError,
            -101 => Code::NoNode,
            -102 => Code::NoAuth,
            -103 => Code::BadVersion,
            -108 => Code::NoChildrenForEphemerals,
            -110 => Code::NodeExists,
            -111 => Code::NotEmpty,
            -112 => Code::SessionExpired,
            -113 => Code::InvalidCallback,
            -114 => Code::InvalidAcl,
            -115 => Code::AuthFailed,
            -118 => Code::SessionMoved,
            -119 => Code::NotReadOnly,
            _ => return None,
        };
        Some(code)
    }

    /// Transient codes that are always routed through a retry policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Code::ConnectionLoss
                | Code::OperationTimeout
                | Code::SessionMoved
                | Code::SessionExpired
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Code::Ok => "ok",
            Code::SystemError => "system error",
            Code::RuntimeInconsistency => "runtime inconsistency",
            Code::DataInconsistency => "data inconsistency",
            Code::ConnectionLoss => "connection loss",
            Code::MarshallingError => "marshalling error",
            Code::Unimplemented => "unimplemented",
            Code::OperationTimeout => "operation timeout",
            Code::BadArguments => "bad arguments",
            Code::ApiError => "api error",
            Code::NoNode => "no node",
            Code::NoAuth => "not authenticated",
            Code::BadVersion => "bad version",
            Code::NoChildrenForEphemerals => "ephemeral nodes may not have children",
            Code::NodeExists => "node exists",
            Code::NotEmpty => "directory not empty",
            Code::SessionExpired => "session expired",
            Code::InvalidCallback => "invalid callback",
            Code::InvalidAcl => "invalid ACL",
            Code::AuthFailed => "authentication failed",
            Code::SessionMoved => "session moved",
            Code::NotReadOnly => "not a read-only call",
        };
        f.write_str(text)
    }
}

/// Unified error type for the client core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The coordination service (or its client library) reported a result code.
    #[error("{code}{}", path_suffix(.path))]
    Keeper { code: Code, path: Option<String> },
    /// No connection could be established within the configured timeouts.
    #[error(
        "connection timed out for connection string ({connect_string}) and timeout ({timeout:?}) / elapsed ({elapsed:?})"
    )]
    ConnectionTimeout { connect_string: String, timeout: Duration, elapsed: Duration },
    /// The session expired while inside a session-protected block.
    #[error("session failed inside a session-protected block")]
    SessionFailed,
    /// Construction-time validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("client is not started")]
    NotStarted,
    #[error("client cannot be started more than once")]
    AlreadyStarted,
    #[error("client has been closed")]
    Closed,
    /// A user callback failed with a non-keeper error.
    #[error("callback failed: {0}")]
    Callback(String),
}

fn path_suffix(path: &Option<String>) -> String {
    path.as_deref().map(|p| format!(" for {p}")).unwrap_or_default()
}

impl Error {
    /// Shorthand for a keeper error without a path.
    pub fn code(code: Code) -> Self {
        Error::Keeper { code, path: None }
    }

    /// Shorthand for a keeper error attached to a path.
    pub fn code_at(code: Code, path: impl Into<String>) -> Self {
        Error::Keeper { code, path: Some(path.into()) }
    }

    /// Result code carried by this error, if it came from the wire.
    ///
    /// Local connection timeouts report [`Code::ConnectionLoss`].
    pub fn keeper_code(&self) -> Option<Code> {
        match self {
            Error::Keeper { code, .. } => Some(*code),
            Error::ConnectionTimeout { .. } => Some(Code::ConnectionLoss),
            _ => None,
        }
    }

    /// Whether a retry loop should consult its policy for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Keeper { code, .. } => code.is_retryable(),
            Error::ConnectionTimeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_connection_timeout(&self) -> bool {
        matches!(self, Error::ConnectionTimeout { .. })
    }

    pub fn is_session_failed(&self) -> bool {
        matches!(self, Error::SessionFailed)
    }

    /// Convert a listener failure into a crate error, keeping keeper codes intact.
    pub fn from_listener(err: ListenerError) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(other) => Error::Callback(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(Code::ConnectionLoss.is_retryable());
        assert!(Code::OperationTimeout.is_retryable());
        assert!(Code::SessionMoved.is_retryable());
        assert!(Code::SessionExpired.is_retryable());
        assert!(!Code::NoNode.is_retryable());
        assert!(!Code::BadArguments.is_retryable());
        assert!(!Code::Ok.is_retryable());
    }

    #[test]
    fn wire_values_decode() {
        assert_eq!(Code::from_i32(-4), Some(Code::ConnectionLoss));
        assert_eq!(Code::from_i32(-112), Some(Code::SessionExpired));
        assert_eq!(Code::NotReadOnly.as_i32(), -119);
        assert_eq!(Code::from_i32(42), None);
    }

    #[test]
    fn connection_timeout_is_a_retryable_connection_loss() {
        let err = Error::ConnectionTimeout {
            connect_string: "a:2181".into(),
            timeout: Duration::from_secs(5),
            elapsed: Duration::from_secs(6),
        };
        assert!(err.is_retryable());
        assert!(err.is_connection_timeout());
        assert_eq!(err.keeper_code(), Some(Code::ConnectionLoss));
    }

    #[test]
    fn session_failed_is_not_retryable() {
        assert!(!Error::SessionFailed.is_retryable());
        assert!(Error::SessionFailed.is_session_failed());
    }

    #[test]
    fn display_includes_path() {
        let msg = Error::code_at(Code::NoNode, "/a/b").to_string();
        assert_eq!(msg, "no node for /a/b");
        assert_eq!(Error::code(Code::ConnectionLoss).to_string(), "connection loss");
    }

    #[test]
    fn listener_errors_keep_keeper_codes() {
        let boxed: ListenerError = Box::new(Error::code(Code::OperationTimeout));
        assert_eq!(Error::from_listener(boxed).keeper_code(), Some(Code::OperationTimeout));

        let other: ListenerError = "boom".into();
        assert!(matches!(Error::from_listener(other), Error::Callback(m) if m == "boom"));
    }
}
