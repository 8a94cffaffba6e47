use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Connector not ready: {0}")]
    NotReady(String),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Already started: {0}")]
    AlreadyStarted(String),

    #[error("Suffix already bound: {0}")]
    AlreadyBound(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Script failure: {0}")]
    ScriptFailure(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Operation not supported: {0}")]
    OperationUnsupported(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Machine-readable error kind tag, carried into response metadata so the
    /// scheduler can choose a retry policy per kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Io(_) => "io",
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::NotReady(_) => "not_ready",
            BridgeError::AlreadyInitialized(_) => "already_initialized",
            BridgeError::AlreadyStarted(_) => "already_started",
            BridgeError::AlreadyBound(_) => "already_bound",
            BridgeError::AuthFailure(_) => "auth_failure",
            BridgeError::TransportUnavailable(_) => "transport_unavailable",
            BridgeError::Transport(_) => "transport",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::ScriptFailure(_) => "script_failure",
            BridgeError::Parse(_) => "parse",
            BridgeError::OperationUnsupported(_) => "operation_unsupported",
            BridgeError::SessionExpired(_) => "session_expired",
            BridgeError::Cancelled(_) => "cancelled",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Serialization(_) => "serialization",
            BridgeError::Sql(_) => "sql",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// Transport and auth errors are worth retrying; parse and logic errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_)
                | BridgeError::TransportUnavailable(_)
                | BridgeError::Timeout(_)
                | BridgeError::AuthFailure(_)
                | BridgeError::SessionExpired(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

// Error conversions for common error types

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout(e.to_string())
        } else if e.is_connect() {
            BridgeError::TransportUnavailable(e.to_string())
        } else {
            BridgeError::Transport(e.to_string())
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => BridgeError::Timeout("connection pool timed out".to_string()),
            sqlx::Error::Io(io) => BridgeError::TransportUnavailable(io.to_string()),
            other => BridgeError::Sql(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        BridgeError::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(BridgeError::NotReady("x".into()).kind(), "not_ready");
        assert_eq!(BridgeError::AlreadyBound("hook".into()).kind(), "already_bound");
        assert_eq!(BridgeError::ConfigInvalid("host".into()).kind(), "config_invalid");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::Timeout("t".into()).is_retryable());
        assert!(BridgeError::AuthFailure("a".into()).is_retryable());
        assert!(!BridgeError::Parse("p".into()).is_retryable());
        assert!(!BridgeError::OperationUnsupported("op".into()).is_retryable());
    }
}
