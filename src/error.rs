/// Unified error handling for the umbral routing core
///
/// Construction-time problems surface as `Config` errors and leave nothing
/// half-built behind. Per-request problems (`NoBackendAvailable`,
/// `ConnectionLimitExceeded`, ...) are returned to the immediate caller and
/// never retried internally.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
use crate::reload::ReloadState;

/// Main error type for umbral operations
#[derive(Debug, Error)]
pub enum UmbralError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every backend of the pool is ejected, or the pool has none
    #[error("No backend available in pool '{pool}'")]
    NoBackendAvailable { pool: String },

    /// A client or server connection cap was reached
    #[error("Connection limit exceeded in pool '{pool}': {scope} limit {limit}")]
    ConnectionLimitExceeded {
        pool: String,
        scope: LimitScope,
        limit: u32,
    },

    /// The transport could not create a backend connection
    #[error("Failed to connect to server '{server}' of pool '{pool}': {source}")]
    ConnectFailed {
        pool: String,
        server: String,
        #[source]
        source: io::Error,
    },

    /// The transport could not open the pool listener
    #[error("Failed to listen for pool '{pool}': {source}")]
    Bind {
        pool: String,
        #[source]
        source: io::Error,
    },

    /// The pool is being replaced and does not take this request
    #[error("Pool '{pool}' is not accepting connections ({state})")]
    PoolNotAccepting { pool: String, state: ReloadState },

    /// Pool selector did not match any pool
    #[error("Unknown pool: {selector}")]
    UnknownPool { selector: String },

    /// A replacement is already running on this registry
    #[error("Pool replacement already in progress")]
    ReloadInProgress,

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Which connection cap was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// `client_connections` of the pool
    Client,
    /// `server_connections` of a single backend
    Server,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Client => write!(f, "client"),
            LimitScope::Server => write!(f, "server"),
        }
    }
}

/// Result type alias for umbral operations
pub type UmbralResult<T> = Result<T, UmbralError>;

/// Convenience methods for creating specific error types
impl UmbralError {
    /// Create a no-backend error
    pub fn no_backend<S: Into<String>>(pool: S) -> Self {
        UmbralError::NoBackendAvailable { pool: pool.into() }
    }

    /// Create a connection limit error
    pub fn limit<S: Into<String>>(pool: S, scope: LimitScope, limit: u32) -> Self {
        UmbralError::ConnectionLimitExceeded {
            pool: pool.into(),
            scope,
            limit,
        }
    }

    /// Create an unknown pool error
    pub fn unknown_pool<S: Into<String>>(selector: S) -> Self {
        UmbralError::UnknownPool {
            selector: selector.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        UmbralError::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            UmbralError::NoBackendAvailable { .. } => true,
            UmbralError::ConnectionLimitExceeded { .. } => true,
            UmbralError::ConnectFailed { .. } => true,
            UmbralError::PoolNotAccepting { .. } => true,
            UmbralError::Network(_) => true,
            UmbralError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            UmbralError::Config(_) => ErrorSeverity::Critical,
            UmbralError::Bind { .. } => ErrorSeverity::Critical,
            UmbralError::ReloadInProgress => ErrorSeverity::Error,
            UmbralError::UnknownPool { .. } => ErrorSeverity::Error,
            UmbralError::NoBackendAvailable { .. } => ErrorSeverity::Warning,
            UmbralError::ConnectFailed { .. } => ErrorSeverity::Warning,
            UmbralError::Network(_) => ErrorSeverity::Warning,
            UmbralError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = UmbralError::no_backend("alpha");
        assert!(matches!(error, UmbralError::NoBackendAvailable { .. }));
        assert_eq!(error.to_string(), "No backend available in pool 'alpha'");

        let error = UmbralError::limit("alpha", LimitScope::Client, 10);
        assert_eq!(
            error.to_string(),
            "Connection limit exceeded in pool 'alpha': client limit 10"
        );

        let error = UmbralError::timeout("connect to 10.0.0.1:11211");
        assert_eq!(error.to_string(), "Operation timed out: connect to 10.0.0.1:11211");
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_error_severity() {
        let config_error = UmbralError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let network_error =
            UmbralError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert_eq!(network_error.severity(), ErrorSeverity::Warning);

        let state_error = UmbralError::PoolNotAccepting {
            pool: "alpha".to_string(),
            state: ReloadState::Draining,
        };
        assert_eq!(state_error.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_recoverability() {
        assert!(UmbralError::no_backend("alpha").is_recoverable());
        assert!(UmbralError::limit("alpha", LimitScope::Server, 1).is_recoverable());

        let config_error = UmbralError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
        assert!(!UmbralError::ReloadInProgress.is_recoverable());
        assert!(!UmbralError::unknown_pool("beta").is_recoverable());
    }
}
