//! Error types for webterm
//!
//! Provides a unified error type used across all webterm crates.

use std::path::PathBuf;

/// Main error type for webterm operations
#[derive(Debug, thiserror::Error)]
pub enum WebtermError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Admission Errors ===

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Connection rejected: {reason}")]
    AdmissionRejected { reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    // === Protocol Errors ===

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // === Transport Errors ===

    #[error("Process transport closed")]
    ProcessTransportClosed,

    #[error("Client transport closed")]
    ClientTransportClosed,

    #[error("Session cancelled")]
    Cancelled,

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === PTY Errors ===

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebtermError {
    /// Create an admission rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::AdmissionRejected {
            reason: reason.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a malformed message error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a PTY error
    pub fn pty(msg: impl Into<String>) -> Self {
        Self::Pty(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error should be answered with an authentication prompt
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }

    /// Whether the error ended a single session without affecting the server
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::ProcessTransportClosed
                | Self::ClientTransportClosed
                | Self::Cancelled
        )
    }
}

/// Result type alias using WebtermError
pub type Result<T> = std::result::Result<T, WebtermError>;

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Display Tests ====================

    #[test]
    fn test_error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = WebtermError::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_display_file_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = WebtermError::FileRead {
            path: PathBuf::from("/etc/webterm/config.toml"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to read file"));
        assert!(msg.contains("/etc/webterm/config.toml"));
    }

    #[test]
    fn test_error_display_file_write() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let err = WebtermError::FileWrite {
            path: PathBuf::from("/root/webterm.log"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/webterm.log"));
    }

    #[test]
    fn test_error_display_auth() {
        let err = WebtermError::AuthenticationFailed;
        assert_eq!(err.to_string(), "Authentication failed");
    }

    #[test]
    fn test_error_display_rejected() {
        let err = WebtermError::rejected("exceeding max number of connections");
        assert_eq!(
            err.to_string(),
            "Connection rejected: exceeding max number of connections"
        );
    }

    #[test]
    fn test_error_display_malformed() {
        let err = WebtermError::malformed("empty frame");
        assert_eq!(err.to_string(), "Malformed message: empty frame");
    }

    #[test]
    fn test_error_display_transports() {
        assert_eq!(
            WebtermError::ProcessTransportClosed.to_string(),
            "Process transport closed"
        );
        assert_eq!(
            WebtermError::ClientTransportClosed.to_string(),
            "Client transport closed"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = WebtermError::config("unknown title variable: nope");
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown title variable: nope"
        );
    }

    #[test]
    fn test_error_display_config_invalid() {
        let err = WebtermError::ConfigInvalid {
            path: PathBuf::from("/home/user/.config/webterm/config.toml"),
            message: "expected integer".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("expected integer"));
    }

    #[test]
    fn test_error_display_pty() {
        let err = WebtermError::pty("openpty failed");
        assert_eq!(err.to_string(), "PTY error: openpty failed");
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_is_auth_failure() {
        assert!(WebtermError::AuthenticationFailed.is_auth_failure());
        assert!(!WebtermError::handshake("timeout").is_auth_failure());
    }

    #[test]
    fn test_is_session_local() {
        assert!(WebtermError::ProcessTransportClosed.is_session_local());
        assert!(WebtermError::ClientTransportClosed.is_session_local());
        assert!(WebtermError::malformed("x").is_session_local());
        assert!(WebtermError::Cancelled.is_session_local());
        assert!(!WebtermError::config("x").is_session_local());
        assert!(!WebtermError::rejected("full").is_session_local());
    }

    #[test]
    fn test_io_error_conversion() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(WebtermError::Io(_))));
    }
}
