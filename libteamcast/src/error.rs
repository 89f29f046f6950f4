//! Error types for Teamcast

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TeamcastError>;

#[derive(Error, Debug)]
pub enum TeamcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
}

impl TeamcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TeamcastError::Validation(_) | TeamcastError::TaskNotFound(_) => 3,
            TeamcastError::Platform(PlatformError::Authentication(_)) => 2,
            TeamcastError::Config(_) => 2,
            TeamcastError::Platform(_) => 1,
            TeamcastError::Database(_) => 1,
            TeamcastError::InvalidTransition { .. } => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to encode stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Whether a failed attempt may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl PlatformError {
    /// Retry classification used by the task state machine
    ///
    /// Connectivity problems, platform-side throttling and 5xx responses are
    /// transient. Credential problems, malformed content and permanent
    /// rejections are fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            PlatformError::Network(_)
            | PlatformError::Timeout(_)
            | PlatformError::RateLimit(_)
            | PlatformError::Server { .. } => ErrorClass::Transient,
            PlatformError::Authentication(_)
            | PlatformError::Validation(_)
            | PlatformError::Rejected(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_validation() {
        let error = TeamcastError::Validation("unknown platform".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = TeamcastError::Platform(PlatformError::Authentication("expired".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = TeamcastError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_platform_errors() {
        for platform_error in [
            PlatformError::Network("reset".to_string()),
            PlatformError::Rejected("duplicate".to_string()),
            PlatformError::Server {
                status: 503,
                message: "unavailable".to_string(),
            },
        ] {
            assert_eq!(TeamcastError::Platform(platform_error).exit_code(), 1);
        }
    }

    #[test]
    fn test_error_message_formatting() {
        let error = TeamcastError::Platform(PlatformError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        });
        assert_eq!(
            error.to_string(),
            "Platform error: Server error (502): bad gateway"
        );

        let error = TeamcastError::InvalidTransition {
            task_id: "t-1".to_string(),
            from: "succeeded".to_string(),
            to: "ready".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid state transition for task t-1: succeeded -> ready"
        );
    }

    #[test]
    fn test_config_invalid_formatting() {
        let error = ConfigError::invalid("retry.jitter_ratio", "must be below 0.33");
        assert_eq!(
            error.to_string(),
            "Invalid value for retry.jitter_ratio: must be below 0.33"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlatformError::Network("x".into()).is_transient());
        assert!(PlatformError::Timeout("x".into()).is_transient());
        assert!(PlatformError::RateLimit("x".into()).is_transient());
        assert!(PlatformError::Server {
            status: 500,
            message: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert_eq!(PlatformError::Authentication("x".into()).class(), ErrorClass::Fatal);
        assert_eq!(PlatformError::Validation("x".into()).class(), ErrorClass::Fatal);
        assert_eq!(PlatformError::Rejected("x".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_error_conversion_from_platform_error() {
        let converted: TeamcastError = PlatformError::Timeout("slow".to_string()).into();
        match converted {
            TeamcastError::Platform(PlatformError::Timeout(msg)) => assert_eq!(msg, "slow"),
            _ => panic!("Expected TeamcastError::Platform"),
        }
    }

    #[test]
    fn test_error_conversion_from_db_error() {
        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "test",
        ));
        let converted: TeamcastError = db_error.into();
        assert!(matches!(converted, TeamcastError::Database(_)));
    }
}
