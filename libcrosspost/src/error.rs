//! Error types for Crosspost

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosspostError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The post exists but its current status forbids the change
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::InvalidInput(_)
            | CrosspostError::NotFound(_)
            | CrosspostError::Conflict(_) => 3,
            CrosspostError::Config(_) | CrosspostError::Database(_) => 2,
            CrosspostError::Platform(_) | CrosspostError::Io(_) => 1,
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

    #[error("{platform} is not configured: set {}", .variables.join(" or "))]
    MissingCredential {
        platform: String,
        variables: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Failure reported by a publisher.
///
/// Every expected failure mode of a platform call ends up here; publishers
/// never panic on a bad response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Insufficient permission: {0}")]
    Permission(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Posting failed: {0}")]
    Posting(String),
}

/// Classification stored alongside `last_error` on a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Permission,
    Validation,
    RateLimit,
    Network,
    Posting,
    LeaseExpired,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Posting => "posting",
            ErrorKind::LeaseExpired => "lease_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authentication" => Some(ErrorKind::Authentication),
            "permission" => Some(ErrorKind::Permission),
            "validation" => Some(ErrorKind::Validation),
            "rate_limit" => Some(ErrorKind::RateLimit),
            "network" => Some(ErrorKind::Network),
            "posting" => Some(ErrorKind::Posting),
            "lease_expired" => Some(ErrorKind::LeaseExpired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::Authentication(_) => ErrorKind::Authentication,
            PlatformError::Permission(_) => ErrorKind::Permission,
            PlatformError::Validation(_) => ErrorKind::Validation,
            PlatformError::RateLimit(_) => ErrorKind::RateLimit,
            PlatformError::Network(_) => ErrorKind::Network,
            PlatformError::Posting(_) => ErrorKind::Posting,
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Content that failed validation fails the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PlatformError::Validation(_))
    }

    /// Map an HTTP status from a platform API to an error
    pub fn from_status(platform: &str, status: u16, body: &str) -> Self {
        let detail = truncate_body(body);
        match status {
            401 => PlatformError::Authentication(format!(
                "{} rejected the credentials (HTTP 401): {}",
                platform, detail
            )),
            403 => PlatformError::Permission(format!(
                "{} refused the request (HTTP 403): {}",
                platform, detail
            )),
            429 => PlatformError::RateLimit(format!(
                "{} rate limit hit (HTTP 429): {}",
                platform, detail
            )),
            400 | 422 => PlatformError::Validation(format!(
                "{} rejected the content (HTTP {}): {}",
                platform, status, detail
            )),
            500..=599 => PlatformError::Network(format!(
                "{} server error (HTTP {}): {}",
                platform, status, detail
            )),
            _ => PlatformError::Posting(format!(
                "{} returned HTTP {}: {}",
                platform, status, detail
            )),
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            PlatformError::Network(format!("request timed out: {}", error))
        } else if error.is_decode() {
            PlatformError::Posting(format!("unexpected response body: {}", error))
        } else {
            PlatformError::Network(error.to_string())
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CrosspostError::InvalidInput("x".into()).exit_code(), 3);
        assert_eq!(CrosspostError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(CrosspostError::Conflict("x".into()).exit_code(), 3);
        assert_eq!(
            CrosspostError::Config(ConfigError::MissingField("database.path".into())).exit_code(),
            2
        );
        assert_eq!(
            CrosspostError::Platform(PlatformError::Network("down".into())).exit_code(),
            1
        );
    }

    #[test]
    fn test_missing_credential_names_variables() {
        let error = ConfigError::MissingCredential {
            platform: "x".to_string(),
            variables: vec!["X_BEARER_TOKEN".to_string(), "X_API_KEY".to_string()],
        };
        let message = error.to_string();
        assert!(message.contains("X_BEARER_TOKEN"));
        assert!(message.contains("X_API_KEY"));
        assert!(message.starts_with("x is not configured"));
    }

    #[test]
    fn test_from_status_mapping() {
        assert_eq!(
            PlatformError::from_status("X", 401, "").kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            PlatformError::from_status("X", 403, "").kind(),
            ErrorKind::Permission
        );
        assert_eq!(
            PlatformError::from_status("X", 429, "").kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            PlatformError::from_status("X", 503, "").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            PlatformError::from_status("X", 422, "").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            PlatformError::from_status("X", 404, "").kind(),
            ErrorKind::Posting
        );
    }

    #[test]
    fn test_only_validation_is_terminal() {
        assert!(!PlatformError::Validation("too long".into()).is_retryable());
        assert!(PlatformError::Authentication("expired".into()).is_retryable());
        assert!(PlatformError::Permission("read-only app".into()).is_retryable());
        assert!(PlatformError::RateLimit("429".into()).is_retryable());
        assert!(PlatformError::Network("reset".into()).is_retryable());
        assert!(PlatformError::Posting("odd body".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_round_trip_names() {
        for kind in [
            ErrorKind::Authentication,
            ErrorKind::Permission,
            ErrorKind::Validation,
            ErrorKind::RateLimit,
            ErrorKind::Network,
            ErrorKind::Posting,
            ErrorKind::LeaseExpired,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "e".repeat(1000);
        let message = PlatformError::from_status("WordPress", 500, &body).to_string();
        assert!(message.len() < 400);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CrosspostError::Platform(PlatformError::RateLimit("Too many requests".into()));
        assert_eq!(
            error.to_string(),
            "Platform error: Rate limit exceeded: Too many requests"
        );
    }
}
