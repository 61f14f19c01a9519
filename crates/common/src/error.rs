//! Error types for meshlink

use thiserror::Error;

/// Result type alias using the meshlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshlink error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid roster entry '{name}': {reason}")]
    InvalidRosterEntry { name: String, reason: String },

    /// Remote endpoint not reachable yet. Retried locally with a fixed budget.
    #[error("Endpoint not reachable: {0}")]
    Transient(String),

    /// OS or driver level failure. Never retried.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn roster(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRosterEntry {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for Error {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_id() {
        let err = Error::not_found("link", "mesh0");
        assert_eq!(err.to_string(), "link 'mesh0' not found");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_roster_error() {
        let err = Error::roster("i1", "bad cidr");
        assert_eq!(err.to_string(), "Invalid roster entry 'i1': bad cidr");
    }
}
