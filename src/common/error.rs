//! Error types for stockgroup

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Group Errors ===
    #[error("Membership error: {0}")]
    Membership(String),

    #[error("Broadcast of {method} timed out waiting for {pending} member(s)")]
    TransportTimeout { method: String, pending: usize },

    #[error("Timed out acquiring lock {0}")]
    LockTimeout(String),

    #[error("State transfer failed: {0}")]
    StateTransfer(String),

    #[error("Application error on {member}: {message}")]
    Application { member: String, message: String },

    // === Network Errors ===
    #[error("Member unreachable: {0}")]
    Unreachable(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // === Generic ===

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Nothing in the crate retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout { .. } | Error::LockTimeout(_) | Error::Unreachable(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidConfig(_) | Error::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Error::TransportTimeout { .. } | Error::LockTimeout(_) => {
                StatusCode::REQUEST_TIMEOUT
            }
            Error::Membership(_) | Error::StateTransfer(_) | Error::Unreachable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Application { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable() {
        assert!(Error::LockTimeout("lock AAPL".into()).is_retryable());
        assert!(Error::TransportTimeout {
            method: "set_stock".into(),
            pending: 1
        }
        .is_retryable());
        assert!(!Error::StateTransfer("no provider".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::Membership("not serving".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::LockTimeout("lock AAPL".into()).to_http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }
}
