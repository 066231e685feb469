//! Error types for fleetconf

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Data version is not initialized")]
    NoDataVersion,

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Store corrupted: {0}")]
    Corrupted(String),

    // === Node / Replication Errors ===
    #[error("Not master: admin writes go to {0}")]
    NotMaster(String),

    #[error("Node registration failed: {0}")]
    Registration(String),

    #[error("Invalid node identity: {0}")]
    InvalidNode(String),

    #[error("Unknown peer request type: {0}")]
    UnknownPeerRequest(String),

    #[error("Stale dataset: local version {local}, received {received}")]
    StaleDataset { local: u64, received: u64 },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Input Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Http(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotMaster(_) => StatusCode::FORBIDDEN,
            Error::InvalidRequest(_) | Error::UnknownPeerRequest(_) | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::StaleDataset { .. } => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
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
        assert!(Error::Timeout("pull".into()).is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::NotMaster("http://m".into()).is_retryable());
        assert!(!Error::Registration("disk full".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            Error::NotFound("app".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::NotMaster("http://m".into()).to_http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::AlreadyExists("user".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Internal("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
