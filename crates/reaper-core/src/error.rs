use std::time::Duration;

use thiserror::Error;

/// Error types shared by the crawl core and its collaborators.
#[derive(Error, Debug)]
pub enum AppError {
    /// A constructor or setter received an out-of-range value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A scheduler command was issued while its guard did not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded operation (e.g. a liveness probe) ran out of time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A downloader collaborator failed while crawling a blog.
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Persisting blog state failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true for the cancellation signal, which is an expected outcome
    /// rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
