//! prismflow Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

use super::ImageId;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Source Errors
    // =========================================================================
    #[error("Source image unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("Orchestration not found: {0}")]
    OrchestrationNotFound(ImageId),

    #[error("Orchestration {0} is leased by another instance")]
    LeaseHeld(ImageId),

    #[error("Invalid analyzer roster: {0}")]
    InvalidRoster(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Stored record corrupted: {0}")]
    RecordCorrupted(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Watcher error: {0}")]
    WatcherError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether the caller may retry the whole operation later.
    ///
    /// Store outages and source read failures are retryable from the event
    /// source; validation and corruption errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable(_) | CoreError::SourceUnreadable(_) | CoreError::IoError(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::StoreUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        assert!(CoreError::StoreUnavailable("db locked".into()).is_retryable());
        assert!(CoreError::SourceUnreadable("images/a.jpg".into()).is_retryable());
        assert!(!CoreError::ValidationError("bad".into()).is_retryable());
        assert!(!CoreError::RecordCorrupted("x".into()).is_retryable());
    }

    #[test]
    fn test_sqlite_error_maps_to_store_unavailable() {
        let err: CoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
    }
}
