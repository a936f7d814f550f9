use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Corrupt page: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// True for the "page does not exist" family, which redo and checkpoint tolerate.
    #[must_use]
    pub const fn is_page_not_found(&self) -> bool {
        matches!(self, Self::PageNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_errors_display() {
        assert_eq!(StorageError::PageNotFound { page_id: 42 }.to_string(), "Page not found: 42");
        let err = StorageError::PageSizeMismatch { expected: 4096, actual: 10 };
        assert_eq!(err.to_string(), "Page size mismatch: expected 4096, got 10");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StorageError>();
    }
}
