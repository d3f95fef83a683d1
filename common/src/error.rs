//! Error handling for the rill-common crate.

use thiserror::Error;

/// Common error type that abstracts over underlying library errors.
///
/// Variants carry a message plus an optional source error so call sites can
/// chain the underlying failure without exposing library types upward.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Caller-supplied arguments failed validation. Raised before any work
    /// is fanned out and never retried.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Store operation failed: {message}")]
    StoreError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Codec failure: {message}")]
    CodecError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A remote peer reported a failure while executing its share of a task.
    #[error("Remote task failed: {message}")]
    RemoteError { message: String },

    /// A user-supplied hook (map/reduce/init) returned an error.
    #[error("Task failed: {message}")]
    TaskError { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

impl CommonError {
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn io_error<S: Into<String>>(message: S) -> Self {
        Self::IoError {
            message: message.into(),
            source: None,
        }
    }

    pub fn io_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::IoError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn store_error<S: Into<String>>(message: S) -> Self {
        Self::StoreError {
            message: message.into(),
            source: None,
        }
    }

    pub fn store_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::StoreError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn codec_error<S: Into<String>>(message: S) -> Self {
        Self::CodecError {
            message: message.into(),
            source: None,
        }
    }

    pub fn remote_error<S: Into<String>>(message: S) -> Self {
        Self::RemoteError {
            message: message.into(),
        }
    }

    pub fn task_error<S: Into<String>>(message: S) -> Self {
        Self::TaskError {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    /// Validation, codec, and user-task failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommonError::IoError { .. } | CommonError::StoreError { .. }
        )
    }
}
