//! Error types for dataset access

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Transport or range failure. Never cached; the caller may retry.
    #[error("I/O error reading {key}: {reason}")]
    Io { key: String, reason: String },

    /// Header or index could not be parsed
    #[error("Invalid dataset {key}: {reason}")]
    Format { key: String, reason: String },

    /// A single record could not be decoded
    #[error("Malformed record at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },
}

impl SourceError {
    pub fn io(key: impl Into<String>, reason: impl ToString) -> Self {
        SourceError::Io { key: key.into(), reason: reason.to_string() }
    }

    pub fn format(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Format { key: key.into(), reason: reason.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Io { .. })
    }
}

impl From<SourceError> for overlay_core::OverlayError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Io { key, reason } => {
                overlay_core::OverlayError::SourceRead { source_key: key, reason }
            }
            other => overlay_core::OverlayError::Serialization(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
