//! Error types for engine orchestration

use overlay_core::OverlayError;
use overlay_source::SourceError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Worker panicked during job {request_id}: {message}")]
    WorkerPanic { request_id: Uuid, message: String },

    #[error("Job {request_id} produced a {got} result")]
    UnexpectedResult { request_id: Uuid, got: &'static str },

    #[error("Failed to compute fragment {hash}: {reason}")]
    FragmentFailed { hash: String, reason: String },
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Overlay(e) => e.is_retryable(),
            EngineError::Source(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
