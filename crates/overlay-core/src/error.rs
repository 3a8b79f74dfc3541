//! Error types for the overlay engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    // Geometry errors
    #[error("Invalid geometry at feature {feature_id}: {reason}")]
    InvalidGeometry { feature_id: String, reason: String },

    #[error("Projection failed: {0}")]
    Projection(String),

    // Lookup errors
    #[error("Geography not found: {id}")]
    GeographyNotFound { id: i64 },

    #[error("Fragment not found: {hash}")]
    FragmentNotFound { hash: String },

    #[error("Spatial metric not found: {id}")]
    MetricNotFound { id: u64 },

    // Metric errors
    #[error("Unsupported metric type: {metric_type}")]
    UnsupportedMetric { metric_type: String },

    #[error("Invalid state transition for metric {id}: {from} -> {to}")]
    InvalidTransition { id: u64, from: String, to: String },

    // Configuration errors
    #[error("Missing required configuration: {key}")]
    ConfigMissing { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    ConfigInvalid { key: String, reason: String },

    // Source errors
    #[error("Failed to read dataset {source_key}: {reason}")]
    SourceRead { source_key: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OverlayError {
    /// Shorthand for an invalid-geometry error on an unidentified feature
    pub fn invalid_geometry(reason: impl Into<String>) -> Self {
        OverlayError::InvalidGeometry { feature_id: "sketch".to_string(), reason: reason.into() }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OverlayError::Io(_) | OverlayError::Storage(_) | OverlayError::SourceRead { .. }
        )
    }
}

impl From<serde_json::Error> for OverlayError {
    fn from(e: serde_json::Error) -> Self {
        OverlayError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
