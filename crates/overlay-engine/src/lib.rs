//! Overlay Engine - Clipping orchestration, fragments, and metric tasks
//!
//! Async orchestration on tokio over the CPU-bound primitives of
//! `overlay-geo`. Geometry work runs on a fixed [`WorkerPool`] of OS threads;
//! dataset features are streamed into it from the `overlay-source` cache
//! over bounded channels.

pub mod clipping;
pub mod error;
pub mod fragments;
pub mod geographies;
pub mod metrics;
pub mod overlap;
pub mod pool;

pub use clipping::{
    ClippingEngine, ClippingOptions, FragmentClip, FragmentRequest, FragmentResponse, GeographyClip,
    LayerOutcome, SketchFragment,
};
pub use error::{EngineError, Result};
pub use fragments::FragmentStore;
pub use geographies::{GeographyResolver, MemoryGeographyResolver};
pub use metrics::{CleanupReport, MetricEngine, MetricEngineConfig, ProcessOutcome};
pub use overlap::{
    calculate_geography_overlap, geography_sketch, overlap_with_dataset, OverlapProgress, OverlapReport,
};
pub use pool::{ClipJob, Job, JobOutcome, JobResult, JobValue, WorkerPool};
