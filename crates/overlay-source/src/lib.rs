//! Overlay Source - Range-readable vector datasets
//!
//! Datasets are packed feature files with an embedded block index, read
//! through byte-range requests. [`SourceCache`] keeps opened sources and
//! fetched ranges under one byte budget so repeated clips against the same
//! reference layers rarely touch the network.

pub mod cache;
pub mod error;
pub mod fetch;
pub mod format;
pub mod source;
pub mod source_cache;
pub mod writer;

pub use cache::{CacheStats, EvictionEvent, EvictionListener};
pub use error::{Result, SourceError};
pub use fetch::{
    ByteRange, DefaultRangeFetcher, FileRangeFetcher, HttpRangeFetcher, MemoryRangeFetcher,
    RangeFetcher,
};
pub use format::{BlockEntry, DatasetFeature, DatasetHeader};
pub use source::{PlannedRequest, Query, QueryPlan, Source};
pub use source_cache::{GetOptions, SourceCache};
pub use writer::DatasetWriter;
