//! Overlay Store - Metric storage port and adapters
//!
//! The metric engine reads and writes rows only through [`MetricStore`].
//! The in-memory adapter backs development and tests; a database adapter
//! implements the same compare-and-set contract.

pub mod memory;
pub mod ports;

pub use memory::MemoryMetricStore;
pub use ports::{MetricQuery, MetricStore, RollupKey, Transition};
