use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overlay_core::error::Result;
use overlay_core::models::{
    MetricId, MetricRollup, MetricState, MetricSubject, MetricValue, NewMetric, RollupGranularity,
    SpatialMetric,
};
use serde::{Deserialize, Serialize};

/// The fields written together with a state change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: MetricState,
    pub value: Option<MetricValue>,
    pub error_message: Option<String>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl Transition {
    /// `queued -> processing`, with the deadline for the worker
    pub fn claim(timeout_at: DateTime<Utc>) -> Self {
        Self { to: MetricState::Processing, value: None, error_message: None, timeout_at: Some(timeout_at) }
    }

    pub fn complete(value: MetricValue) -> Self {
        Self { to: MetricState::Complete, value: Some(value), error_message: None, timeout_at: None }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { to: MetricState::Error, value: None, error_message: Some(message.into()), timeout_at: None }
    }

    /// Back to `queued` with every result field cleared
    pub fn requeue() -> Self {
        Self { to: MetricState::Queued, value: None, error_message: None, timeout_at: None }
    }

    /// Write this transition into a row. Adapters that keep rows in memory
    /// share these semantics.
    pub fn apply(self, metric: &mut SpatialMetric, now: DateTime<Utc>) {
        match self.to {
            MetricState::Processing => metric.claimed = true,
            MetricState::Queued => metric.claimed = false,
            MetricState::Complete | MetricState::Error => {}
        }
        metric.state = self.to;
        metric.value = self.value;
        metric.error_message = self.error_message;
        metric.timeout_at = self.timeout_at;
        metric.updated_at = now;
    }
}

/// Row selection for [`MetricStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricQuery {
    pub states: Vec<MetricState>,
    pub subject: Option<MetricSubject>,
    pub claimed: Option<bool>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MetricQuery {
    pub fn in_state(state: MetricState) -> Self {
        Self { states: vec![state], ..Default::default() }
    }

    pub fn matches(&self, metric: &SpatialMetric) -> bool {
        (self.states.is_empty() || self.states.contains(&metric.state))
            && self.subject.as_ref().map_or(true, |s| *s == metric.subject)
            && self.claimed.map_or(true, |c| c == metric.claimed)
            && self.created_before.map_or(true, |t| metric.created_at < t)
            && self.updated_before.map_or(true, |t| metric.updated_at < t)
    }
}

/// Identity of a rollup bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RollupKey {
    pub metric_type: String,
    pub granularity: RollupGranularity,
    pub bucket_start: DateTime<Utc>,
}

impl RollupKey {
    /// Bucket containing `at`
    pub fn at(metric_type: impl Into<String>, granularity: RollupGranularity, at: DateTime<Utc>) -> Self {
        Self { metric_type: metric_type.into(), granularity, bucket_start: granularity.bucket_start(at) }
    }

    pub fn of(rollup: &MetricRollup) -> Self {
        Self {
            metric_type: rollup.metric_type.clone(),
            granularity: rollup.granularity,
            bucket_start: rollup.bucket_start,
        }
    }
}

/// Port for spatial metric rows and their rollups
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Insert a queued row and return it with its assigned id
    async fn insert(&self, metric: NewMetric, now: DateTime<Utc>) -> Result<SpatialMetric>;

    /// Get a row by id
    async fn fetch(&self, id: MetricId) -> Result<Option<SpatialMetric>>;

    /// Compare-and-set: apply `transition` only if the row is currently in
    /// one of `expected`. Returns the updated row, or `None` when the row was
    /// in another state. A missing row is `MetricNotFound`.
    async fn transition(
        &self,
        id: MetricId,
        expected: &[MetricState],
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<SpatialMetric>>;

    /// Rows matching the query, oldest id first
    async fn list(&self, query: &MetricQuery) -> Result<Vec<SpatialMetric>>;

    /// Delete rows, returning how many existed
    async fn delete(&self, ids: &[MetricId]) -> Result<usize>;

    /// Add to a rollup bucket, creating it if needed
    async fn increment_rollup(&self, key: RollupKey, completed: u64, failed: u64) -> Result<()>;

    /// Rollups of one granularity whose bucket starts before `before`
    async fn list_rollups(
        &self,
        granularity: RollupGranularity,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricRollup>>;

    /// Delete rollup buckets, returning how many existed
    async fn delete_rollups(&self, keys: &[RollupKey]) -> Result<usize>;
}
