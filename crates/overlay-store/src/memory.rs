//! In-memory metric storage for development and testing.
//!
//! This implementation uses `RwLock::unwrap()` intentionally. Lock poisoning
//! only occurs when another thread panicked while holding the lock, which is
//! an unrecoverable state. Each operation holds the write lock for its whole
//! read-modify-write, so `transition` is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overlay_core::error::{OverlayError, Result};
use overlay_core::models::{
    MetricId, MetricRollup, MetricState, NewMetric, RollupGranularity, SpatialMetric,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::ports::{MetricQuery, MetricStore, RollupKey, Transition};

/// In-memory implementation of MetricStore
#[derive(Debug, Clone, Default)]
pub struct MemoryMetricStore {
    metrics: Arc<RwLock<BTreeMap<MetricId, SpatialMetric>>>,
    rollups: Arc<RwLock<BTreeMap<RollupKey, MetricRollup>>>,
    next_id: Arc<RwLock<u64>>,
}

impl MemoryMetricStore {
    /// Create a new in-memory metric store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows
    pub fn len(&self) -> usize {
        self.metrics.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a row as-is, for seeding test fixtures
    pub fn put(&self, metric: SpatialMetric) {
        let mut metrics = self.metrics.write().unwrap();
        let mut next_id = self.next_id.write().unwrap();
        *next_id = (*next_id).max(metric.id.0);
        metrics.insert(metric.id, metric);
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn insert(&self, metric: NewMetric, now: DateTime<Utc>) -> Result<SpatialMetric> {
        let mut metrics = self.metrics.write().unwrap();
        let mut next_id = self.next_id.write().unwrap();

        *next_id += 1;
        let id = MetricId(*next_id);
        let row = SpatialMetric::new(id, metric, now);
        metrics.insert(id, row.clone());
        Ok(row)
    }

    async fn fetch(&self, id: MetricId) -> Result<Option<SpatialMetric>> {
        Ok(self.metrics.read().unwrap().get(&id).cloned())
    }

    async fn transition(
        &self,
        id: MetricId,
        expected: &[MetricState],
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<SpatialMetric>> {
        let mut metrics = self.metrics.write().unwrap();
        let metric = metrics.get_mut(&id).ok_or(OverlayError::MetricNotFound { id: id.0 })?;
        if !expected.contains(&metric.state) {
            return Ok(None);
        }
        tracing::debug!(metric_id = %id, from = %metric.state, to = %transition.to, "metric transition");
        transition.apply(metric, now);
        Ok(Some(metric.clone()))
    }

    async fn list(&self, query: &MetricQuery) -> Result<Vec<SpatialMetric>> {
        let metrics = self.metrics.read().unwrap();
        let matching = metrics.values().filter(|m| query.matches(m)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn delete(&self, ids: &[MetricId]) -> Result<usize> {
        let mut metrics = self.metrics.write().unwrap();
        Ok(ids.iter().filter(|id| metrics.remove(id).is_some()).count())
    }

    async fn increment_rollup(&self, key: RollupKey, completed: u64, failed: u64) -> Result<()> {
        let mut rollups = self.rollups.write().unwrap();
        let rollup = rollups.entry(key.clone()).or_insert_with(|| MetricRollup {
            metric_type: key.metric_type,
            granularity: key.granularity,
            bucket_start: key.bucket_start,
            completed: 0,
            failed: 0,
        });
        rollup.completed += completed;
        rollup.failed += failed;
        Ok(())
    }

    async fn list_rollups(
        &self,
        granularity: RollupGranularity,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricRollup>> {
        let rollups = self.rollups.read().unwrap();
        Ok(rollups
            .values()
            .filter(|r| r.granularity == granularity)
            .filter(|r| before.map_or(true, |t| r.bucket_start < t))
            .cloned()
            .collect())
    }

    async fn delete_rollups(&self, keys: &[RollupKey]) -> Result<usize> {
        let mut rollups = self.rollups.write().unwrap();
        Ok(keys.iter().filter(|k| rollups.remove(k).is_some()).count())
    }
}
