//! Durable spatial metric tasks.
//!
//! Rows move `queued → processing → {complete, error}` through the store's
//! compare-and-set `transition`, so any number of engines may poll one store.
//! A worker that dies mid-computation leaves its row in `processing` until
//! [`MetricEngine::sweep_timeouts`] fails it.

use crate::clipping::ClippingEngine;
use crate::error::Result;
use crate::geographies::GeographyResolver;
use crate::overlap::{ensure_range_readable, geography_sketch, overlap_with_dataset};
use crate::pool::{Job, MeasureJob};
use chrono::{DateTime, Duration, Utc};
use overlay_core::config::LayeredConfig;
use overlay_core::models::{
    MetricId, MetricState, MetricSubject, MetricType, MetricValue, NewMetric, RollupGranularity,
    SpatialMetric,
};
use overlay_core::OverlayError;
use overlay_geo::PreparedSketch;
use overlay_store::{MetricQuery, MetricStore, RollupKey, Transition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Queued rows examined per `process_next` call
const CLAIM_BATCH: usize = 16;

/// Timing for processing, timeout sweeps and cleanup
#[derive(Debug, Clone, Copy)]
pub struct MetricEngineConfig {
    /// Rows queued (or requeued) longer than this fail with a timeout
    pub queued_timeout: Duration,
    /// Processing rows not updated within this fail with a timeout
    pub processing_timeout: Duration,
    /// Rows not claimed since they were last queued are purged after this
    pub unclaimed_retention: Duration,
    /// Non-error rows are purged after this
    pub retention: Duration,
    /// Hourly rollups older than this are merged into daily ones
    pub rollup_after: Duration,
    /// Idle wait between polls in `run_workers`
    pub poll_interval: std::time::Duration,
}

impl Default for MetricEngineConfig {
    fn default() -> Self {
        Self {
            queued_timeout: Duration::minutes(10),
            processing_timeout: Duration::minutes(5),
            unclaimed_retention: Duration::hours(24),
            retention: Duration::days(30),
            rollup_after: Duration::hours(48),
            poll_interval: std::time::Duration::from_millis(500),
        }
    }
}

impl MetricEngineConfig {
    pub fn from_config(config: &LayeredConfig) -> Result<Self> {
        Ok(Self {
            queued_timeout: timeout_from_secs("queued_timeout_secs", config.queued_timeout_secs.value)?,
            processing_timeout: timeout_from_secs(
                "processing_timeout_secs",
                config.processing_timeout_secs.value,
            )?,
            ..Self::default()
        })
    }
}

fn timeout_from_secs(key: &str, secs: u64) -> Result<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds).ok_or_else(|| {
        OverlayError::ConfigInvalid {
            key: key.to_string(),
            reason: format!("{} seconds is out of range", secs),
        }
        .into()
    })
}

/// `now - age`, or `None` when that instant is not representable and so no
/// row can be older
fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(age)
}

/// Result of one `process` call
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed(MetricValue),
    Failed(String),
    /// Another worker owns the row, or it is already finished
    Skipped { state: MetricState },
}

/// Rows and rollups affected by a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub unclaimed_deleted: usize,
    pub expired_deleted: usize,
    pub rollups_merged: usize,
    pub daily_rollups: usize,
}

/// Processes spatial metric rows held in a [`MetricStore`]
pub struct MetricEngine<S: MetricStore, R: GeographyResolver> {
    store: Arc<S>,
    resolver: Arc<R>,
    clipping: ClippingEngine,
    config: MetricEngineConfig,
}

impl<S: MetricStore, R: GeographyResolver> Clone for MetricEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            clipping: self.clipping.clone(),
            config: self.config,
        }
    }
}

impl<S: MetricStore, R: GeographyResolver> MetricEngine<S, R> {
    pub fn new(store: Arc<S>, resolver: Arc<R>, clipping: ClippingEngine, config: MetricEngineConfig) -> Self {
        Self { store, resolver, clipping, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clipping(&self) -> &ClippingEngine {
        &self.clipping
    }

    pub fn config(&self) -> &MetricEngineConfig {
        &self.config
    }

    /// Queue a metric for computation
    pub async fn submit(&self, metric: NewMetric) -> Result<MetricId> {
        let row = self.store.insert(metric, Utc::now()).await?;
        tracing::info!(metric_id = %row.id, metric_type = %row.metric_type, "queued metric");
        Ok(row.id)
    }

    /// Put a failed metric back in the queue
    pub async fn resubmit(&self, id: MetricId) -> Result<SpatialMetric> {
        let current = self.fetch(id).await?;
        match self.store.transition(id, &[MetricState::Error], Transition::requeue(), Utc::now()).await? {
            Some(row) => {
                tracing::info!(metric_id = %id, "resubmitted metric");
                Ok(row)
            }
            None => Err(OverlayError::InvalidTransition {
                id: id.0,
                from: current.state.to_string(),
                to: MetricState::Queued.to_string(),
            }
            .into()),
        }
    }

    async fn fetch(&self, id: MetricId) -> Result<SpatialMetric> {
        Ok(self.store.fetch(id).await?.ok_or(OverlayError::MetricNotFound { id: id.0 })?)
    }

    async fn skipped(&self, id: MetricId) -> Result<ProcessOutcome> {
        Ok(ProcessOutcome::Skipped { state: self.fetch(id).await?.state })
    }

    async fn record(&self, metric_type: &str, completed: bool, now: DateTime<Utc>) -> Result<()> {
        let key = RollupKey::at(metric_type, RollupGranularity::Hour, now);
        let (completed, failed) = if completed { (1, 0) } else { (0, 1) };
        self.store.increment_rollup(key, completed, failed).await?;
        Ok(())
    }

    /// Claim and compute one metric.
    ///
    /// Only a queued row is claimed. The value and the `complete` state are
    /// written in one transition; any failure writes `error` with a message.
    pub async fn process(&self, id: MetricId) -> Result<ProcessOutcome> {
        let metric = self.fetch(id).await?;
        if metric.state != MetricState::Queued {
            return Ok(ProcessOutcome::Skipped { state: metric.state });
        }

        let now = Utc::now();
        let Some(metric_type) = MetricType::parse(&metric.metric_type) else {
            let message = OverlayError::UnsupportedMetric { metric_type: metric.metric_type.clone() }.to_string();
            let failed = self.store.transition(id, &[MetricState::Queued], Transition::fail(&message), now).await?;
            if failed.is_none() {
                return self.skipped(id).await;
            }
            tracing::warn!(metric_id = %id, metric_type = %metric.metric_type, "unsupported metric type");
            self.record(&metric.metric_type, false, now).await?;
            return Ok(ProcessOutcome::Failed(message));
        };

        let claim = Transition::claim(now + self.config.processing_timeout);
        let Some(metric) = self.store.transition(id, &[MetricState::Queued], claim, now).await? else {
            return self.skipped(id).await;
        };

        let request_id = Uuid::new_v4();
        tracing::info!(metric_id = %id, %request_id, metric_type = metric_type.as_str(), "processing metric");

        let (transition, outcome) = match self.compute(metric_type, &metric).await {
            Ok(value) => (Transition::complete(value.clone()), ProcessOutcome::Completed(value)),
            Err(e) => {
                tracing::warn!(metric_id = %id, %request_id, error = %e, "metric failed");
                let message = e.to_string();
                (Transition::fail(&message), ProcessOutcome::Failed(message))
            }
        };
        let completed = matches!(outcome, ProcessOutcome::Completed(_));

        let now = Utc::now();
        // The timeout sweep may have failed the row in the meantime
        if self.store.transition(id, &[MetricState::Processing], transition, now).await?.is_none() {
            return self.skipped(id).await;
        }
        self.record(&metric.metric_type, completed, now).await?;
        tracing::info!(metric_id = %id, %request_id, completed, "finished metric");
        Ok(outcome)
    }

    async fn compute(&self, metric_type: MetricType, metric: &SpatialMetric) -> Result<MetricValue> {
        match metric_type {
            MetricType::TotalArea => {
                let geometry = match &metric.subject {
                    MetricSubject::Fragment { hash } => self
                        .clipping
                        .fragments()
                        .get(hash)
                        .ok_or_else(|| OverlayError::FragmentNotFound { hash: hash.to_string() })?
                        .geometry()
                        .clone(),
                    MetricSubject::Geography { .. } => self.subject_sketch(&metric.subject).await?.geometry.clone(),
                };
                let job = MeasureJob {
                    request_id: Uuid::new_v4(),
                    geometry,
                    equal_area: self.clipping.options().equal_area,
                };
                let square_km = self.clipping.pool().run(Job::Measure(job)).await?.into_area()?;
                Ok(MetricValue::TotalArea { square_km })
            }
            MetricType::OverlayArea => {
                let params = metric
                    .overlay
                    .as_ref()
                    .ok_or_else(|| OverlayError::ConfigMissing { key: "overlay".to_string() })?;
                ensure_range_readable(params.format)?;
                let sketch = self.subject_sketch(&metric.subject).await?;
                let report = overlap_with_dataset(
                    &self.clipping,
                    &sketch,
                    &params.source_url,
                    params.group_by.as_deref(),
                    &(),
                )
                .await?;
                Ok(report.into_value())
            }
        }
    }

    async fn subject_sketch(&self, subject: &MetricSubject) -> Result<Arc<PreparedSketch>> {
        match subject {
            MetricSubject::Fragment { hash } => {
                let fragment = self
                    .clipping
                    .fragments()
                    .get(hash)
                    .ok_or_else(|| OverlayError::FragmentNotFound { hash: hash.to_string() })?;
                self.clipping.sketch_from_geometry(fragment.geometry().clone()).await
            }
            MetricSubject::Geography { id } => {
                let geography = self.resolver.resolve(*id).await?;
                geography_sketch(&self.clipping, &geography.clipping_layers, &()).await
            }
        }
    }

    /// Process the oldest claimable queued row, if any
    pub async fn process_next(&self) -> Result<Option<(MetricId, ProcessOutcome)>> {
        let query = MetricQuery { limit: Some(CLAIM_BATCH), ..MetricQuery::in_state(MetricState::Queued) };
        for metric in self.store.list(&query).await? {
            match self.process(metric.id).await? {
                ProcessOutcome::Skipped { .. } => continue,
                outcome => return Ok(Some((metric.id, outcome))),
            }
        }
        Ok(None)
    }

    /// Poll for queued rows with `concurrency` workers until `shutdown`
    /// becomes true or its sender is dropped
    pub async fn run_workers(&self, concurrency: usize, shutdown: watch::Receiver<bool>) -> Result<()>
    where
        S: 'static,
        R: 'static,
    {
        let mut workers = JoinSet::new();
        for worker in 0..concurrency.max(1) {
            let engine = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let stop = *shutdown.borrow();
                    if stop {
                        break;
                    }
                    match engine.process_next().await {
                        Ok(Some((id, _))) => {
                            tracing::debug!(worker, metric_id = %id, "worker processed metric");
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(worker, error = %e, "metric worker poll failed"),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(engine.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "metric worker stopped abnormally");
            }
        }
        Ok(())
    }

    /// Fail rows stuck in `queued` or `processing` too long
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<MetricId>> {
        let queued = cutoff(now, self.config.queued_timeout).map(|before| MetricQuery {
            updated_before: Some(before),
            ..MetricQuery::in_state(MetricState::Queued)
        });
        let processing = cutoff(now, self.config.processing_timeout).map(|before| MetricQuery {
            updated_before: Some(before),
            ..MetricQuery::in_state(MetricState::Processing)
        });
        let sweeps = [
            (
                queued,
                format!("Timeout: not picked up within {}s", self.config.queued_timeout.num_seconds()),
            ),
            (
                processing,
                format!("Timeout: processing exceeded {}s", self.config.processing_timeout.num_seconds()),
            ),
        ];

        let mut timed_out = Vec::new();
        for (query, message) in sweeps {
            let Some(query) = query else { continue };
            for metric in self.store.list(&query).await? {
                let failed = self.store.transition(metric.id, &query.states, Transition::fail(&message), now).await?;
                if failed.is_some() {
                    self.record(&metric.metric_type, false, now).await?;
                    timed_out.push(metric.id);
                }
            }
        }

        if !timed_out.is_empty() {
            tracing::warn!(count = timed_out.len(), "timed out metrics");
        }
        Ok(timed_out)
    }

    /// Purge old rows and merge old hourly rollups into daily ones
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        if let Some(before) = cutoff(now, self.config.unclaimed_retention) {
            let unclaimed = MetricQuery { claimed: Some(false), updated_before: Some(before), ..Default::default() };
            let ids: Vec<MetricId> = self.store.list(&unclaimed).await?.iter().map(|m| m.id).collect();
            report.unclaimed_deleted = self.store.delete(&ids).await?;
        }

        if let Some(before) = cutoff(now, self.config.retention) {
            let expired = MetricQuery {
                states: vec![MetricState::Queued, MetricState::Processing, MetricState::Complete],
                updated_before: Some(before),
                ..Default::default()
            };
            let ids: Vec<MetricId> = self.store.list(&expired).await?.iter().map(|m| m.id).collect();
            report.expired_deleted = self.store.delete(&ids).await?;
        }

        if let Some(before) = cutoff(now, self.config.rollup_after) {
            let hourly = self.store.list_rollups(RollupGranularity::Hour, Some(before)).await?;
            let mut daily: BTreeMap<RollupKey, (u64, u64)> = BTreeMap::new();
            for rollup in &hourly {
                let key = RollupKey::at(rollup.metric_type.clone(), RollupGranularity::Day, rollup.bucket_start);
                let counts = daily.entry(key).or_default();
                counts.0 += rollup.completed;
                counts.1 += rollup.failed;
            }
            report.daily_rollups = daily.len();
            for (key, (completed, failed)) in daily {
                self.store.increment_rollup(key, completed, failed).await?;
            }
            let keys: Vec<RollupKey> = hourly.iter().map(RollupKey::of).collect();
            report.rollups_merged = self.store.delete_rollups(&keys).await?;
        }

        tracing::info!(
            unclaimed = report.unclaimed_deleted,
            expired = report.expired_deleted,
            rollups = report.rollups_merged,
            "metric cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_layers() {
        let mut config = LayeredConfig::with_defaults();
        config.processing_timeout_secs.value = 42;
        let engine_config = MetricEngineConfig::from_config(&config).unwrap();
        assert_eq!(engine_config.processing_timeout, Duration::seconds(42));
        assert_eq!(engine_config.queued_timeout, Duration::minutes(10));
        assert!(engine_config.retention > engine_config.unclaimed_retention);
    }

    #[test]
    fn test_out_of_range_timeout_is_config_error() {
        for secs in [u64::MAX, i64::MAX as u64, 10_000_000_000_000_000] {
            let mut config = LayeredConfig::with_defaults();
            config.queued_timeout_secs.value = secs;
            let err = MetricEngineConfig::from_config(&config).unwrap_err();
            assert!(matches!(
                err,
                crate::EngineError::Overlay(OverlayError::ConfigInvalid { ref key, .. }) if key == "queued_timeout_secs"
            ));
        }
    }

    #[test]
    fn test_unrepresentable_cutoff_matches_nothing() {
        let now = Utc::now();
        assert!(cutoff(now, Duration::days(200_000_000)).is_none());
        assert_eq!(cutoff(now, Duration::minutes(1)), Some(now - Duration::minutes(1)));
    }
}
