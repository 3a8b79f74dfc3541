//! Area of a target dataset inside a geography.

use crate::clipping::ClippingEngine;
use crate::error::{EngineError, Result};
use crate::pool::{Job, JobValue, OverlapJob};
use futures::StreamExt;
use geo::{coord, BooleanOps, MultiPolygon, Rect};
use overlay_core::models::{ClipOp, ClippingLayer, DatasetFormat, MetricValue};
use overlay_core::OverlayError;
use overlay_geo::{CandidateError, ClipStats, PreparedSketch};
use overlay_source::{Query, SourceError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Progress reporting for long overlap calculations. Both callbacks are
/// advisory; the calculation never depends on them.
pub trait OverlapProgress: Send + Sync {
    fn progress(&self, _percent: f64, _message: &str) {}

    fn log(&self, _message: &str) {}
}

impl OverlapProgress for () {}

/// Overlap of a target dataset with a geography
#[derive(Debug, Clone, Default)]
pub struct OverlapReport {
    /// Area in km² per class, total under [`MetricValue::TOTAL_CLASS`]
    pub square_km_by_class: BTreeMap<String, f64>,
    pub stats: ClipStats,
}

impl OverlapReport {
    pub fn total_square_km(&self) -> f64 {
        self.square_km_by_class.get(MetricValue::TOTAL_CLASS).copied().unwrap_or(0.0)
    }

    pub fn into_value(self) -> MetricValue {
        MetricValue::OverlayArea { square_km_by_class: self.square_km_by_class }
    }
}

fn empty_report() -> OverlapReport {
    let mut square_km_by_class = BTreeMap::new();
    square_km_by_class.insert(MetricValue::TOTAL_CLASS.to_string(), 0.0);
    OverlapReport { square_km_by_class, stats: ClipStats::default() }
}

fn world_polygon() -> MultiPolygon<f64> {
    let rect = Rect::new(coord! { x: -180.0, y: -90.0 }, coord! { x: 180.0, y: 90.0 });
    MultiPolygon(vec![rect.to_polygon()])
}

/// Only packed datasets can be streamed by range
pub(crate) fn ensure_range_readable(format: DatasetFormat) -> Result<()> {
    if format != DatasetFormat::OverlayFgb {
        return Err(OverlayError::ConfigInvalid {
            key: "format".to_string(),
            reason: format!("{:?} datasets cannot be range-read", format),
        }
        .into());
    }
    Ok(())
}

/// Build a geography's shape from its layers alone: the union of its
/// INTERSECT layers minus every DIFFERENCE layer
pub async fn geography_sketch(
    engine: &ClippingEngine,
    layers: &[ClippingLayer],
    progress: &dyn OverlapProgress,
) -> Result<Arc<PreparedSketch>> {
    if !layers.iter().any(|l| l.op == ClipOp::Intersect) {
        return Err(OverlayError::ConfigInvalid {
            key: "clipping_layers".to_string(),
            reason: "at least one INTERSECT layer is required".to_string(),
        }
        .into());
    }

    let world = engine.sketch_from_geometry(world_polygon()).await?;
    let step = 40.0 / layers.len() as f64;

    let mut parts = Vec::new();
    let intersects = layers.iter().enumerate().filter(|(_, l)| l.op == ClipOp::Intersect);
    for (i, layer) in intersects {
        progress.progress(step * i as f64, &format!("Clipping to {}", layer.source));
        parts.push(engine.clip_layer(&world, layer).await?.geometry);
    }

    let cover = engine.options().cover;
    let mut sketch = engine
        .pool()
        .run_task(move || {
            let shape = parts
                .into_iter()
                .reduce(|acc, part| if acc.0.is_empty() { part } else { acc.union(&part) })
                .unwrap_or_else(|| MultiPolygon(Vec::new()));
            Ok(JobValue::Prepared(Box::new(PreparedSketch::from_geometry(shape, cover))))
        })
        .await?
        .into_prepared()
        .map(Arc::new)?;

    let differences = layers.iter().enumerate().filter(|(_, l)| l.op == ClipOp::Difference);
    for (i, layer) in differences {
        if sketch.is_empty() {
            break;
        }
        progress.progress(step * i as f64, &format!("Removing {}", layer.source));
        let outcome = engine.clip_layer(&sketch, layer).await?;
        if outcome.changed {
            sketch = engine.sketch_from_geometry(outcome.geometry).await?;
        }
    }

    progress.log(&format!("Geography built from {} layers", layers.len()));
    Ok(sketch)
}

/// Sum the area of `target` features inside `area`, overall and per
/// `group_by` class
pub async fn overlap_with_dataset(
    engine: &ClippingEngine,
    area: &Arc<PreparedSketch>,
    target: &str,
    group_by: Option<&str>,
    progress: &dyn OverlapProgress,
) -> Result<OverlapReport> {
    if area.is_empty() {
        progress.log("Geography is empty");
        return Ok(empty_report());
    }

    let source = engine.sources().get(target).await?;
    let plan = source.plan(&area.envelopes);
    progress.log(&format!(
        "Reading {} candidate features ({} bytes) from {}",
        plan.features,
        plan.bytes,
        source.key()
    ));

    let request_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(engine.options().channel_capacity.max(1));
    let job = OverlapJob {
        request_id,
        geography: Arc::clone(area),
        group_by: group_by.map(str::to_string),
        candidates: rx,
    };
    let pending = engine.pool().submit(Job::Overlap(job)).await?;

    let total = plan.features.max(1) as f64;
    let report_every = (plan.features / 20).max(1);
    let mut sent = 0u64;
    let mut features = source.features(Query::new(area.envelopes.clone()));
    while let Some(item) = features.next().await {
        let (candidate, fatal) = match item {
            Ok(feature) => (Ok((feature.properties, feature.geometry)), false),
            Err(SourceError::Decode { offset, reason }) => {
                progress.log(&format!("Skipping malformed feature at offset {}", offset));
                (Err(CandidateError::Decode(reason)), false)
            }
            Err(e) => (
                Err(CandidateError::Io { source_key: source.key().to_string(), reason: e.to_string() }),
                true,
            ),
        };
        if tx.send(candidate).await.is_err() || fatal {
            break;
        }
        sent += 1;
        if sent % report_every == 0 {
            progress.progress(40.0 + 60.0 * (sent as f64 / total).min(1.0), "Measuring overlap");
        }
    }
    drop(tx);

    let result = pending.await.map_err(|_| EngineError::PoolClosed)?;
    let outcome = result.into_overlap()?;
    progress.progress(100.0, "Done");

    tracing::info!(
        %request_id,
        dataset = %source.key(),
        candidates = outcome.stats.candidates,
        classes = outcome.square_km_by_class.len(),
        "measured overlap"
    );
    Ok(OverlapReport { square_km_by_class: outcome.square_km_by_class, stats: outcome.stats })
}

/// Area of `target` inside the geography defined by `layers`
pub async fn calculate_geography_overlap(
    engine: &ClippingEngine,
    layers: &[ClippingLayer],
    target: &str,
    format: DatasetFormat,
    group_by: Option<&str>,
    progress: &dyn OverlapProgress,
) -> Result<OverlapReport> {
    ensure_range_readable(format)?;
    progress.progress(0.0, "Building geography");
    let area = geography_sketch(engine, layers, progress).await?;
    overlap_with_dataset(engine, &area, target, group_by, progress).await
}
