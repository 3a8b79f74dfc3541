//! Clipping orchestration: sketches against layers, geographies and fragments.

use crate::error::{EngineError, Result};
use crate::fragments::FragmentStore;
use crate::pool::{ClipJob, DecomposeJob, Job, JobValue, PrepareJob, WorkerPool};
use futures::StreamExt;
use geo::{BooleanOps, MultiPolygon};
use overlay_core::config::LayeredConfig;
use overlay_core::filter::FilterExpr;
use overlay_core::models::{ClipOp, ClippingLayer, Fragment, FragmentHash, Geography, GeographyId};
use overlay_core::OverlayError;
use overlay_geo::antimeridian::union_at_antimeridian;
use overlay_geo::area::area_square_km;
use overlay_geo::{prepare_sketch, CandidateError, ClipOutcome, ClipStats, CoverOptions, PrepareOptions, PreparedSketch};
use overlay_source::{GetOptions, Query, Source, SourceCache, SourceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Tuning for clip orchestration
#[derive(Debug, Clone, Copy)]
pub struct ClippingOptions {
    pub cover: CoverOptions,
    /// Capacity of each job's candidate channel
    pub channel_capacity: usize,
    /// Measure areas in EPSG:6933 instead of geodesically
    pub equal_area: bool,
}

impl Default for ClippingOptions {
    fn default() -> Self {
        Self { cover: CoverOptions::default(), channel_capacity: 256, equal_area: false }
    }
}

impl ClippingOptions {
    pub fn from_config(config: &LayeredConfig) -> Self {
        Self {
            cover: CoverOptions::with_target(config.cover_target.value),
            channel_capacity: config.candidate_channel_capacity.value,
            equal_area: config.equal_area.value,
        }
    }
}

/// What one clipping layer did to the running result
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutcome {
    /// Position in the geography's layer list
    pub index: usize,
    pub source: String,
    pub op: ClipOp,
    /// Not applied because an earlier layer left nothing
    pub skipped: bool,
    pub changed: bool,
    pub stats: ClipStats,
}

/// A sketch clipped to one geography
#[derive(Debug, Clone)]
pub struct GeographyClip {
    pub geography_id: GeographyId,
    /// Result with antimeridian-split parts rejoined
    pub geometry: MultiPolygon<f64>,
    /// Result as split parts, each within [-180, 180]
    pub parts: MultiPolygon<f64>,
    /// One entry per layer, in declared order
    pub layers: Vec<LayerOutcome>,
}

impl GeographyClip {
    pub fn is_empty(&self) -> bool {
        self.parts.0.is_empty()
    }
}

/// Fragments of a sketch and its clip to the best-matching geography
#[derive(Debug, Clone)]
pub struct FragmentClip {
    /// Union of the fragments in the primary geography, or `None` when the
    /// sketch misses every clipping geography
    pub clipped: Option<MultiPolygon<f64>>,
    pub primary_geography_id: Option<GeographyId>,
    pub fragments: Vec<Arc<Fragment>>,
}

/// Orchestrates clipping on the worker pool with candidates streamed from
/// the source cache
#[derive(Clone)]
pub struct ClippingEngine {
    pool: Arc<WorkerPool>,
    sources: SourceCache,
    fragments: FragmentStore,
    options: ClippingOptions,
}

impl ClippingEngine {
    pub fn new(pool: Arc<WorkerPool>, sources: SourceCache, fragments: FragmentStore, options: ClippingOptions) -> Self {
        Self { pool, sources, fragments, options }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn sources(&self) -> &SourceCache {
        &self.sources
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    pub fn options(&self) -> &ClippingOptions {
        &self.options
    }

    /// Validate and normalize a sketch feature on the pool
    pub async fn prepare(&self, feature: geojson::Feature) -> Result<Arc<PreparedSketch>> {
        let options = PrepareOptions { cover: self.options.cover, equal_area: self.options.equal_area };
        let result = self
            .pool
            .run_task(move || Ok(JobValue::Prepared(Box::new(prepare_sketch(&feature, &options)?))))
            .await?;
        Ok(Arc::new(result.into_prepared()?))
    }

    /// Wrap already-normalized geometry as a sketch, building its cover on the pool
    pub async fn sketch_from_geometry(&self, geometry: MultiPolygon<f64>) -> Result<Arc<PreparedSketch>> {
        let job = PrepareJob { request_id: Uuid::new_v4(), geometry, cover: self.options.cover };
        let sketch = self.pool.run(Job::Prepare(job)).await?.into_prepared()?;
        Ok(Arc::new(sketch))
    }

    /// Clip a sketch against the features of one source.
    ///
    /// Features matching the sketch envelopes and `filter` are streamed to a
    /// clip job over a bounded channel. A transport error ends the stream and
    /// fails the clip; malformed records are skipped by the job.
    pub async fn clip_sketch_to_polygons(
        &self,
        sketch: &Arc<PreparedSketch>,
        op: ClipOp,
        filter: Option<FilterExpr>,
        source: &Arc<Source>,
    ) -> Result<ClipOutcome> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let job = ClipJob { request_id, sketch: Arc::clone(sketch), op, candidates: rx };
        let pending = self.pool.submit(Job::Clip(job)).await?;

        let query = Query::new(sketch.envelopes.clone()).with_filter(filter);
        let mut features = source.features(query);
        while let Some(item) = features.next().await {
            let (candidate, fatal) = match item {
                Ok(feature) => (Ok(feature.geometry), false),
                Err(SourceError::Decode { offset, reason }) => (
                    Err(CandidateError::Decode(format!("record at offset {}: {}", offset, reason))),
                    false,
                ),
                Err(e) => (
                    Err(CandidateError::Io { source_key: source.key().to_string(), reason: e.to_string() }),
                    true,
                ),
            };
            // The job stops reading once a DIFFERENCE leaves nothing
            if tx.send(candidate).await.is_err() || fatal {
                break;
            }
        }
        drop(tx);

        let result = pending.await.map_err(|_| EngineError::PoolClosed)?;
        tracing::debug!(%request_id, dataset = %source.key(), %op, "clip job finished");
        result.into_clip()
    }

    /// Clip a sketch with one layer, opening its source through the cache
    pub async fn clip_layer(&self, sketch: &Arc<PreparedSketch>, layer: &ClippingLayer) -> Result<ClipOutcome> {
        let options = GetOptions::default().with_size_hint(layer.size_hint);
        let source = self.sources.get_with(&layer.source, options).await?;
        self.clip_sketch_to_polygons(sketch, layer.op, layer.filter.clone(), &source).await
    }

    /// Fold a geography's layers over the sketch in declared order.
    ///
    /// Each layer clips the running result. Once the result is empty the
    /// remaining layers are skipped.
    pub async fn clip_to_geography(&self, sketch: &Arc<PreparedSketch>, geography: &Geography) -> Result<GeographyClip> {
        if !geography.has_intersect_layer() {
            return Err(OverlayError::ConfigInvalid {
                key: format!("geography {} clipping_layers", geography.id),
                reason: "at least one INTERSECT layer is required".to_string(),
            }
            .into());
        }

        let mut current = Arc::clone(sketch);
        let mut empty = false;
        let mut layers = Vec::with_capacity(geography.clipping_layers.len());

        for (index, layer) in geography.clipping_layers.iter().enumerate() {
            if empty {
                layers.push(LayerOutcome {
                    index,
                    source: layer.source.clone(),
                    op: layer.op,
                    skipped: true,
                    changed: false,
                    stats: ClipStats::default(),
                });
                continue;
            }

            let outcome = self.clip_layer(&current, layer).await?;
            tracing::debug!(
                geography = geography.id,
                layer = index,
                source = %layer.source,
                op = %layer.op,
                changed = outcome.changed,
                empty = outcome.is_empty(),
                "applied clipping layer"
            );

            empty = outcome.is_empty();
            layers.push(LayerOutcome {
                index,
                source: layer.source.clone(),
                op: layer.op,
                skipped: false,
                changed: outcome.changed,
                stats: outcome.stats,
            });
            if outcome.changed && !empty {
                current = self.sketch_from_geometry(outcome.geometry).await?;
            }
        }

        let parts = if empty { MultiPolygon(Vec::new()) } else { current.geometry.clone() };
        Ok(GeographyClip {
            geography_id: geography.id,
            geometry: union_at_antimeridian(&parts),
            parts,
            layers,
        })
    }

    /// Clip the sketch to each geography and split overlapping results into
    /// disjoint fragments, each stored in the fragment store
    pub async fn create_fragments(&self, sketch: &Arc<PreparedSketch>, geographies: &[Geography]) -> Result<Vec<Arc<Fragment>>> {
        let mut clips = Vec::with_capacity(geographies.len());
        for geography in geographies {
            let clip = self.clip_to_geography(sketch, geography).await?;
            if !clip.is_empty() {
                clips.push((geography.id, clip.parts));
            }
        }
        if clips.is_empty() {
            return Ok(Vec::new());
        }

        let job = DecomposeJob { request_id: Uuid::new_v4(), clips };
        let pieces = self.pool.run(Job::Decompose(job)).await?.into_pieces()?;

        let mut fragments = Vec::with_capacity(pieces.len());
        for (hash, piece) in pieces {
            let key = hash.clone();
            let fragment = self
                .fragments
                .get_or_create(hash, move || async move {
                    Ok(Fragment::new(key, piece.geometry, piece.geography_ids))
                })
                .await?;
            fragments.push(fragment);
        }

        tracing::info!(geographies = geographies.len(), fragments = fragments.len(), "created fragments");
        Ok(fragments)
    }

    /// Create fragments, then clip the sketch to whichever of
    /// `for_clipping` it overlaps most
    pub async fn clip_to_geographies(
        &self,
        sketch: &Arc<PreparedSketch>,
        geographies: &[Geography],
        for_clipping: &[GeographyId],
    ) -> Result<FragmentClip> {
        let fragments = self.create_fragments(sketch, geographies).await?;

        let mut area_by_geography: BTreeMap<GeographyId, f64> = BTreeMap::new();
        for fragment in &fragments {
            let area = area_square_km(fragment.geometry());
            for id in fragment.geography_ids().iter().filter(|id| for_clipping.contains(id)) {
                *area_by_geography.entry(*id).or_default() += area;
            }
        }

        // Ties go to the lowest id
        let primary = area_by_geography
            .iter()
            .fold(None::<(GeographyId, f64)>, |best, (&id, &area)| match best {
                Some((_, best_area)) if best_area >= area => best,
                _ => Some((id, area)),
            })
            .map(|(id, _)| id);

        let Some(primary) = primary else {
            return Ok(FragmentClip { clipped: None, primary_geography_id: None, fragments });
        };

        let fragments: Vec<Arc<Fragment>> =
            fragments.into_iter().filter(|f| f.geography_ids().contains(&primary)).collect();
        let union = fragments.iter().fold(MultiPolygon(Vec::new()), |acc, f| {
            if acc.0.is_empty() {
                f.geometry().clone()
            } else {
                acc.union(f.geometry())
            }
        });

        Ok(FragmentClip {
            clipped: Some(union_at_antimeridian(&union)),
            primary_geography_id: Some(primary),
            fragments,
        })
    }

    /// Serve a fragment request, reporting failures in the response
    pub async fn handle_fragment_request(&self, request: FragmentRequest) -> FragmentResponse {
        match self.fragment_request(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "fragment request failed");
                FragmentResponse { success: false, clipped: None, fragments: Vec::new(), error: Some(e.to_string()) }
            }
        }
    }

    async fn fragment_request(&self, request: FragmentRequest) -> Result<FragmentResponse> {
        let properties = request.feature.properties.clone();
        let sketch = self.prepare(request.feature).await?;
        let result = self
            .clip_to_geographies(&sketch, &request.geographies, &request.geographies_for_clipping)
            .await?;

        let mut fragments: Vec<SketchFragment> = result
            .fragments
            .iter()
            .map(|f| SketchFragment {
                hash: f.hash().clone(),
                geography_ids: f.geography_ids().to_vec(),
                sketch_ids: Vec::new(),
                geometry: geojson::Geometry::new(geojson::Value::from(f.geometry())),
            })
            .collect();

        // Fragments of sibling sketches are passed through. The edited sketch's
        // id is removed from them; those that only belonged to it are stale.
        for mut existing in request.existing_overlapping_fragments {
            if let Some(id) = request.existing_sketch_id {
                existing.sketch_ids.retain(|s| *s != id);
                if existing.sketch_ids.is_empty() {
                    continue;
                }
            }
            fragments.push(existing);
        }

        let clipped = result.clipped.map(|geometry| geojson::Feature {
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&geometry))),
            properties,
            ..Default::default()
        });

        Ok(FragmentResponse { success: true, clipped, fragments, error: None })
    }
}

/// A fragment as exchanged with callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchFragment {
    pub hash: FragmentHash,
    pub geography_ids: Vec<GeographyId>,
    /// Sketches sharing this fragment; empty for the requesting sketch
    #[serde(default)]
    pub sketch_ids: Vec<i64>,
    pub geometry: geojson::Geometry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentRequest {
    pub feature: geojson::Feature,
    pub geographies: Vec<Geography>,
    pub geographies_for_clipping: Vec<GeographyId>,
    #[serde(default)]
    pub existing_overlapping_fragments: Vec<SketchFragment>,
    #[serde(default)]
    pub existing_sketch_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipped: Option<geojson::Feature>,
    #[serde(default)]
    pub fragments: Vec<SketchFragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
