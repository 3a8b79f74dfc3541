//! Area of a target dataset that falls inside a geography.

use crate::area::area_square_km;
use crate::clip::{CandidateError, ClipStats};
use crate::cover::Classification;
use crate::prepare::PreparedSketch;
use geo::{BooleanOps, BoundingRect, Intersects, MultiPolygon};
use overlay_core::error::{OverlayError, Result};
use overlay_core::models::MetricValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A target feature: its properties and geometry
pub type OverlapCandidate = (Map<String, Value>, MultiPolygon<f64>);

#[derive(Debug, Clone, Default)]
pub struct OverlapOutcome {
    /// Area in km² per class, with the grand total under
    /// [`MetricValue::TOTAL_CLASS`]
    pub square_km_by_class: BTreeMap<String, f64>,
    pub stats: ClipStats,
}

/// Class label for a feature, from the `group_by` property
fn class_of(properties: &Map<String, Value>, group_by: &str) -> Option<String> {
    match properties.get(group_by)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn union_into(acc: &mut MultiPolygon<f64>, piece: &MultiPolygon<f64>) {
    *acc = if acc.0.is_empty() { piece.clone() } else { acc.union(piece) };
}

/// Intersect each target feature with the geography and sum the covered
/// area, overall and per `group_by` class.
///
/// Pieces within one class are unioned before measuring, so overlapping
/// target features are not counted twice. Features without the `group_by`
/// property only contribute to the total.
pub fn overlap_area_by_class<I>(
    geography: &PreparedSketch,
    group_by: Option<&str>,
    candidates: I,
) -> Result<OverlapOutcome>
where
    I: IntoIterator<Item = std::result::Result<OverlapCandidate, CandidateError>>,
{
    let mut stats = ClipStats::default();
    let mut total = MultiPolygon(Vec::new());
    let mut classes: BTreeMap<String, MultiPolygon<f64>> = BTreeMap::new();

    for candidate in candidates {
        let (properties, geometry) = match candidate {
            Ok(candidate) => candidate,
            Err(CandidateError::Decode(reason)) => {
                stats.decode_errors += 1;
                tracing::warn!(%reason, "skipping malformed target feature");
                continue;
            }
            Err(CandidateError::Io { source_key, reason }) => {
                return Err(OverlayError::SourceRead { source_key, reason });
            }
        };
        stats.candidates += 1;

        let Some(bbox) = geometry.bounding_rect() else {
            stats.bbox_rejected += 1;
            continue;
        };
        if !geography.envelopes.iter().any(|e| e.intersects(&bbox)) {
            stats.bbox_rejected += 1;
            continue;
        }

        let piece = match geography.cover.classify(&bbox) {
            Classification::OutsideFast => {
                stats.outside_fast += 1;
                continue;
            }
            Classification::InsideFast => {
                stats.inside_fast += 1;
                geometry
            }
            Classification::Uncertain => {
                stats.exact += 1;
                geography.geometry.intersection(&geometry)
            }
        };
        if piece.0.is_empty() {
            continue;
        }

        union_into(&mut total, &piece);
        if let Some(class) = group_by.and_then(|g| class_of(&properties, g)) {
            union_into(classes.entry(class).or_insert_with(|| MultiPolygon(Vec::new())), &piece);
        }
    }

    let mut square_km_by_class: BTreeMap<String, f64> =
        classes.iter().map(|(class, geometry)| (class.clone(), area_square_km(geometry))).collect();
    square_km_by_class.insert(MetricValue::TOTAL_CLASS.to_string(), area_square_km(&total));

    Ok(OverlapOutcome { square_km_by_class, stats })
}
