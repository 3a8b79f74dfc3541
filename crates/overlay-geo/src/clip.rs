//! Clipping a prepared sketch against a stream of candidate polygons.

use crate::cover::Classification;
use crate::prepare::PreparedSketch;
use geo::{Area, BooleanOps, BoundingRect, Intersects, MultiPolygon};
use overlay_core::error::{OverlayError, Result};
use overlay_core::models::ClipOp;
use thiserror::Error;

/// Failure attached to a single candidate
#[derive(Debug, Clone, Error)]
pub enum CandidateError {
    /// One malformed record; the clip logs it and continues
    #[error("malformed candidate: {0}")]
    Decode(String),

    /// The candidate stream itself failed; the clip aborts
    #[error("failed to read {source_key}: {reason}")]
    Io { source_key: String, reason: String },
}

/// Counters describing how candidates were handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClipStats {
    pub candidates: usize,
    /// Bounding box disjoint from every sketch envelope
    pub bbox_rejected: usize,
    pub outside_fast: usize,
    pub inside_fast: usize,
    /// Candidates that needed an exact boolean operation
    pub exact: usize,
    pub decode_errors: usize,
}

/// Result of a single clip operation
#[derive(Debug, Clone)]
pub struct ClipOutcome {
    pub geometry: MultiPolygon<f64>,
    /// Whether the output differs from the input sketch
    pub changed: bool,
    pub stats: ClipStats,
}

impl ClipOutcome {
    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty()
    }
}

fn same_area(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    let (a, b) = (a.unsigned_area(), b.unsigned_area());
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1e-12)
}

/// Clip a sketch against candidate polygons.
///
/// INTERSECT keeps the parts of the sketch covered by any candidate;
/// DIFFERENCE removes them. Candidates are screened by bounding box and the
/// sketch's rectangle cover before any exact operation. The running result
/// is accumulated as candidates arrive, so the iterator is consumed lazily.
pub fn clip_sketch_to_polygons<I>(sketch: &PreparedSketch, op: ClipOp, candidates: I) -> Result<ClipOutcome>
where
    I: IntoIterator<Item = std::result::Result<MultiPolygon<f64>, CandidateError>>,
{
    let mut stats = ClipStats::default();
    let mut touched = false;

    let mut acc = match op {
        ClipOp::Intersect => MultiPolygon(Vec::new()),
        ClipOp::Difference => sketch.geometry.clone(),
    };

    for candidate in candidates {
        let candidate = match candidate {
            Ok(geometry) => geometry,
            Err(CandidateError::Decode(reason)) => {
                stats.decode_errors += 1;
                tracing::warn!(%reason, "skipping malformed candidate");
                continue;
            }
            Err(CandidateError::Io { source_key, reason }) => {
                return Err(OverlayError::SourceRead { source_key, reason });
            }
        };
        stats.candidates += 1;

        let Some(bbox) = candidate.bounding_rect() else {
            stats.bbox_rejected += 1;
            continue;
        };
        if !sketch.envelopes.iter().any(|e| e.intersects(&bbox)) {
            stats.bbox_rejected += 1;
            continue;
        }

        let class = sketch.cover.classify(&bbox);
        match class {
            Classification::OutsideFast => {
                stats.outside_fast += 1;
                continue;
            }
            Classification::InsideFast => stats.inside_fast += 1,
            Classification::Uncertain => stats.exact += 1,
        }

        touched = true;
        match op {
            ClipOp::Intersect => {
                let piece = match class {
                    Classification::InsideFast => candidate,
                    _ => sketch.geometry.intersection(&candidate),
                };
                if !piece.0.is_empty() {
                    acc = if acc.0.is_empty() { piece } else { acc.union(&piece) };
                }
            }
            ClipOp::Difference => {
                acc = acc.difference(&candidate);
                if acc.0.is_empty() {
                    // Nothing left to remove from
                    break;
                }
            }
        }
    }

    let changed = match op {
        ClipOp::Intersect => !touched || !same_area(&acc, &sketch.geometry),
        ClipOp::Difference => touched && !same_area(&acc, &sketch.geometry),
    };

    let geometry = if changed { acc } else { sketch.geometry.clone() };

    tracing::debug!(
        %op,
        candidates = stats.candidates,
        inside_fast = stats.inside_fast,
        outside_fast = stats.outside_fast,
        exact = stats.exact,
        changed,
        "clipped sketch"
    );

    Ok(ClipOutcome { geometry, changed, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::CoverOptions;
    use geo::{polygon, Polygon};

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0), (x: x0 + size, y: y0), (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size), (x: x0, y: y0)
        ]
    }

    fn sketch(size: f64) -> PreparedSketch {
        PreparedSketch::from_geometry(
            MultiPolygon(vec![square(0.0, 0.0, size)]),
            CoverOptions::with_target(16),
        )
    }

    fn ok(p: Polygon<f64>) -> std::result::Result<MultiPolygon<f64>, CandidateError> {
        Ok(MultiPolygon(vec![p]))
    }

    #[test]
    fn test_intersect_with_partial_overlap() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Intersect, vec![ok(square(5.0, 0.0, 10.0))]).unwrap();
        assert!(out.changed);
        assert!((out.geometry.unsigned_area() - 50.0).abs() < 1e-6);
        assert_eq!(out.stats.exact, 1);
    }

    #[test]
    fn test_intersect_with_no_candidates_is_empty() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Intersect, Vec::new()).unwrap();
        assert!(out.changed);
        assert!(out.is_empty());
    }

    #[test]
    fn test_intersect_fully_covering_candidate_is_unchanged() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Intersect, vec![ok(square(-1.0, -1.0, 12.0))]).unwrap();
        assert!(!out.changed);
        assert_eq!(out.geometry, s.geometry);
    }

    #[test]
    fn test_inside_fast_candidate_skips_exact_operation() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Intersect, vec![ok(square(2.0, 2.0, 1.0))]).unwrap();
        assert_eq!(out.stats.inside_fast, 1);
        assert_eq!(out.stats.exact, 0);
        assert!((out.geometry.unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_candidates_are_unioned() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(
            &s,
            ClipOp::Intersect,
            vec![ok(square(0.0, 0.0, 6.0)), ok(square(4.0, 4.0, 6.0))],
        )
        .unwrap();
        // 36 + 36 - 4 overlap
        assert!((out.geometry.unsigned_area() - 68.0).abs() < 1e-6);
    }

    #[test]
    fn test_difference_of_disjoint_layer_is_noop() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Difference, vec![ok(square(50.0, 50.0, 5.0))]).unwrap();
        assert!(!out.changed);
        assert_eq!(out.geometry, s.geometry);
        assert_eq!(out.stats.bbox_rejected, 1);
    }

    #[test]
    fn test_difference_removes_overlap() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Difference, vec![ok(square(0.0, 0.0, 5.0))]).unwrap();
        assert!(out.changed);
        assert!((out.geometry.unsigned_area() - 75.0).abs() < 1e-6);
    }

    #[test]
    fn test_difference_covering_everything_is_empty() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(&s, ClipOp::Difference, vec![ok(square(-5.0, -5.0, 20.0))]).unwrap();
        assert!(out.changed);
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_errors_are_skipped() {
        let s = sketch(10.0);
        let out = clip_sketch_to_polygons(
            &s,
            ClipOp::Intersect,
            vec![Err(CandidateError::Decode("bad record".into())), ok(square(0.0, 0.0, 5.0))],
        )
        .unwrap();
        assert_eq!(out.stats.decode_errors, 1);
        assert!((out.geometry.unsigned_area() - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_io_error_aborts() {
        let s = sketch(10.0);
        let err = clip_sketch_to_polygons(
            &s,
            ClipOp::Intersect,
            vec![
                ok(square(0.0, 0.0, 5.0)),
                Err(CandidateError::Io { source_key: "eez".into(), reason: "reset".into() }),
            ],
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_clipping_is_idempotent() {
        let s = sketch(10.0);
        let layer = || vec![ok(square(5.0, 5.0, 10.0))];
        let first = clip_sketch_to_polygons(&s, ClipOp::Intersect, layer()).unwrap();
        let again = PreparedSketch::from_geometry(first.geometry.clone(), CoverOptions::with_target(16));
        let second = clip_sketch_to_polygons(&again, ClipOp::Intersect, layer()).unwrap();
        assert!(!second.changed);
        assert!((second.geometry.unsigned_area() - first.geometry.unsigned_area()).abs() < 1e-9);
    }
}
