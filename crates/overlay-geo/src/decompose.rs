//! Split overlapping geography clips into disjoint pieces.

use crate::area::geodesic_area_m2;
use geo::{BooleanOps, BoundingRect, Intersects, MultiPolygon};
use overlay_core::models::GeographyId;
use std::collections::BTreeSet;

/// Pieces at or below this area are dropped
pub const MIN_PIECE_AREA_M2: f64 = 1.0;

/// A region covered by exactly the listed geographies
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentPiece {
    pub geometry: MultiPolygon<f64>,
    /// Sorted and unique
    pub geography_ids: Vec<GeographyId>,
}

fn bboxes_intersect(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(a), Some(b)) => a.intersects(&b),
        _ => false,
    }
}

/// Decompose per-geography clips into non-overlapping single-polygon pieces,
/// each tagged with every geography that covers it.
///
/// Clips are folded in order: each new clip splits existing pieces into the
/// part it covers and the part it does not, and whatever it covers outside
/// existing pieces becomes a new piece. Output polygons with a geodesic
/// area of at most [`MIN_PIECE_AREA_M2`] are dropped.
pub fn decompose_overlaps(clips: &[(GeographyId, MultiPolygon<f64>)]) -> Vec<FragmentPiece> {
    let mut pieces: Vec<(MultiPolygon<f64>, BTreeSet<GeographyId>)> = Vec::new();

    for (id, clip) in clips {
        if clip.0.is_empty() {
            continue;
        }
        let mut remainder = clip.clone();
        let mut next = Vec::with_capacity(pieces.len() + 1);

        for (piece, ids) in pieces {
            if !bboxes_intersect(&piece, clip) {
                next.push((piece, ids));
                continue;
            }
            let shared = piece.intersection(clip);
            if shared.0.is_empty() {
                next.push((piece, ids));
                continue;
            }
            let own = piece.difference(clip);
            if !remainder.0.is_empty() {
                remainder = remainder.difference(&piece);
            }

            let mut with_id = ids.clone();
            with_id.insert(*id);
            next.push((shared, with_id));
            if !own.0.is_empty() {
                next.push((own, ids));
            }
        }

        if !remainder.0.is_empty() {
            next.push((remainder, BTreeSet::from([*id])));
        }
        pieces = next;
    }

    pieces
        .into_iter()
        .flat_map(|(geometry, ids)| {
            let ids: Vec<GeographyId> = ids.into_iter().collect();
            geometry.0.into_iter().map(move |polygon| FragmentPiece {
                geometry: MultiPolygon(vec![polygon]),
                geography_ids: ids.clone(),
            })
        })
        .filter(|piece| geodesic_area_m2(&piece.geometry) > MIN_PIECE_AREA_M2)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x, y: y), (x: x + size, y: y), (x: x + size, y: y + size), (x: x, y: y + size), (x: x, y: y)
        ]])
    }

    fn ids_of(pieces: &[FragmentPiece]) -> Vec<Vec<GeographyId>> {
        let mut ids: Vec<_> = pieces.iter().map(|p| p.geography_ids.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_disjoint_clips_stay_separate() {
        let pieces = decompose_overlaps(&[(1, square(0.0, 0.0, 1.0)), (2, square(5.0, 5.0, 1.0))]);
        assert_eq!(ids_of(&pieces), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_overlap_produces_shared_piece() {
        let pieces = decompose_overlaps(&[(1, square(0.0, 0.0, 2.0)), (2, square(1.0, 0.0, 2.0))]);
        assert_eq!(ids_of(&pieces), vec![vec![1], vec![1, 2], vec![2]]);

        let shared = pieces.iter().find(|p| p.geography_ids == vec![1, 2]).unwrap();
        assert!((shared.geometry.unsigned_area() - 2.0).abs() < 1e-6);

        let total: f64 = pieces.iter().map(|p| p.geometry.unsigned_area()).sum();
        assert!((total - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_identical_clips_merge_ids() {
        let pieces = decompose_overlaps(&[(3, square(0.0, 0.0, 1.0)), (1, square(0.0, 0.0, 1.0))]);
        assert_eq!(ids_of(&pieces), vec![vec![1, 3]]);
    }

    #[test]
    fn test_tiny_pieces_are_dropped() {
        // About 1e-14 square degrees, far below one square metre
        let pieces = decompose_overlaps(&[(1, square(0.0, 0.0, 1e-7))]);
        assert!(pieces.is_empty());
    }

    #[test]
    fn test_multipart_clip_explodes() {
        let mut two = square(0.0, 0.0, 1.0);
        two.0.extend(square(3.0, 0.0, 1.0).0);
        let pieces = decompose_overlaps(&[(1, two)]);
        assert_eq!(pieces.len(), 2);
        assert!(pieces.iter().all(|p| p.geometry.0.len() == 1));
    }
}
