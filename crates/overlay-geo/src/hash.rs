//! Content addressing for clipped geometry.
//!
//! Two clip results hash identically when they cover the same area with the
//! same vertices (up to ring rotation, polygon order and winding) and belong
//! to the same set of geographies. Coordinates are quantized before hashing
//! so floating point noise from the boolean operations does not split
//! otherwise identical fragments.

use geo::orient::{Direction, Orient};
use geo::{LineString, MultiPolygon};
use overlay_core::models::{FragmentHash, GeographyId};
use sha2::{Digest, Sha256};

/// Quantization step in degrees (about 11 cm at the equator)
pub const HASH_PRECISION: f64 = 1e-6;

pub type QuantRing = Vec<(i64, i64)>;

/// Quantized, canonical representation of a polygon: exterior then holes
pub type QuantPolygon = Vec<QuantRing>;

fn quantize(v: f64) -> i64 {
    (v / HASH_PRECISION).round() as i64
}

fn canonical_ring(ring: &LineString<f64>) -> QuantRing {
    let mut coords: QuantRing = Vec::with_capacity(ring.0.len());
    for c in &ring.0 {
        let q = (quantize(c.x), quantize(c.y));
        if coords.last() != Some(&q) {
            coords.push(q);
        }
    }
    // Drop the closing vertex
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if let Some(start) = coords.iter().enumerate().min_by_key(|(_, c)| **c).map(|(i, _)| i) {
        coords.rotate_left(start);
    }
    coords
}

/// Canonical quantized form of a multipolygon
pub fn canonicalize(geometry: &MultiPolygon<f64>) -> Vec<QuantPolygon> {
    let oriented = geometry.orient(Direction::Default);
    let mut polygons: Vec<QuantPolygon> = oriented
        .0
        .iter()
        .map(|polygon| {
            let mut holes: Vec<QuantRing> = polygon.interiors().iter().map(canonical_ring).collect();
            holes.sort();
            let mut rings = Vec::with_capacity(holes.len() + 1);
            rings.push(canonical_ring(polygon.exterior()));
            rings.extend(holes);
            rings
        })
        .filter(|rings| rings.first().is_some_and(|exterior| exterior.len() >= 3))
        .collect();
    polygons.sort();
    polygons
}

/// SHA-256 of canonical geometry plus the sorted, unique geography ids
pub fn content_hash(geometry: &MultiPolygon<f64>, geography_ids: &[GeographyId]) -> FragmentHash {
    let mut hasher = Sha256::new();

    let polygons = canonicalize(geometry);
    hasher.update((polygons.len() as u64).to_le_bytes());
    for rings in &polygons {
        hasher.update((rings.len() as u64).to_le_bytes());
        for ring in rings {
            hasher.update((ring.len() as u64).to_le_bytes());
            for (x, y) in ring {
                hasher.update(x.to_le_bytes());
                hasher.update(y.to_le_bytes());
            }
        }
    }

    let mut ids = geography_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    hasher.update((ids.len() as u64).to_le_bytes());
    for id in ids {
        hasher.update(id.to_le_bytes());
    }

    FragmentHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Polygon};
    use proptest::prelude::*;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0), (x: x0 + size, y: y0), (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size), (x: x0, y: y0)
        ]
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = content_hash(&MultiPolygon(vec![square(0.0, 0.0, 1.0)]), &[1]);
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_rotation_and_winding_do_not_matter() {
        let a = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let rotated_cw = MultiPolygon(vec![polygon![
            (x: 1.0, y: 1.0), (x: 1.0, y: 0.0), (x: 0.0, y: 0.0), (x: 0.0, y: 1.0), (x: 1.0, y: 1.0)
        ]]);
        assert_eq!(content_hash(&a, &[3]), content_hash(&rotated_cw, &[3]));
    }

    #[test]
    fn test_polygon_order_does_not_matter() {
        let a = MultiPolygon(vec![square(0.0, 0.0, 1.0), square(5.0, 5.0, 1.0)]);
        let b = MultiPolygon(vec![square(5.0, 5.0, 1.0), square(0.0, 0.0, 1.0)]);
        assert_eq!(content_hash(&a, &[1, 2]), content_hash(&b, &[2, 1, 2]));
    }

    #[test]
    fn test_geography_ids_change_hash() {
        let g = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        assert_ne!(content_hash(&g, &[1]), content_hash(&g, &[1, 2]));
    }

    #[test]
    fn test_sub_precision_noise_is_absorbed() {
        let a = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let b = MultiPolygon(vec![square(1e-9, -1e-9, 1.0 + 1e-10)]);
        assert_eq!(content_hash(&a, &[1]), content_hash(&b, &[1]));
    }

    #[test]
    fn test_distinct_geometry_distinct_hash() {
        let a = MultiPolygon(vec![square(0.0, 0.0, 1.0)]);
        let b = MultiPolygon(vec![square(0.0, 0.0, 1.001)]);
        assert_ne!(content_hash(&a, &[1]), content_hash(&b, &[1]));
    }

    proptest! {
        #[test]
        fn prop_hash_deterministic_under_rotation(
            x0 in -170.0f64..170.0,
            y0 in -80.0f64..80.0,
            size in 0.001f64..5.0,
            shift in 0usize..4,
        ) {
            let base = square(x0, y0, size);
            let mut ring: Vec<_> = base.exterior().0[..4].to_vec();
            ring.rotate_left(shift);
            ring.push(ring[0]);
            let rotated = Polygon::new(LineString(ring), vec![]);

            prop_assert_eq!(
                content_hash(&MultiPolygon(vec![base]), &[7]),
                content_hash(&MultiPolygon(vec![rotated]), &[7])
            );
        }
    }
}
