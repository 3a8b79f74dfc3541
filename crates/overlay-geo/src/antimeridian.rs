//! Splitting and re-joining geometry at the antimeridian.

use geo::{
    BooleanOps, BoundingRect, Coord, MapCoords, MultiPolygon, Polygon, Rect, Translate,
};

/// Tolerance for treating a longitude as lying on the antimeridian. Boolean
/// operations round through a fixed-point grid, so cut edges land close to
/// but not always exactly on ±180.
const EPSILON: f64 = 1e-7;

fn snap_to_antimeridian(polygon: Polygon<f64>) -> Polygon<f64> {
    polygon.map_coords(|c| {
        let x = if (c.x - 180.0).abs() < EPSILON {
            180.0
        } else if (c.x + 180.0).abs() < EPSILON {
            -180.0
        } else {
            c.x
        };
        Coord { x, y: c.y }
    })
}

/// Longitudes are accepted up to one full turn past the antimeridian.
pub const MAX_LONGITUDE: f64 = 540.0;

/// Split polygons whose longitudes leave [-180, 180] into parts that each
/// lie within it.
///
/// Edges are straight segments in longitude/latitude, so a ring crossing
/// the antimeridian must do so with continuous longitudes (e.g. -179 to
/// -181). A ring inside [-180, 180] is never split, however wide its edges.
/// Polygons reaching beyond ±[`MAX_LONGITUDE`] are dropped.
pub fn split_at_antimeridian(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let mut parts = Vec::new();

    for polygon in &geometry.0 {
        let Some(bbox) = polygon.bounding_rect() else { continue };

        if bbox.min().x >= -180.0 - EPSILON && bbox.max().x <= 180.0 + EPSILON {
            parts.push(polygon.clone());
            continue;
        }

        if bbox.min().x < -MAX_LONGITUDE || bbox.max().x > MAX_LONGITUDE {
            tracing::warn!(min_x = bbox.min().x, max_x = bbox.max().x, "dropping polygon beyond longitude bounds");
            continue;
        }
        let first = ((bbox.min().x + 180.0) / 360.0).floor() as i64;
        let last = ((bbox.max().x - 180.0) / 360.0).ceil() as i64;
        for k in first..=last {
            let shift = 360.0 * k as f64;
            let window = Rect::new(
                Coord { x: -180.0 + shift, y: -90.0 },
                Coord { x: 180.0 + shift, y: 90.0 },
            )
            .to_polygon();
            let piece = polygon.intersection(&window);
            for part in piece.0 {
                parts.push(snap_to_antimeridian(part.translate(-shift, 0.0)));
            }
        }
    }

    MultiPolygon(parts)
}

fn touches_west(polygon: &Polygon<f64>) -> bool {
    polygon.bounding_rect().is_some_and(|r| (r.min().x + 180.0).abs() < EPSILON)
}

fn touches_east(polygon: &Polygon<f64>) -> bool {
    polygon.bounding_rect().is_some_and(|r| (r.max().x - 180.0).abs() < EPSILON)
}

/// Rejoin parts split at the antimeridian.
///
/// Western parts touching -180 are shifted by +360 and unioned with eastern
/// parts touching +180. The output may therefore contain longitudes above
/// 180, the usual GeoJSON convention for antimeridian-crossing shapes.
/// Geometry with no parts on both sides is returned unchanged.
pub fn union_at_antimeridian(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    // A part spanning the whole longitude range stays where it is
    let is_west = |p: &Polygon<f64>| touches_west(p) && !touches_east(p);
    let is_east = |p: &Polygon<f64>| touches_east(p) && !touches_west(p);
    if !(geometry.0.iter().any(is_east) && geometry.0.iter().any(is_west)) {
        return geometry.clone();
    }

    let (west, rest): (Vec<_>, Vec<_>) = geometry.0.iter().cloned().partition(|p| is_west(p));

    let shifted = MultiPolygon(west.into_iter().map(|p| p.translate(360.0, 0.0)).collect());
    MultiPolygon(rest).union(&shifted)
}
