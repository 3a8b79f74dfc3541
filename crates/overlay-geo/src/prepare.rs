//! Sketch preparation: validate and normalize user geometry.

use crate::antimeridian::{split_at_antimeridian, MAX_LONGITUDE};
use crate::cover::{cover_with_rectangles, CoverIndex, CoverOptions};
use crate::transform::to_equal_area;
use geo::orient::{Direction, Orient};
use geo::{Area, BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect};
use geojson::{Feature, JsonObject, Position, Value};
use overlay_core::error::{OverlayError, Result};

/// Options for [`prepare_sketch`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareOptions {
    pub cover: CoverOptions,
    /// Also produce an equal-area projected copy for area measurement
    pub equal_area: bool,
}

/// Normalized sketch ready for clipping.
///
/// Coordinates lie within [-180, 180] x [-90, 90], exteriors are
/// counter-clockwise and holes clockwise. There is one envelope per polygon
/// part, used to query datasets, and a rectangle cover of the whole geometry.
#[derive(Debug, Clone)]
pub struct PreparedSketch {
    pub properties: Option<JsonObject>,
    pub geometry: MultiPolygon<f64>,
    pub envelopes: Vec<Rect<f64>>,
    pub cover: CoverIndex,
    /// Equal-area (EPSG:6933) copy of `geometry`, when requested
    pub projected: Option<MultiPolygon<f64>>,
}

impl PreparedSketch {
    /// Wrap already-normalized geometry, such as an intermediate clip result
    pub fn from_geometry(geometry: MultiPolygon<f64>, cover: CoverOptions) -> Self {
        let envelopes = geometry.0.iter().filter_map(|p| p.bounding_rect()).collect();
        let rectangles = cover_with_rectangles(&geometry, cover);
        Self {
            properties: None,
            cover: CoverIndex::from_cover(&rectangles),
            geometry,
            envelopes,
            projected: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty()
    }
}

fn invalid(reason: impl Into<String>) -> OverlayError {
    OverlayError::invalid_geometry(reason)
}

fn ring_from_positions(positions: &[Position], location: &str) -> Result<LineString<f64>> {
    let mut coords = Vec::with_capacity(positions.len() + 1);
    for (i, position) in positions.iter().enumerate() {
        let (x, y) = match position.as_slice() {
            [x, y, ..] => (*x, *y),
            _ => return Err(invalid(format!("{}[{}] has fewer than 2 ordinates", location, i))),
        };
        if !x.is_finite() || !y.is_finite() {
            return Err(invalid(format!("{}[{}] has non-finite coordinates", location, i)));
        }
        if x.abs() > MAX_LONGITUDE {
            return Err(invalid(format!(
                "{}[{}] has longitude {} outside [-{}, {}]",
                location, i, x, MAX_LONGITUDE, MAX_LONGITUDE
            )));
        }
        coords.push(Coord { x, y: y.clamp(-90.0, 90.0) });
    }

    if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
        if first != last {
            coords.push(first);
        }
    }

    if coords.len() < 4 {
        return Err(invalid(format!(
            "{} must have at least 4 positions, found {}",
            location,
            coords.len()
        )));
    }

    Ok(LineString(coords))
}

fn polygon_from_rings(rings: &[Vec<Position>], part: usize) -> Result<Polygon<f64>> {
    let Some((exterior, interiors)) = rings.split_first() else {
        return Err(invalid(format!("polygon {} has no rings", part)));
    };
    let exterior = ring_from_positions(exterior, &format!("polygon {} exterior", part))?;
    let interiors = interiors
        .iter()
        .enumerate()
        .map(|(i, ring)| ring_from_positions(ring, &format!("polygon {} interior {}", part, i)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Validate and normalize a sketch feature.
///
/// Rejects features without geometry, non-polygonal geometry, non-finite
/// coordinates, longitudes beyond ±540, rings with fewer than 4 positions
/// and zero-area input.
/// Unclosed rings are closed, latitudes clamped, parts crossing the
/// antimeridian split, and winding fixed.
pub fn prepare_sketch(feature: &Feature, options: &PrepareOptions) -> Result<PreparedSketch> {
    let geometry = feature.geometry.as_ref().ok_or_else(|| invalid("feature has no geometry"))?;

    let polygons = match &geometry.value {
        Value::Polygon(rings) => vec![polygon_from_rings(rings, 0)?],
        Value::MultiPolygon(parts) => parts
            .iter()
            .enumerate()
            .map(|(i, rings)| polygon_from_rings(rings, i))
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(invalid("feature geometry is not a polygon or multipolygon")),
    };

    let raw = MultiPolygon(polygons);
    if raw.0.is_empty() || raw.unsigned_area() == 0.0 {
        return Err(invalid("geometry has zero area"));
    }

    let geometry = split_at_antimeridian(&raw).orient(Direction::Default);

    let mut sketch = PreparedSketch::from_geometry(geometry, options.cover);
    sketch.properties = feature.properties.clone();

    if options.equal_area {
        sketch.projected = Some(to_equal_area(&sketch.geometry)?);
    }

    tracing::debug!(
        parts = sketch.geometry.0.len(),
        envelopes = sketch.envelopes.len(),
        inside_rects = sketch.cover.inside_len(),
        "prepared sketch"
    );

    Ok(sketch)
}
