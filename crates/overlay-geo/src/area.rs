//! Area measurement.

use geo::{Area, GeodesicArea, MultiPolygon};

pub const SQUARE_METERS_PER_SQUARE_KM: f64 = 1_000_000.0;

/// Geodesic area in square meters of a WGS84 geometry
pub fn geodesic_area_m2(geometry: &MultiPolygon<f64>) -> f64 {
    geometry.geodesic_area_unsigned()
}

/// Geodesic area in square kilometers of a WGS84 geometry
pub fn area_square_km(geometry: &MultiPolygon<f64>) -> f64 {
    geodesic_area_m2(geometry) / SQUARE_METERS_PER_SQUARE_KM
}

/// Area in square kilometers of a geometry already in an equal-area CRS
/// with metre units
pub fn planar_area_square_km(projected: &MultiPolygon<f64>) -> f64 {
    projected.unsigned_area() / SQUARE_METERS_PER_SQUARE_KM
}
