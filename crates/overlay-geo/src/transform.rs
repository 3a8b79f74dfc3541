//! Reprojection to an equal-area CRS

use geo::{MapCoords, MultiPolygon};
use overlay_core::error::{OverlayError, Result};
use proj::Proj;

/// Geographic coordinates of sketches and datasets
pub const GEOGRAPHIC_CRS: &str = "EPSG:4326";

/// NSIDC EASE-Grid 2.0 Global, a cylindrical equal-area projection in metres
pub const EQUAL_AREA_CRS: &str = "EPSG:6933";

/// Reproject a multipolygon between two known CRS
pub fn reproject_multipolygon(
    geometry: &MultiPolygon<f64>,
    from_crs: &str,
    to_crs: &str,
) -> Result<MultiPolygon<f64>> {
    if from_crs == to_crs {
        return Ok(geometry.clone());
    }

    let proj = Proj::new_known_crs(from_crs, to_crs, None).map_err(|e| {
        OverlayError::Projection(format!(
            "Failed to create projection from {} to {}: {}",
            from_crs, to_crs, e
        ))
    })?;

    geometry.try_map_coords(|coord| {
        proj.convert((coord.x, coord.y))
            .map(|(x, y)| geo::Coord { x, y })
            .map_err(|e| OverlayError::Projection(format!("Projection failed: {}", e)))
    })
}

/// Project WGS84 geometry into the equal-area CRS
pub fn to_equal_area(geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
    reproject_multipolygon(geometry, GEOGRAPHIC_CRS, EQUAL_AREA_CRS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::{area_square_km, planar_area_square_km};
    use geo::polygon;

    #[test]
    fn test_same_crs_is_identity() {
        let square = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
        ]]);
        let out = reproject_multipolygon(&square, GEOGRAPHIC_CRS, GEOGRAPHIC_CRS).unwrap();
        assert_eq!(out, square);
    }

    #[test]
    fn test_equal_area_agrees_with_geodesic_area() {
        let square = MultiPolygon(vec![polygon![
            (x: 10.0, y: 40.0), (x: 11.0, y: 40.0), (x: 11.0, y: 41.0), (x: 10.0, y: 41.0), (x: 10.0, y: 40.0)
        ]]);
        let projected = to_equal_area(&square).unwrap();
        let planar = planar_area_square_km(&projected);
        let geodesic = area_square_km(&square);
        assert!((planar - geodesic).abs() / geodesic < 0.01, "{} vs {}", planar, geodesic);
    }

    #[test]
    fn test_unknown_crs_is_projection_error() {
        let square = MultiPolygon(vec![]);
        let err = reproject_multipolygon(&square, GEOGRAPHIC_CRS, "EPSG:999999").unwrap_err();
        assert!(matches!(err, OverlayError::Projection(_)));
    }
}
