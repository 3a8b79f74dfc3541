//! Shared fixtures: small packed datasets served from memory.

#![allow(dead_code)]

use geo::{coord, MultiPolygon, Rect};
use overlay_core::filter::FilterExpr;
use overlay_core::models::{ClippingLayer, Geography};
use overlay_engine::{ClippingEngine, ClippingOptions, FragmentStore, WorkerPool};
use overlay_geo::CoverOptions;
use overlay_source::{DatasetWriter, MemoryRangeFetcher, SourceCache};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const LAND: &str = "mem://land.ovl";
pub const REEFS: &str = "mem://reefs.ovl";
pub const ZONES: &str = "mem://zones.ovl";

pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
    let rect = Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y });
    MultiPolygon(vec![rect.to_polygon()])
}

fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn pack(name: &str, features: Vec<(Value, MultiPolygon<f64>)>) -> Vec<u8> {
    let mut writer = DatasetWriter::new(name).block_size(2);
    for (properties, geometry) in features {
        writer.add(props(properties), geometry).unwrap();
    }
    writer.finish().unwrap()
}

/// Datasets used across the engine tests:
///
/// - `LAND`: one 10x10 degree square at the origin
/// - `REEFS`: a 2x2 "reef" at (2, 2) and a 2x2 "kelp" at (6, 6)
/// - `ZONES`: the land split into "west" and "east" halves at x = 5
pub fn fixtures() -> MemoryRangeFetcher {
    let fetcher = MemoryRangeFetcher::new();
    fetcher.insert(LAND, pack("land", vec![(json!({ "name": "land" }), rect(0.0, 0.0, 10.0, 10.0))]));
    fetcher.insert(
        REEFS,
        pack(
            "reefs",
            vec![
                (json!({ "class": "reef" }), rect(2.0, 2.0, 4.0, 4.0)),
                (json!({ "class": "kelp" }), rect(6.0, 6.0, 8.0, 8.0)),
            ],
        ),
    );
    fetcher.insert(
        ZONES,
        pack(
            "zones",
            vec![
                (json!({ "name": "west" }), rect(0.0, 0.0, 5.0, 10.0)),
                (json!({ "name": "east" }), rect(5.0, 0.0, 10.0, 10.0)),
            ],
        ),
    );
    fetcher
}

pub fn engine() -> ClippingEngine {
    engine_with(fixtures())
}

pub fn engine_with(fetcher: MemoryRangeFetcher) -> ClippingEngine {
    let pool = Arc::new(WorkerPool::new(2, 16).unwrap());
    let sources = SourceCache::with_fetcher(16 * 1024 * 1024, Arc::new(fetcher));
    let options = ClippingOptions { cover: CoverOptions::with_target(16), channel_capacity: 4, equal_area: false };
    ClippingEngine::new(pool, sources, FragmentStore::new(), options)
}

/// Land with the reefs cut out
pub fn open_water(id: i64) -> Geography {
    Geography::new(id, "open water")
        .layer(ClippingLayer::intersect(LAND))
        .layer(ClippingLayer::difference(REEFS))
}

pub fn zone(id: i64, name: &str) -> Geography {
    Geography::new(id, name).layer(ClippingLayer::intersect(ZONES).filter(FilterExpr::eq("name", name)))
}

pub fn sketch_feature(geometry: &MultiPolygon<f64>) -> geojson::Feature {
    geojson::Feature {
        geometry: Some(geojson::Geometry::new(geojson::Value::from(geometry))),
        properties: Some(Map::new()),
        ..Default::default()
    }
}
