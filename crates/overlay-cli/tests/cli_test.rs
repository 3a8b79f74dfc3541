//! End-to-end tests of the `overlay` binary

use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn overlay(dir: &Path, args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_overlay"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("Failed to execute command");
    assert!(
        output.status.success(),
        "overlay {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("Output should be valid JSON")
}

fn square(x: f64, y: f64, size: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]]
    })
}

/// Packs a land square and two habitat patches, and writes a geography
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let land = json!({
        "type": "FeatureCollection",
        "features": [{ "type": "Feature", "properties": { "name": "land" }, "geometry": square(0.0, 0.0, 10.0) }]
    });
    let habitats = json!({
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "properties": { "class": "reef" }, "geometry": square(2.0, 2.0, 2.0) },
            { "type": "Feature", "properties": { "class": "kelp" }, "geometry": square(6.0, 6.0, 2.0) }
        ]
    });
    std::fs::write(dir.path().join("land.geojson"), land.to_string()).unwrap();
    std::fs::write(dir.path().join("habitats.geojson"), habitats.to_string()).unwrap();

    let packed = overlay(dir.path(), &["--json", "pack", "land.geojson", "land.ovl"]);
    assert_eq!(packed["data"]["features"], 1);
    let packed = overlay(dir.path(), &["--json", "pack", "habitats.geojson", "habitats.ovl", "--block-size", "1"]);
    assert_eq!(packed["data"]["features"], 2);

    let geography = r#"
id = 1
name = "open water"

[[clipping_layers]]
source = "land.ovl"
op = "INTERSECT"

[[clipping_layers]]
source = "habitats.ovl"
op = "DIFFERENCE"
"#;
    std::fs::write(dir.path().join("geography.toml"), geography).unwrap();
    dir
}

#[test]
fn test_clip_prints_area_and_fragment_hash() {
    let dir = workspace();
    let sketch = json!({ "type": "Feature", "properties": { "name": "survey" }, "geometry": square(1.0, 1.0, 8.0) });
    std::fs::write(dir.path().join("sketch.geojson"), sketch.to_string()).unwrap();

    let result = overlay(dir.path(), &["--json", "clip", "sketch.geojson", "--geography", "geography.toml"]);
    let data = &result["data"];

    assert_eq!(result["status"], "success");
    assert!(data["square_km"].as_f64().unwrap() > 0.0);
    assert_eq!(data["fragment_hash"].as_str().unwrap().len(), 64);
    assert_eq!(data["feature"]["properties"]["name"], "survey");
    assert_eq!(data["layers"].as_array().unwrap().len(), 2);

    // Same input, same fragment
    let again = overlay(dir.path(), &["--json", "clip", "sketch.geojson", "--geography", "geography.toml"]);
    assert_eq!(again["data"]["fragment_hash"], data["fragment_hash"]);
}

#[test]
fn test_overlap_groups_by_class() {
    let dir = workspace();
    let geography = "id = 2\n\n[[clipping_layers]]\nsource = \"land.ovl\"\nop = \"INTERSECT\"\n";
    std::fs::write(dir.path().join("land_only.toml"), geography).unwrap();

    let result = overlay(
        dir.path(),
        &["--json", "overlap", "--geography", "land_only.toml", "--target", "habitats.ovl", "--group-by", "class"],
    );
    let classes = result["data"]["square_km_by_class"].as_object().unwrap();

    let reef = classes["reef"].as_f64().unwrap();
    let kelp = classes["kelp"].as_f64().unwrap();
    let total = classes["*"].as_f64().unwrap();
    assert!(reef > 0.0 && kelp > 0.0);
    assert!((total - (reef + kelp)).abs() / total < 1e-6);
}

#[test]
fn test_config_reports_sources() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("overlay.toml"), "cover_target = 12\n").unwrap();

    let result = overlay(dir.path(), &["--json", "--workers", "3", "config"]);
    let rows = result["data"].as_array().unwrap();
    let row = |key: &str| rows.iter().find(|r| r["key"] == key).cloned().unwrap();

    assert_eq!(row("cover_target")["value"], "12");
    assert_eq!(row("cover_target")["source"], "File");
    assert_eq!(row("worker_threads")["value"], "3");
    assert_eq!(row("worker_threads")["source"], "Cli");
    assert_eq!(row("cache_size")["source"], "Default");
}
