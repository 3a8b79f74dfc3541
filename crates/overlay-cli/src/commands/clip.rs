//! Clip command implementation

use crate::cli::ClipArgs;
use crate::config_loader::{build_engine, load_geography};
use crate::output::OutputWriter;
use anyhow::{bail, Context, Result};
use geojson::{Feature, GeoJson};
use overlay_core::config::LayeredConfig;
use overlay_engine::LayerOutcome;
use overlay_geo::area::area_square_km;
use overlay_geo::content_hash;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct LayerRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Candidates")]
    candidates: usize,
    #[tabled(rename = "Exact")]
    exact: usize,
}

impl From<&LayerOutcome> for LayerRow {
    fn from(layer: &LayerOutcome) -> Self {
        let status = if layer.skipped {
            "skipped"
        } else if layer.changed {
            "clipped"
        } else {
            "unchanged"
        };
        Self {
            index: layer.index,
            source: layer.source.clone(),
            op: layer.op.to_string(),
            status: status.to_string(),
            candidates: layer.stats.candidates,
            exact: layer.stats.exact,
        }
    }
}

#[derive(Serialize)]
struct ClipOutput {
    feature: Option<Feature>,
    square_km: f64,
    fragment_hash: Option<String>,
    layers: Vec<LayerRow>,
}

async fn read_sketch(path: &Path) -> Result<Feature> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read sketch {}", path.display()))?;
    let geojson: GeoJson =
        content.parse().with_context(|| format!("Failed to parse GeoJSON in {}", path.display()))?;

    match geojson {
        GeoJson::Feature(feature) => Ok(feature),
        GeoJson::FeatureCollection(mut collection) if collection.features.len() == 1 => {
            Ok(collection.features.remove(0))
        }
        GeoJson::FeatureCollection(collection) => {
            bail!("Sketch must be a single feature, found {}", collection.features.len())
        }
        GeoJson::Geometry(geometry) => Ok(Feature { geometry: Some(geometry), ..Default::default() }),
    }
}

pub async fn execute(args: ClipArgs, config: &LayeredConfig, output: &OutputWriter) -> Result<()> {
    let feature = read_sketch(&args.sketch).await?;
    let properties = feature.properties.clone();
    let geography = load_geography(&args.geography)?;
    let engine = build_engine(config)?;

    let sketch = engine.prepare(feature).await.context("Invalid sketch")?;
    let clip = engine
        .clip_to_geography(&sketch, &geography)
        .await
        .with_context(|| format!("Failed to clip to geography {}", geography.id))?;

    let layers: Vec<LayerRow> = clip.layers.iter().map(LayerRow::from).collect();

    if clip.is_empty() {
        output.warning(format!("Sketch does not overlap geography {}", geography.id));
        output.table(layers);
        return output.result(ClipOutput { feature: None, square_km: 0.0, fragment_hash: None, layers: Vec::new() });
    }

    let square_km = area_square_km(&clip.parts);
    let hash = content_hash(&clip.parts, &[geography.id]);
    let clipped = Feature {
        geometry: Some(geojson::Geometry::new(geojson::Value::from(&clip.geometry))),
        properties,
        ..Default::default()
    };

    if output.is_json() {
        output.result(ClipOutput {
            feature: Some(clipped),
            square_km,
            fragment_hash: Some(hash.to_string()),
            layers,
        })
    } else {
        output.section(format!("Geography {} ({})", geography.id, geography.name));
        output.table(layers);
        output.kv("Area", format!("{:.6} km²", square_km));
        output.kv("Fragment", &hash);
        output.section("Clipped sketch");
        println!("{}", GeoJson::Feature(clipped));
        Ok(())
    }
}
