//! Pack command implementation

use crate::cli::PackArgs;
use crate::output::OutputWriter;
use anyhow::{bail, Context, Result};
use geojson::GeoJson;
use overlay_source::DatasetWriter;
use serde::Serialize;

#[derive(Serialize)]
struct PackOutput {
    path: String,
    features: usize,
    bytes: u64,
}

pub async fn execute(args: PackArgs, output: &OutputWriter) -> Result<()> {
    let content = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let geojson: GeoJson = content
        .parse()
        .with_context(|| format!("Failed to parse GeoJSON in {}", args.input.display()))?;

    let features = match geojson {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(_) => bail!("Expected a Feature or FeatureCollection, found a bare geometry"),
    };

    let name = args.name.clone().unwrap_or_else(|| {
        args.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string())
    });

    let mut writer = DatasetWriter::new(name).block_size(args.block_size);
    for (i, feature) in features.iter().enumerate() {
        writer.add_feature(feature).with_context(|| format!("Feature {} cannot be packed", i))?;
    }
    let count = writer.len();

    let bytes = writer
        .write_to(&args.output)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    output.success(format!("Packed {} features into {} ({} bytes)", count, args.output.display(), bytes));
    output.result(PackOutput { path: args.output.display().to_string(), features: count, bytes })
}
