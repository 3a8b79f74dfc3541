//! Overlap command implementation

use crate::cli::OverlapArgs;
use crate::config_loader::{build_engine, load_geography};
use crate::output::OutputWriter;
use crate::progress::OverlapBar;
use anyhow::{Context, Result};
use overlay_core::config::LayeredConfig;
use overlay_core::models::{DatasetFormat, MetricValue};
use overlay_engine::calculate_geography_overlap;
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::Tabled;

#[derive(Tabled)]
struct ClassRow {
    #[tabled(rename = "Class")]
    class: String,
    #[tabled(rename = "Area (km²)")]
    square_km: String,
}

#[derive(Serialize)]
struct OverlapOutput {
    geography: i64,
    target: String,
    square_km_by_class: BTreeMap<String, f64>,
}

pub async fn execute(args: OverlapArgs, config: &LayeredConfig, output: &OutputWriter) -> Result<()> {
    let geography = load_geography(&args.geography)?;
    let engine = build_engine(config)?;
    let bar = OverlapBar::new(output.is_json());

    let report = calculate_geography_overlap(
        &engine,
        &geography.clipping_layers,
        &args.target,
        DatasetFormat::OverlayFgb,
        args.group_by.as_deref(),
        &bar,
    )
    .await;

    let report = match report {
        Ok(report) => {
            bar.finish("Overlap measured");
            report
        }
        Err(e) => {
            bar.abandon("Overlap failed");
            return Err(e).with_context(|| format!("Failed to measure {} in geography {}", args.target, geography.id));
        }
    };

    if output.is_json() {
        return output.result(OverlapOutput {
            geography: geography.id,
            target: args.target,
            square_km_by_class: report.square_km_by_class,
        });
    }

    let rows = report
        .square_km_by_class
        .iter()
        .map(|(class, square_km)| ClassRow {
            class: if class == MetricValue::TOTAL_CLASS { "(total)".to_string() } else { class.clone() },
            square_km: format!("{:.6}", square_km),
        })
        .collect();
    output.section(format!("{} in geography {}", args.target, geography.id));
    output.table(rows);
    output.kv("Candidates", report.stats.candidates);
    output.kv("Exact intersections", report.stats.exact);
    Ok(())
}
