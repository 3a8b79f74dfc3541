use clap::{Parser, Subcommand};
use overlay_source::writer::DEFAULT_BLOCK_SIZE;
use std::path::PathBuf;

/// Overlay - clip sketches against layered geographies
#[derive(Parser, Debug)]
#[command(name = "overlay")]
#[command(about = "Clip sketches against layered geographies streamed from packed datasets", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to ./overlay.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Source cache budget, e.g. "128MB"
    #[arg(long, global = true, value_name = "SIZE")]
    pub cache_size: Option<String>,

    /// Geometry worker threads
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Fully-inside rectangles each sketch cover aims for
    #[arg(long, global = true)]
    pub cover_target: Option<usize>,

    /// Measure areas in an equal-area projection
    #[arg(long, global = true)]
    pub equal_area: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pack a GeoJSON file into a range-readable dataset
    Pack(PackArgs),

    /// Clip a sketch to a geography
    Clip(ClipArgs),

    /// Measure how much of a dataset falls inside a geography
    Overlap(OverlapArgs),

    /// Show effective configuration and where each value came from
    Config,
}

#[derive(Parser, Debug)]
pub struct PackArgs {
    /// GeoJSON FeatureCollection of polygons
    pub input: PathBuf,

    /// Output dataset path
    pub output: PathBuf,

    /// Dataset name (defaults to the input file stem)
    #[arg(long)]
    pub name: Option<String>,

    /// Features per index block
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,
}

#[derive(Parser, Debug)]
pub struct ClipArgs {
    /// GeoJSON Feature with the sketch polygon
    pub sketch: PathBuf,

    /// Geography definition (TOML)
    #[arg(long)]
    pub geography: PathBuf,
}

#[derive(Parser, Debug)]
pub struct OverlapArgs {
    /// Geography definition (TOML)
    #[arg(long)]
    pub geography: PathBuf,

    /// Target dataset path or URL
    #[arg(long)]
    pub target: String,

    /// Property to group areas by
    #[arg(long)]
    pub group_by: Option<String>,
}
