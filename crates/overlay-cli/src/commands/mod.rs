//! Command implementations

mod clip;
mod config;
mod overlap;
mod pack;

use crate::cli::{Cli, Commands};
use crate::config_loader::load_config;
use crate::output::OutputWriter;
use anyhow::Result;

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let output = OutputWriter::new(cli.json);
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Pack(args) => pack::execute(args, &output).await,
        Commands::Clip(args) => clip::execute(args, &config, &output).await,
        Commands::Overlap(args) => overlap::execute(args, &config, &output).await,
        Commands::Config => config::execute(&config, &output),
    }
}
