//! Phasewatch CLI: live telemetry for multi-stage pipelines.
//!
//! Runs a simulated research pipeline under the phase collector and renders
//! it with the terminal dashboard, or drives a plain progress spinner.

mod commands;
mod demo;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
