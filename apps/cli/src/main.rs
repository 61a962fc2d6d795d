//! docpipe CLI: incremental document pipeline runner.
//!
//! Drives every source document under a directory through the configured
//! stages, skipping work already done for unchanged content.

mod commands;
mod progress;

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
