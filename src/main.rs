//! Twinlink - unified CLI entrypoint.
//!
//! Usage:
//!   twinlink start --config config/twinlink.toml
//!   twinlink inspect journal <data-dir>
//!   twinlink validate <config-file>

use anyhow::Result;
use clap::Parser;
use twinlink::cli::commands::{run_inspect, run_start, run_validate};
use twinlink::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Inspect(args) => run_inspect(args),
        Commands::Validate(args) => run_validate(args),
    }
}
