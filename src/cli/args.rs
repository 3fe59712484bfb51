//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Twinlink - device-twin connectivity gateway.
#[derive(Parser)]
#[command(name = "twinlink")]
#[command(version)]
#[command(about = "Twinlink connectivity gateway and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway
    Start(StartArgs),

    /// Inspect persisted connection state
    Inspect(InspectArgs),

    /// Validate a configuration file
    Validate(ValidateArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file; without it, `TWINLINK_CONFIG` or
    /// `config/twinlink.toml` is used when present, defaults otherwise
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

// -----------------------------------------------------------------------------
// Inspect command (journal inspector)
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub action: InspectAction,
}

#[derive(Subcommand)]
pub enum InspectAction {
    /// Inspect connection event journals
    Journal(JournalInspectArgs),
}

#[derive(Args)]
pub struct JournalInspectArgs {
    /// Base storage directory containing conn_* journals
    pub data_dir: PathBuf,

    /// Limit output to one connection id
    #[arg(long)]
    pub connection: Option<String>,

    /// Emit JSON instead of table output
    #[arg(long)]
    pub json: bool,
}

// -----------------------------------------------------------------------------
// Validate command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to configuration file
    pub config: PathBuf,
}
