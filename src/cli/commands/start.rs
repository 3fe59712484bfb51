//! Start command - launches the Twinlink gateway.

use crate::cli::args::StartArgs;
use crate::config::Config;
use crate::core::time::SystemClock;
use crate::runtime::Gateway;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: StartArgs) -> Result<()> {
    // An explicitly named config file must exist; the env/defaults
    // fallback only applies when none was given.
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_from_env()?,
    };
    let log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;
    let mut gateway = Gateway::new(config, SystemClock, Some(log_handle))?;
    gateway.run().await
}
