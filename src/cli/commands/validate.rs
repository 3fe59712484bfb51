//! Validate command - checks a configuration file without starting.

use crate::cli::args::ValidateArgs;
use crate::config::Config;
use anyhow::Result;

pub fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    println!("{}: configuration OK", args.config.display());
    Ok(())
}
