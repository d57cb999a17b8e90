//! The `config clean` subcommand.

use supplant_common::{config::Config, prelude::*};

/// Rewrite the config at `path` without its disabled entries.
pub fn run(path: &Path) -> Result<()> {
    let config = Config::from_path(path)?;
    let cleaned = config.without_disabled();
    let removed = (config.supplant.len() - cleaned.supplant.len())
        + (config.external.len() - cleaned.external.len());
    cleaned.write_to_path(path)?;
    println!("removed {} disabled entries from {}", removed, path.display());
    Ok(())
}
