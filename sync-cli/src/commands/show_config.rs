//! Print the effective configuration.

use anyhow::{Context, Result};
use sync_client::EngineConfig;

/// Run the show-config command.
pub fn run(config: &EngineConfig) -> Result<()> {
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}
