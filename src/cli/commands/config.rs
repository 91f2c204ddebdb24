use anyhow::{Context, Result};
use std::path::Path;

use super::load_config;

/// Print the merged configuration.
pub fn execute(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{yaml}");
    }
    Ok(())
}
