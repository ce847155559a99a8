//! Plan and config files read by `bulkctl apply`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use verity_bulkops::{BulkConfig, ControllerConfig, Intent};

/// Contents of the `--config` file.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

impl CliConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid config file")?;
        config.controller.validate()?;
        config.bulk.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Parses a plan: a JSON array of `{op, kind, name, payload?}`.
pub fn parse_plan(text: &str) -> Result<Vec<Intent>> {
    let intents: Vec<Intent> = serde_json::from_str(text).context("invalid plan")?;
    for (index, intent) in intents.iter().enumerate() {
        intent
            .validate()
            .with_context(|| format!("plan entry {index}"))?;
    }
    if intents.is_empty() {
        bail!("plan is empty");
    }
    Ok(intents)
}

pub fn load_plan(path: &Path) -> Result<Vec<Intent>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    parse_plan(&text)
}
