use std::path::Path;

use serde::Deserialize;
use vf_infra::types::FleetDescriptor;

use crate::error::{Result, RunError};

/// A fleet plus the commands that decide whether the run passed.
#[derive(Debug, Clone, Deserialize)]
pub struct RunPlan {
    pub fleet: FleetDescriptor,
    #[serde(default)]
    pub validation: Vec<ValidationStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Reboot the fleet and wait for it before running the command.
    #[serde(default)]
    pub restart_before: bool,
}

fn default_timeout_secs() -> u64 {
    600
}

impl RunPlan {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RunError::ReadPlan {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&raw).map_err(|source| RunError::ParsePlan {
            path: path.to_path_buf(),
            source,
        })
    }
}
