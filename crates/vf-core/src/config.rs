use std::path::PathBuf;
use std::time::Duration;

use vf_infra::env_or;

use crate::Result;

/// Knobs of the lifecycle orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub allowed_quota_percent: f64,
    /// Give up on admission after this long.
    pub quota_wait: Duration,
    pub quota_backoff_min: Duration,
    pub quota_backoff_max: Duration,
    /// Bound on one deployment submission, including the provider's own polling.
    pub deploy_timeout: Duration,
    pub submit_attempts: u32,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub drain_passes: u32,
    /// Resource types that survive a container drain.
    pub protected_resource_types: Vec<String>,
    /// Where serial logs of unreachable members are written.
    pub diagnostics_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            allowed_quota_percent: 100.0,
            quota_wait: Duration::from_secs(3600),
            quota_backoff_min: Duration::from_secs(60),
            quota_backoff_max: Duration::from_secs(600),
            deploy_timeout: Duration::from_secs(3600),
            submit_attempts: 2,
            connect_attempts: 60,
            connect_interval: Duration::from_secs(5),
            drain_passes: 5,
            protected_resource_types: vec!["Microsoft.Compute/availabilitySets".into()],
            diagnostics_dir: None,
            dry_run: false,
        }
    }
}

fn secs(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(name, default.as_secs())?))
}

impl OrchestratorConfig {
    /// Load from `FLEET_*` env vars; anything unset keeps its default.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let protected_resource_types = match std::env::var("FLEET_PROTECTED_RESOURCE_TYPES") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => d.protected_resource_types,
        };

        Ok(Self {
            allowed_quota_percent: env_or("FLEET_ALLOWED_QUOTA_PERCENT", d.allowed_quota_percent)?,
            quota_wait: secs("FLEET_QUOTA_WAIT_SECS", d.quota_wait)?,
            quota_backoff_min: secs("FLEET_QUOTA_BACKOFF_MIN_SECS", d.quota_backoff_min)?,
            quota_backoff_max: secs("FLEET_QUOTA_BACKOFF_MAX_SECS", d.quota_backoff_max)?,
            deploy_timeout: secs("FLEET_DEPLOY_TIMEOUT_SECS", d.deploy_timeout)?,
            submit_attempts: env_or("FLEET_SUBMIT_ATTEMPTS", d.submit_attempts)?,
            connect_attempts: env_or("FLEET_CONNECT_ATTEMPTS", d.connect_attempts)?,
            connect_interval: secs("FLEET_CONNECT_INTERVAL_SECS", d.connect_interval)?,
            drain_passes: env_or("FLEET_DRAIN_PASSES", d.drain_passes)?,
            protected_resource_types,
            diagnostics_dir: std::env::var("FLEET_DIAGNOSTICS_DIR").ok().map(PathBuf::from),
            dry_run: env_or("FLEET_DRY_RUN", d.dry_run)?,
        })
    }
}
