pub mod arm;
pub mod template;
pub mod types;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{
    DeploymentContext, DeploymentStatus, FleetDescriptor, MemberRecord, ProvisioningState,
    QuotaUsage, ResourceRef, TemplateBlob,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("arm provider error: {0}")]
    Arm(#[from] arm_api::Error),

    #[error("invalid status transition for {container}: {from} -> {to}")]
    InvalidTransition {
        container: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("invalid template input: {0}")]
    InvalidTemplate(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("invalid env var {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known cloud control plane backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Arm,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arm => "arm",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arm" => Ok(Self::Arm),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Capability-shaped client for the cloud control plane.
///
/// A "container" is the provider's grouping construct (a resource group)
/// holding every resource of one deployment unit.
#[async_trait]
pub trait CloudClient: Send + Sync + 'static {
    /// Create the (empty) container.
    async fn create_container(&self, name: &str, region: &str) -> Result<ProvisioningState>;

    /// Delete a container and everything in it. A missing container counts
    /// as deleted.
    async fn delete_container(&self, name: &str) -> Result<()>;

    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Submit a rendered template into an existing container and wait for
    /// the provider to settle on a terminal state.
    async fn submit_deployment(
        &self,
        container: &str,
        template: &TemplateBlob,
    ) -> Result<ProvisioningState>;

    /// Enumerate the VMs in a container.
    async fn list_members(&self, container: &str) -> Result<Vec<MemberRecord>>;

    async fn tag_container(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// Current per-family usage for a region.
    async fn query_quota(&self, region: &str) -> Result<QuotaUsage>;

    /// SKU name to core count for a region.
    async fn vm_sizes(&self, region: &str) -> Result<BTreeMap<String, u32>>;

    async fn list_resources(&self, container: &str) -> Result<Vec<ResourceRef>>;

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()>;

    /// Serial console log of a VM, when the provider keeps one.
    async fn boot_diagnostics(&self, _container: &str, _vm: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Provider identifier.
    fn name(&self) -> ProviderName;
}

/// Renders a fleet descriptor into a provider template.
pub trait TemplateBuilder: Send + Sync + 'static {
    fn render(&self, fleet: &FleetDescriptor, ctx: &DeploymentContext) -> Result<TemplateBlob>;
}

/// Build the cloud client named by `FLEET_CLOUD` (default: `arm`).
pub fn build_cloud() -> Result<Arc<dyn CloudClient>> {
    dotenvy::dotenv().ok();

    let name: ProviderName = std::env::var("FLEET_CLOUD")
        .unwrap_or_else(|_| "arm".into())
        .parse()?;

    match name {
        ProviderName::Arm => {
            let client = arm::ArmCloud::from_env()?;
            tracing::info!(provider = %name, subscription = client.subscription(), "registered cloud provider");
            Ok(Arc::new(client))
        }
    }
}

/// Read an optional env var and parse it, falling back to `default`.
pub fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| Error::InvalidEnv {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}
