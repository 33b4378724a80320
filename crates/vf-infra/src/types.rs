use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

use crate::{Error, Result};

/// Well-known quota keys beyond the per-family core buckets.
pub mod quota_keys {
    pub const REGIONAL_CORES: &str = "cores";
    pub const STORAGE_ACCOUNTS: &str = "StorageAccounts";
    pub const PUBLIC_IPS: &str = "PublicIPAddresses";
    pub const VIRTUAL_NETWORKS: &str = "VirtualNetworks";
    pub const SECURITY_GROUPS: &str = "NetworkSecurityGroups";
    pub const LOAD_BALANCERS: &str = "LoadBalancers";
}

// ── Fleet description ───────────────────────────────────────────────

/// Immutable description of a fleet, produced by the config layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetDescriptor {
    pub name_prefix: String,
    /// Setup tag folded into generated names, e.g. `"M1"` or `"ONEVM"`.
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub distro: String,
    /// One region, or a comma-separated list for round-robin placement.
    pub region: String,
    pub members: Vec<MemberSpec>,
    #[serde(default)]
    pub network: NetworkTopology,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Number of independent deployment units to create.
    #[serde(default = "default_units")]
    pub units: u32,
}

fn default_units() -> u32 {
    1
}

impl FleetDescriptor {
    /// Regions in declaration order.
    pub fn regions(&self) -> Vec<&str> {
        self.region
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Whether any member asks for a freshly created storage account.
    pub fn needs_new_storage(&self) -> bool {
        self.members.iter().any(|m| m.storage.is_new())
    }
}

/// Per-member VM shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSpec {
    pub role: String,
    pub sku: String,
    /// Core count override; otherwise resolved from the region's size catalog.
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub storage: StorageMode,
    pub image: ImageRef,
    #[serde(default)]
    pub os: GuestOsFamily,
    /// Named logical ports, e.g. `"probe" => 1500`.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Existing,
    NewStandard,
    NewPremium,
}

impl StorageMode {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::NewStandard | Self::NewPremium)
    }
}

/// Image reference: `publisher:offer:sku:version` or a VHD URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    /// Split a marketplace URN into its four parts.
    pub fn marketplace_parts(&self) -> Option<[&str; 4]> {
        let parts: Vec<&str> = self.0.split(':').collect();
        match parts.as_slice() {
            [publisher, offer, sku, version] if !self.0.contains("://") => {
                Some([*publisher, *offer, *sku, *version])
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkTopology {
    /// One virtual network shared by all members, instead of one per member.
    #[serde(default = "default_true")]
    pub shared_vnet: bool,
    /// Roles placed behind the fleet load balancer.
    #[serde(default)]
    pub load_balanced: Vec<String>,
    #[serde(default)]
    pub extra_nics: u32,
}

fn default_true() -> bool {
    true
}

impl Default for NetworkTopology {
    fn default() -> Self {
        Self {
            shared_vnet: true,
            load_balanced: Vec::new(),
            extra_nics: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOsFamily {
    #[default]
    Linux,
    FreeBsd,
    Windows,
}

impl GuestOsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::FreeBsd => "freebsd",
            Self::Windows => "windows",
        }
    }

    /// SSH for unix guests, RDP for Windows.
    pub fn default_management_port(&self) -> u16 {
        match self {
            Self::Linux | Self::FreeBsd => 22,
            Self::Windows => 3389,
        }
    }

    /// Map `uname -s` output to a family.
    pub fn from_uname(raw: &str) -> Option<Self> {
        match raw.trim() {
            "Linux" => Some(Self::Linux),
            "FreeBSD" => Some(Self::FreeBsd),
            _ => None,
        }
    }
}

impl std::str::FromStr for GuestOsFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(Self::Linux),
            "freebsd" => Ok(Self::FreeBsd),
            "windows" => Ok(Self::Windows),
            other => Err(Error::InvalidTemplate(format!("unknown guest os: {other}"))),
        }
    }
}

// ── Quota ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub current: i64,
    pub limit: i64,
}

/// Per-family usage snapshot. A point-in-time estimate, never a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    entries: BTreeMap<String, QuotaEntry>,
}

impl QuotaUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, family: impl Into<String>, current: i64, limit: i64) -> Self {
        self.set(family, current, limit);
        self
    }

    pub fn set(&mut self, family: impl Into<String>, current: i64, limit: i64) {
        self.entries
            .insert(family.into(), QuotaEntry { current, limit });
    }

    pub fn get(&self, family: &str) -> Option<QuotaEntry> {
        self.entries.get(family).copied()
    }

    /// Add projected usage to a family's current value. Unknown families are
    /// left untouched and reported back as `false`.
    pub fn add(&mut self, family: &str, amount: i64) -> bool {
        match self.entries.get_mut(family) {
            Some(entry) => {
                entry.current += amount;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QuotaEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ── Deployment handle ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Verifying,
    Ready,
    Failed,
    TornDown,
}

impl DeploymentStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Provisioning => 1,
            Self::Verifying => 2,
            Self::Ready => 3,
            Self::TornDown => 4,
            Self::Failed => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::TornDown)
    }

    /// Forward-only, one step at a time, except `Failed` which any
    /// non-terminal state may enter.
    pub fn can_transition(&self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::Failed => true,
            Self::TornDown => *self == Self::Ready,
            _ => to.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One instantiated fleet unit. Owned by the orchestrator; endpoints observe
/// its status through [`DeploymentRef`].
#[derive(Debug)]
pub struct DeploymentHandle {
    pub name: String,
    pub region: String,
    pub unit_index: u32,
    /// Set when teardown was skipped and the container tagged instead.
    pub preserved: bool,
    pub provision_elapsed: Option<Duration>,
    status: watch::Sender<DeploymentStatus>,
}

impl DeploymentHandle {
    pub fn new(name: impl Into<String>, region: impl Into<String>, unit_index: u32) -> Self {
        let (status, _) = watch::channel(DeploymentStatus::Pending);
        Self {
            name: name.into(),
            region: region.into(),
            unit_index,
            preserved: false,
            provision_elapsed: None,
            status,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        *self.status.borrow()
    }

    pub fn advance(&self, to: DeploymentStatus) -> Result<()> {
        let from = self.status();
        if !from.can_transition(to) {
            return Err(Error::InvalidTransition {
                container: self.name.clone(),
                from,
                to,
            });
        }
        self.status.send_replace(to);
        tracing::debug!(container = %self.name, %from, %to, "deployment status changed");
        Ok(())
    }

    /// Enter `Failed` unless already terminal.
    pub fn fail(&self) {
        if !self.status().is_terminal() {
            self.status.send_replace(DeploymentStatus::Failed);
            tracing::debug!(container = %self.name, "deployment failed");
        }
    }

    pub fn deployment_ref(&self) -> DeploymentRef {
        DeploymentRef {
            container: self.name.clone(),
            status: self.status.subscribe(),
        }
    }
}

/// Read-only view of a deployment's status, carried by each endpoint.
#[derive(Debug, Clone)]
pub struct DeploymentRef {
    pub container: String,
    status: watch::Receiver<DeploymentStatus>,
}

impl DeploymentRef {
    pub fn status(&self) -> DeploymentStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == DeploymentStatus::Ready
    }
}

// ── Members and endpoints ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Starting,
    Running,
    Stopped,
    Deallocated,
    Unknown,
}

impl PowerState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" | "stopping" => Self::Stopped,
            "deallocated" | "deallocating" => Self::Deallocated,
            _ => Self::Unknown,
        }
    }
}

/// Raw member as enumerated from the cloud, before it is bound to a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub name: String,
    pub role: String,
    pub public_address: Option<String>,
    pub internal_address: Option<String>,
    pub os: GuestOsFamily,
    pub ports: BTreeMap<String, u16>,
    pub power: PowerState,
}

impl MemberRecord {
    pub fn bind(self, deployment: DeploymentRef) -> VmEndpoint {
        let management_port = match self.os {
            GuestOsFamily::Windows => self.ports.get("rdp"),
            _ => self.ports.get("ssh"),
        }
        .copied()
        .unwrap_or_else(|| self.os.default_management_port());

        VmEndpoint {
            name: self.name,
            role: self.role,
            public_address: self.public_address,
            internal_address: self.internal_address,
            management_port,
            os: self.os,
            ports: self.ports,
            deployment,
        }
    }
}

/// Externally reachable coordinates of one deployed VM. Only valid while its
/// deployment is `Ready`.
#[derive(Debug, Clone)]
pub struct VmEndpoint {
    pub name: String,
    pub role: String,
    pub public_address: Option<String>,
    pub internal_address: Option<String>,
    pub management_port: u16,
    pub os: GuestOsFamily,
    pub ports: BTreeMap<String, u16>,
    pub deployment: DeploymentRef,
}

impl VmEndpoint {
    /// Address to reach the VM from the orchestrator: public if any.
    pub fn address(&self) -> Option<&str> {
        self.public_address
            .as_deref()
            .or(self.internal_address.as_deref())
    }

    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    pub fn is_live(&self) -> bool {
        self.deployment.is_ready()
    }

    /// `address:port` for logs.
    pub fn display_target(&self) -> String {
        format!(
            "{}:{}",
            self.address().unwrap_or("<no address>"),
            self.management_port
        )
    }
}

// ── Cloud call results ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Succeeded,
    Failed { reason: String },
    Canceled,
    InProgress(String),
}

impl ProvisioningState {
    pub fn parse(raw: &str, reason: impl FnOnce() -> String) -> Self {
        match raw {
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed { reason: reason() },
            "Canceled" => Self::Canceled,
            other => Self::InProgress(other.to_string()),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("Succeeded"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
            Self::Canceled => f.write_str("Canceled"),
            Self::InProgress(state) => write!(f, "InProgress({state})"),
        }
    }
}

/// A single resource inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: String,
    pub name: String,
    pub kind: String,
}

/// Rendered deployment description. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateBlob(pub serde_json::Value);

/// Admin account provisioned on every member.
#[derive(Debug, Clone, Default)]
pub struct AdminCredentials {
    pub user: String,
    pub password: Option<String>,
    pub ssh_public_key: Option<String>,
}

/// Per-unit context handed to the template builder.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    pub container: String,
    pub region: String,
    pub run_id: String,
    pub unit_index: u32,
    pub admin: AdminCredentials,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_one_step() {
        use DeploymentStatus::*;
        assert!(Pending.can_transition(Provisioning));
        assert!(Provisioning.can_transition(Verifying));
        assert!(Verifying.can_transition(Ready));
        assert!(Ready.can_transition(TornDown));

        assert!(!Pending.can_transition(Ready));
        assert!(!Verifying.can_transition(Provisioning));
        assert!(!Provisioning.can_transition(TornDown));
    }

    #[test]
    fn failed_reachable_only_from_non_terminal() {
        use DeploymentStatus::*;
        for from in [Pending, Provisioning, Verifying, Ready] {
            assert!(from.can_transition(Failed), "{from} -> Failed");
        }
        assert!(!Failed.can_transition(Failed));
        assert!(!TornDown.can_transition(Failed));
        assert!(!Failed.can_transition(TornDown));
    }

    #[test]
    fn endpoint_observes_handle_status() {
        let handle = DeploymentHandle::new("rg-1", "westus2", 0);
        let endpoint = MemberRecord {
            name: "vm0".into(),
            role: "client".into(),
            public_address: Some("10.0.0.4".into()),
            internal_address: None,
            os: GuestOsFamily::Linux,
            ports: BTreeMap::new(),
            power: PowerState::Running,
        }
        .bind(handle.deployment_ref());

        assert!(!endpoint.is_live());
        handle.advance(DeploymentStatus::Provisioning).unwrap();
        handle.advance(DeploymentStatus::Verifying).unwrap();
        handle.advance(DeploymentStatus::Ready).unwrap();
        assert!(endpoint.is_live());
        handle.advance(DeploymentStatus::TornDown).unwrap();
        assert!(!endpoint.is_live());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let handle = DeploymentHandle::new("rg-1", "westus2", 0);
        let err = handle.advance(DeploymentStatus::Ready).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: DeploymentStatus::Pending,
                to: DeploymentStatus::Ready,
                ..
            }
        ));
        assert_eq!(handle.status(), DeploymentStatus::Pending);
    }

    #[test]
    fn management_port_follows_guest_os() {
        let handle = DeploymentHandle::new("rg-1", "westus2", 0);
        let record = |os, ports: &[(&str, u16)]| MemberRecord {
            name: "vm".into(),
            role: "r".into(),
            public_address: None,
            internal_address: Some("192.168.0.5".into()),
            os,
            ports: ports.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            power: PowerState::Running,
        };

        let linux = record(GuestOsFamily::Linux, &[]).bind(handle.deployment_ref());
        assert_eq!(linux.management_port, 22);
        assert_eq!(linux.address(), Some("192.168.0.5"));

        let windows = record(GuestOsFamily::Windows, &[]).bind(handle.deployment_ref());
        assert_eq!(windows.management_port, 3389);

        let natted =
            record(GuestOsFamily::Linux, &[("ssh", 50022), ("probe", 1500)]).bind(handle.deployment_ref());
        assert_eq!(natted.management_port, 50022);
        assert_eq!(natted.port("probe"), Some(1500));
    }

    #[test]
    fn regions_split_in_declaration_order() {
        let fleet: FleetDescriptor = serde_json::from_value(serde_json::json!({
            "name_prefix": "ICA",
            "region": "westus2, eastus ,northeurope",
            "members": []
        }))
        .unwrap();
        assert_eq!(fleet.regions(), vec!["westus2", "eastus", "northeurope"]);
        assert_eq!(fleet.units, 1);
        assert!(fleet.network.shared_vnet);
    }

    #[test]
    fn marketplace_image_parts() {
        let urn = ImageRef("Canonical:UbuntuServer:18.04-LTS:latest".into());
        assert_eq!(
            urn.marketplace_parts(),
            Some(["Canonical", "UbuntuServer", "18.04-LTS", "latest"])
        );
        let vhd = ImageRef("https://acct.blob.core.windows.net/vhds/a:b:c:d.vhd".into());
        assert_eq!(vhd.marketplace_parts(), None);
    }
}
