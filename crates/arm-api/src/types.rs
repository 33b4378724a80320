use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Resource groups ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateResourceGroupRequest {
    pub location: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateTagsRequest {
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceGroup {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub properties: ResourceGroupProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupProperties {
    pub provisioning_state: String,
}

// ── Deployments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateDeploymentRequest {
    pub properties: DeploymentRequestProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRequestProperties {
    pub mode: DeploymentMode,
    pub template: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    Incremental,
    Complete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub properties: DeploymentProperties,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentProperties {
    pub provisioning_state: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
}

impl DeploymentProperties {
    /// True once the deployment has stopped changing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.provisioning_state.as_str(),
            "Succeeded" | "Failed" | "Canceled"
        )
    }
}

/// Nested error payload. The service reports a summary at the top and the
/// actionable causes in `details`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<ErrorDetail>,
}

impl ErrorDetail {
    /// Flatten to the innermost `code: message` pairs.
    pub fn leaf_messages(&self) -> Vec<String> {
        if self.details.is_empty() {
            return vec![format!("{}: {}", self.code, self.message)];
        }
        self.details
            .iter()
            .flat_map(ErrorDetail::leaf_messages)
            .collect()
    }
}

// ── Compute ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub properties: VirtualMachineProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub instance_view: Option<InstanceView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceView {
    #[serde(default)]
    pub statuses: Vec<InstanceViewStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceViewStatus {
    pub code: String,
    #[serde(default)]
    pub display_status: Option<String>,
}

impl VirtualMachine {
    /// The `PowerState/...` code suffix, e.g. `running` or `deallocated`.
    pub fn power_state(&self) -> Option<&str> {
        self.properties
            .instance_view
            .as_ref()?
            .statuses
            .iter()
            .find_map(|s| s.code.strip_prefix("PowerState/"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSize {
    pub name: String,
    pub number_of_cores: u32,
    #[serde(default)]
    pub memory_in_mb: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootDiagnosticsData {
    #[serde(default)]
    pub console_screenshot_blob_uri: Option<String>,
    #[serde(default)]
    pub serial_console_log_blob_uri: Option<String>,
}

// ── Usages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub name: UsageName,
    pub current_value: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageName {
    pub value: String,
    #[serde(default)]
    pub localized_value: Option<String>,
}

// ── Network ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpAddress {
    pub name: String,
    #[serde(default)]
    pub properties: PublicIpProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIpProperties {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub dns_settings: Option<DnsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub fqdn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub properties: NetworkInterfaceProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceProperties {
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpConfiguration {
    pub name: String,
    #[serde(default)]
    pub properties: IpConfigurationProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigurationProperties {
    #[serde(default)]
    pub private_ip_address: Option<String>,
}

// ── Generic resources ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GenericResource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Paged list envelope shared by every list endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    pub value: Vec<T>,
    #[serde(default)]
    pub next_link: Option<String>,
}
