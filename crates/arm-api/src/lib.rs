//! Typed Rust client for a resource-manager style cloud control plane.
//!
//! Covers the subset the fleet orchestrator needs: resource groups
//! (create, exists, tag, delete), template deployments, virtual machines,
//! VM sizes and usages, network lookups, generic resources and boot
//! diagnostics.
//!
//! Authentication is out of scope; callers hand in a bearer token.

mod types;

pub use types::*;

use serde::de::DeserializeOwned;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

const RESOURCES_API: &str = "2021-04-01";
const COMPUTE_API: &str = "2023-03-01";
const NETWORK_API: &str = "2023-04-01";
const STORAGE_API: &str = "2023-01-01";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("arm request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("arm {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
}

impl Error {
    /// True when the service answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 404)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the resource manager REST API, scoped to one subscription.
#[derive(Clone)]
pub struct ArmClient {
    token: String,
    subscription: String,
    endpoint: String,
    http: reqwest::Client,
}

impl ArmClient {
    pub fn new(token: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self::with_endpoint(token, subscription, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(
        token: impl Into<String>,
        subscription: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            subscription: subscription.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    fn url(&self, path: &str) -> String {
        format!("{}/subscriptions/{}{path}", self.endpoint, self.subscription)
    }

    fn group_url(&self, group: &str, path: &str) -> String {
        self.url(&format!("/resourcegroups/{group}{path}"))
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Follow `nextLink` until the listing is exhausted.
    async fn list_all<T: DeserializeOwned>(
        &self,
        first_url: String,
        api_version: &str,
        endpoint: &'static str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = self
            .http
            .get(first_url)
            .header("Authorization", self.auth())
            .query(&[("api-version", api_version)]);

        loop {
            let resp = page.send().await?;
            let body: ListResponse<T> = Self::check(resp, endpoint).await?.json().await?;
            items.extend(body.value);

            match body.next_link {
                // next links already carry the api-version
                Some(next) => page = self.http.get(next).header("Authorization", self.auth()),
                None => return Ok(items),
            }
        }
    }

    // ── Resource groups ─────────────────────────────────────────────

    pub async fn create_resource_group(
        &self,
        name: &str,
        req: &CreateResourceGroupRequest,
    ) -> Result<ResourceGroup> {
        let resp = self
            .http
            .put(self.group_url(name, ""))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create resource group")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn resource_group_exists(&self, name: &str) -> Result<bool> {
        let resp = self
            .http
            .head(self.group_url(name, ""))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .send()
            .await?;

        match resp.status().as_u16() {
            204 | 200 => Ok(true),
            404 => Ok(false),
            _ => Self::check(resp, "check resource group").await.map(|_| false),
        }
    }

    pub async fn update_resource_group_tags(
        &self,
        name: &str,
        req: &UpdateTagsRequest,
    ) -> Result<ResourceGroup> {
        let resp = self
            .http
            .patch(self.group_url(name, ""))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .json(req)
            .send()
            .await?;

        Self::check(resp, "tag resource group")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Start deleting a resource group. The service deletes asynchronously;
    /// poll [`ArmClient::resource_group_exists`] to observe completion.
    pub async fn delete_resource_group(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.group_url(name, ""))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .send()
            .await?;

        Self::check_allow_404(resp, "delete resource group").await?;
        Ok(())
    }

    // ── Deployments ─────────────────────────────────────────────────

    pub async fn create_deployment(
        &self,
        group: &str,
        name: &str,
        req: &CreateDeploymentRequest,
    ) -> Result<Deployment> {
        let resp = self
            .http
            .put(self.group_url(
                group,
                &format!("/providers/Microsoft.Resources/deployments/{name}"),
            ))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .json(req)
            .send()
            .await?;

        Self::check(resp, "create deployment")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    pub async fn get_deployment(&self, group: &str, name: &str) -> Result<Deployment> {
        let resp = self
            .http
            .get(self.group_url(
                group,
                &format!("/providers/Microsoft.Resources/deployments/{name}"),
            ))
            .header("Authorization", self.auth())
            .query(&[("api-version", RESOURCES_API)])
            .send()
            .await?;

        Self::check(resp, "get deployment")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Compute ─────────────────────────────────────────────────────

    /// List VMs in a group with their instance view statuses.
    pub async fn list_virtual_machines(&self, group: &str) -> Result<Vec<VirtualMachine>> {
        let mut vms: Vec<VirtualMachine> = self
            .list_all(
                self.group_url(group, "/providers/Microsoft.Compute/virtualMachines"),
                COMPUTE_API,
                "list virtual machines",
            )
            .await?;

        for vm in &mut vms {
            let resp = self
                .http
                .get(self.group_url(
                    group,
                    &format!(
                        "/providers/Microsoft.Compute/virtualMachines/{}/instanceView",
                        vm.name
                    ),
                ))
                .header("Authorization", self.auth())
                .query(&[("api-version", COMPUTE_API)])
                .send()
                .await?;
            let view: InstanceView = Self::check(resp, "get instance view").await?.json().await?;
            vm.properties.instance_view = Some(view);
        }

        Ok(vms)
    }

    pub async fn list_vm_sizes(&self, location: &str) -> Result<Vec<VmSize>> {
        self.list_all(
            self.url(&format!(
                "/providers/Microsoft.Compute/locations/{location}/vmSizes"
            )),
            COMPUTE_API,
            "list vm sizes",
        )
        .await
    }

    pub async fn retrieve_boot_diagnostics(
        &self,
        group: &str,
        vm: &str,
    ) -> Result<BootDiagnosticsData> {
        let resp = self
            .http
            .post(self.group_url(
                group,
                &format!(
                    "/providers/Microsoft.Compute/virtualMachines/{vm}/retrieveBootDiagnosticsData"
                ),
            ))
            .header("Authorization", self.auth())
            .query(&[("api-version", COMPUTE_API)])
            .send()
            .await?;

        Self::check(resp, "retrieve boot diagnostics")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    /// Download a blob by its pre-signed URI (no bearer header).
    pub async fn download_blob(&self, uri: &str) -> Result<String> {
        let resp = self.http.get(uri).send().await?;
        Self::check(resp, "download blob")
            .await?
            .text()
            .await
            .map_err(Error::from)
    }

    // ── Usages ──────────────────────────────────────────────────────

    pub async fn list_compute_usages(&self, location: &str) -> Result<Vec<Usage>> {
        self.list_all(
            self.url(&format!(
                "/providers/Microsoft.Compute/locations/{location}/usages"
            )),
            COMPUTE_API,
            "list compute usages",
        )
        .await
    }

    pub async fn list_network_usages(&self, location: &str) -> Result<Vec<Usage>> {
        self.list_all(
            self.url(&format!(
                "/providers/Microsoft.Network/locations/{location}/usages"
            )),
            NETWORK_API,
            "list network usages",
        )
        .await
    }

    pub async fn list_storage_usages(&self, location: &str) -> Result<Vec<Usage>> {
        self.list_all(
            self.url(&format!(
                "/providers/Microsoft.Storage/locations/{location}/usages"
            )),
            STORAGE_API,
            "list storage usages",
        )
        .await
    }

    // ── Network ─────────────────────────────────────────────────────

    pub async fn list_public_ips(&self, group: &str) -> Result<Vec<PublicIpAddress>> {
        self.list_all(
            self.group_url(group, "/providers/Microsoft.Network/publicIPAddresses"),
            NETWORK_API,
            "list public ips",
        )
        .await
    }

    pub async fn list_network_interfaces(&self, group: &str) -> Result<Vec<NetworkInterface>> {
        self.list_all(
            self.group_url(group, "/providers/Microsoft.Network/networkInterfaces"),
            NETWORK_API,
            "list network interfaces",
        )
        .await
    }

    // ── Generic resources ───────────────────────────────────────────

    pub async fn list_group_resources(&self, group: &str) -> Result<Vec<GenericResource>> {
        self.list_all(
            self.group_url(group, "/resources"),
            RESOURCES_API,
            "list group resources",
        )
        .await
    }

    /// Delete a resource by its full id. 404 counts as success.
    pub async fn delete_resource(&self, resource: &GenericResource) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}{}", self.endpoint, resource.id))
            .header("Authorization", self.auth())
            .query(&[("api-version", api_version_for(&resource.kind))])
            .send()
            .await?;

        Self::check_allow_404(resp, "delete resource").await?;
        Ok(())
    }
}

/// Generic deletes must name an api-version the resource provider accepts.
pub fn api_version_for(kind: &str) -> &'static str {
    match kind.split('/').next().unwrap_or_default() {
        "Microsoft.Compute" => COMPUTE_API,
        "Microsoft.Network" => NETWORK_API,
        "Microsoft.Storage" => STORAGE_API,
        _ => RESOURCES_API,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_flattens_to_leaves() {
        let raw = r#"{
            "code": "DeploymentFailed",
            "message": "At least one resource deployment operation failed.",
            "details": [
                {"code": "QuotaExceeded", "message": "cores exceeded"},
                {"code": "Conflict", "message": "", "details": [
                    {"code": "OSProvisioningTimedOut", "message": "OS Provisioning for VM 'a' did not finish"}
                ]}
            ]
        }"#;
        let detail: ErrorDetail = serde_json::from_str(raw).unwrap();

        assert_eq!(
            detail.leaf_messages(),
            vec![
                "QuotaExceeded: cores exceeded".to_string(),
                "OSProvisioningTimedOut: OS Provisioning for VM 'a' did not finish".to_string(),
            ]
        );
    }

    #[test]
    fn power_state_reads_instance_view_code() {
        let raw = r#"{
            "id": "/x", "name": "vm0", "location": "westus2",
            "properties": {"instanceView": {"statuses": [
                {"code": "ProvisioningState/succeeded"},
                {"code": "PowerState/running", "displayStatus": "VM running"}
            ]}}
        }"#;
        let vm: VirtualMachine = serde_json::from_str(raw).unwrap();
        assert_eq!(vm.power_state(), Some("running"));
    }

    #[test]
    fn delete_api_version_follows_provider() {
        assert_eq!(
            api_version_for("Microsoft.Network/publicIPAddresses"),
            NETWORK_API
        );
        assert_eq!(api_version_for("Microsoft.Compute/disks"), COMPUTE_API);
        assert_eq!(api_version_for("Vendor.Thing/widgets"), RESOURCES_API);
    }

    #[test]
    fn deployment_terminal_states() {
        let props = |state: &str| DeploymentProperties {
            provisioning_state: state.into(),
            timestamp: None,
            error: None,
        };
        assert!(props("Succeeded").is_terminal());
        assert!(props("Failed").is_terminal());
        assert!(!props("Running").is_terminal());
        assert!(!props("Accepted").is_terminal());
    }
}
