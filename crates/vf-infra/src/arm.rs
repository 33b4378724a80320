use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use arm_api::{
    ArmClient, CreateDeploymentRequest, CreateResourceGroupRequest, DeploymentMode,
    DeploymentRequestProperties, GenericResource, UpdateTagsRequest,
};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::types::{
    GuestOsFamily, MemberRecord, PowerState, ProvisioningState, QuotaUsage, ResourceRef,
    TemplateBlob,
};
use crate::{CloudClient, Error, ProviderName, Result, env_or};

/// Tag keys written by [`crate::template::ArmTemplateBuilder`] on every VM.
pub const ROLE_TAG: &str = "vf-role";
pub const PORTS_TAG: &str = "vf-ports";
pub const OS_TAG: &str = "vf-os";

const DEPLOYMENT_NAME: &str = "vf-fleet";

/// Resource-manager backed cloud client.
///
/// All configuration is loaded from environment variables via `from_env()`.
pub struct ArmCloud {
    client: ArmClient,
    poll_interval: Duration,
    max_delete_polls: u32,
}

impl ArmCloud {
    /// Create from env vars:
    ///
    /// - `ARM_ACCESS_TOKEN` (required)
    /// - `ARM_SUBSCRIPTION_ID` (required)
    /// - `ARM_ENDPOINT` (default: public cloud)
    /// - `ARM_POLL_INTERVAL_SECS` (default: 10)
    /// - `ARM_MAX_DELETE_POLLS` (default: 360)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("ARM_ACCESS_TOKEN")
            .map_err(|_| Error::MissingEnv("ARM_ACCESS_TOKEN".into()))?;
        let subscription = std::env::var("ARM_SUBSCRIPTION_ID")
            .map_err(|_| Error::MissingEnv("ARM_SUBSCRIPTION_ID".into()))?;
        let endpoint =
            std::env::var("ARM_ENDPOINT").unwrap_or_else(|_| arm_api::DEFAULT_ENDPOINT.into());

        Ok(Self {
            client: ArmClient::with_endpoint(token, subscription, endpoint),
            poll_interval: Duration::from_secs(env_or("ARM_POLL_INTERVAL_SECS", 10)?),
            max_delete_polls: env_or("ARM_MAX_DELETE_POLLS", 360)?,
        })
    }

    pub fn subscription(&self) -> &str {
        self.client.subscription()
    }

    fn to_ref(resource: GenericResource) -> ResourceRef {
        ResourceRef {
            id: resource.id,
            name: resource.name,
            kind: resource.kind,
        }
    }

    fn parse_ports(raw: Option<&String>) -> BTreeMap<String, u16> {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CloudClient for ArmCloud {
    async fn create_container(&self, name: &str, region: &str) -> Result<ProvisioningState> {
        let group = self
            .client
            .create_resource_group(
                name,
                &CreateResourceGroupRequest {
                    location: region.to_string(),
                    tags: HashMap::new(),
                },
            )
            .await?;

        info!(container = name, region, state = %group.properties.provisioning_state, "arm: resource group created");
        Ok(ProvisioningState::parse(
            &group.properties.provisioning_state,
            String::new,
        ))
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        if !self.client.resource_group_exists(name).await? {
            debug!(container = name, "arm: resource group absent, nothing to delete");
            return Ok(());
        }

        self.client.delete_resource_group(name).await?;
        info!(container = name, "arm: resource group delete accepted");

        for _ in 0..self.max_delete_polls {
            tokio::time::sleep(self.poll_interval).await;
            if !self.client.resource_group_exists(name).await? {
                info!(container = name, "arm: resource group deleted");
                return Ok(());
            }
        }

        Err(Error::Timeout(format!("deletion of resource group {name}")))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.client.resource_group_exists(name).await?)
    }

    async fn submit_deployment(
        &self,
        container: &str,
        template: &TemplateBlob,
    ) -> Result<ProvisioningState> {
        let mut deployment = self
            .client
            .create_deployment(
                container,
                DEPLOYMENT_NAME,
                &CreateDeploymentRequest {
                    properties: DeploymentRequestProperties {
                        mode: DeploymentMode::Incremental,
                        template: template.0.clone(),
                        parameters: None,
                    },
                },
            )
            .await?;

        info!(container, "arm: deployment submitted");

        while !deployment.properties.is_terminal() {
            tokio::time::sleep(self.poll_interval).await;
            deployment = self
                .client
                .get_deployment(container, DEPLOYMENT_NAME)
                .await?;
            debug!(container, state = %deployment.properties.provisioning_state, "arm: deployment progress");
        }

        let props = &deployment.properties;
        Ok(ProvisioningState::parse(&props.provisioning_state, || {
            props
                .error
                .as_ref()
                .map(|e| e.leaf_messages().join("\n"))
                .unwrap_or_default()
        }))
    }

    async fn list_members(&self, container: &str) -> Result<Vec<MemberRecord>> {
        let vms = self.client.list_virtual_machines(container).await?;
        let public_ips = self.client.list_public_ips(container).await?;
        let nics = self.client.list_network_interfaces(container).await?;

        let mut members = Vec::with_capacity(vms.len());
        for vm in vms {
            let public_address = public_ips
                .iter()
                .find(|ip| ip.name == format!("{}-pip", vm.name))
                .and_then(|ip| ip.properties.ip_address.clone());

            let internal_address = nics
                .iter()
                .find(|nic| nic.name == format!("{}-nic", vm.name))
                .and_then(|nic| nic.properties.ip_configurations.first())
                .and_then(|cfg| cfg.properties.private_ip_address.clone());

            let os = match vm.tags.get(OS_TAG).map(|s| s.parse::<GuestOsFamily>()) {
                Some(Ok(os)) => os,
                Some(Err(e)) => {
                    warn!(vm = %vm.name, error = %e, "arm: bad os tag, assuming linux");
                    GuestOsFamily::Linux
                }
                None => GuestOsFamily::Linux,
            };

            members.push(MemberRecord {
                role: vm
                    .tags
                    .get(ROLE_TAG)
                    .cloned()
                    .unwrap_or_else(|| vm.name.clone()),
                ports: Self::parse_ports(vm.tags.get(PORTS_TAG)),
                power: vm
                    .power_state()
                    .map(PowerState::parse)
                    .unwrap_or(PowerState::Unknown),
                name: vm.name,
                public_address,
                internal_address,
                os,
            });
        }

        debug!(container, count = members.len(), "arm: members listed");
        Ok(members)
    }

    async fn tag_container(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.client
            .update_resource_group_tags(
                name,
                &UpdateTagsRequest {
                    tags: tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                },
            )
            .await?;
        info!(container = name, ?tags, "arm: resource group tagged");
        Ok(())
    }

    async fn query_quota(&self, region: &str) -> Result<QuotaUsage> {
        let mut usage = QuotaUsage::new();

        let compute = self.client.list_compute_usages(region).await?;
        let network = self.client.list_network_usages(region).await?;
        let storage = self.client.list_storage_usages(region).await?;

        for entry in compute.into_iter().chain(network).chain(storage) {
            usage.set(entry.name.value, entry.current_value, entry.limit);
        }

        debug!(region, families = usage.len(), "arm: quota usage loaded");
        Ok(usage)
    }

    async fn vm_sizes(&self, region: &str) -> Result<BTreeMap<String, u32>> {
        Ok(self
            .client
            .list_vm_sizes(region)
            .await?
            .into_iter()
            .map(|size| (size.name, size.number_of_cores))
            .collect())
    }

    async fn list_resources(&self, container: &str) -> Result<Vec<ResourceRef>> {
        Ok(self
            .client
            .list_group_resources(container)
            .await?
            .into_iter()
            .map(Self::to_ref)
            .collect())
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()> {
        self.client
            .delete_resource(&GenericResource {
                id: resource.id.clone(),
                name: resource.name.clone(),
                kind: resource.kind.clone(),
            })
            .await?;
        info!(resource = %resource.name, kind = %resource.kind, "arm: resource delete accepted");
        Ok(())
    }

    async fn boot_diagnostics(&self, container: &str, vm: &str) -> Result<Option<String>> {
        let data = self.client.retrieve_boot_diagnostics(container, vm).await?;
        match data.serial_console_log_blob_uri {
            Some(uri) => Ok(Some(self.client.download_blob(&uri).await?)),
            None => Ok(None),
        }
    }

    fn name(&self) -> ProviderName {
        ProviderName::Arm
    }
}
