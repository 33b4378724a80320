//! In-memory cloud with call recording and fault injection.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use vf_infra::types::{MemberRecord, ProvisioningState, QuotaUsage, ResourceRef, TemplateBlob};
use vf_infra::{CloudClient, Error, ProviderName, Result};

#[derive(Default)]
struct State {
    calls: Vec<String>,
    containers: BTreeMap<String, Vec<ResourceRef>>,
    tags: BTreeMap<String, BTreeMap<String, String>>,
    members: Vec<MemberRecord>,
    catalog: BTreeMap<String, u32>,
    quota: VecDeque<QuotaUsage>,
    submits: VecDeque<ProvisioningState>,
    create_result: Option<ProvisioningState>,
    fail_delete_container: bool,
    stubborn: HashSet<String>,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Recorded calls with the given operation name, e.g. `"submit_deployment"`.
    pub fn count(&self, op: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    pub fn add_container(&self, name: &str, resources: Vec<ResourceRef>) {
        self.state().containers.insert(name.into(), resources);
    }

    pub fn container_present(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn resources(&self, name: &str) -> Vec<ResourceRef> {
        self.state()
            .containers
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state().tags.get(name).cloned()
    }

    pub fn set_members(&self, members: Vec<MemberRecord>) {
        self.state().members = members;
    }

    pub fn set_catalog(&self, catalog: BTreeMap<String, u32>) {
        self.state().catalog = catalog;
    }

    /// Quota snapshots returned in order; the last one repeats.
    pub fn push_quota(&self, usage: QuotaUsage) {
        self.state().quota.push_back(usage);
    }

    /// Deployment outcomes returned in order; `Succeeded` once exhausted.
    pub fn push_submit(&self, state: ProvisioningState) {
        self.state().submits.push_back(state);
    }

    pub fn fail_create(&self, state: ProvisioningState) {
        self.state().create_result = Some(state);
    }

    pub fn fail_container_delete(&self) {
        self.state().fail_delete_container = true;
    }

    pub fn fail_resource_delete(&self, name: &str) {
        self.state().stubborn.insert(name.into());
    }

    fn record(&self, op: &str, arg: &str) {
        self.state().calls.push(format!("{op}:{arg}"));
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn create_container(&self, name: &str, region: &str) -> Result<ProvisioningState> {
        self.record("create_container", name);
        let mut state = self.state();
        if let Some(failed) = state.create_result.clone() {
            return Ok(failed);
        }
        state.containers.insert(
            name.into(),
            vec![ResourceRef {
                id: format!("/{region}/{name}"),
                name: name.into(),
                kind: "Microsoft.Resources/resourceGroups".into(),
            }],
        );
        Ok(ProvisioningState::Succeeded)
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        self.record("delete_container", name);
        let mut state = self.state();
        if state.fail_delete_container {
            return Err(Error::Timeout(format!("deletion of resource group {name}")));
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        self.record("container_exists", name);
        Ok(self.state().containers.contains_key(name))
    }

    async fn submit_deployment(
        &self,
        container: &str,
        _template: &TemplateBlob,
    ) -> Result<ProvisioningState> {
        self.record("submit_deployment", container);
        Ok(self
            .state()
            .submits
            .pop_front()
            .unwrap_or(ProvisioningState::Succeeded))
    }

    async fn list_members(&self, container: &str) -> Result<Vec<MemberRecord>> {
        self.record("list_members", container);
        Ok(self.state().members.clone())
    }

    async fn tag_container(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.record("tag_container", name);
        self.state().tags.insert(name.into(), tags.clone());
        Ok(())
    }

    async fn query_quota(&self, region: &str) -> Result<QuotaUsage> {
        self.record("query_quota", region);
        let mut state = self.state();
        let usage = if state.quota.len() > 1 {
            state.quota.pop_front()
        } else {
            state.quota.front().cloned()
        };
        Ok(usage.unwrap_or_default())
    }

    async fn vm_sizes(&self, region: &str) -> Result<BTreeMap<String, u32>> {
        self.record("vm_sizes", region);
        Ok(self.state().catalog.clone())
    }

    async fn list_resources(&self, container: &str) -> Result<Vec<ResourceRef>> {
        self.record("list_resources", container);
        Ok(self.resources(container))
    }

    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()> {
        self.record("delete_resource", &resource.name);
        let mut state = self.state();
        if state.stubborn.contains(&resource.name) {
            return Err(Error::Timeout(format!("deletion of {}", resource.name)));
        }
        for resources in state.containers.values_mut() {
            resources.retain(|r| r.id != resource.id);
        }
        Ok(())
    }

    async fn boot_diagnostics(&self, container: &str, vm: &str) -> Result<Option<String>> {
        self.record("boot_diagnostics", &format!("{container}/{vm}"));
        Ok(Some(format!("serial console of {vm}\n")))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Arm
    }
}
