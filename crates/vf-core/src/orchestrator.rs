//! Drives a fleet from admission to teardown.
//!
//! `Pending -> Provisioning -> Verifying -> Ready -> TornDown`, with any
//! non-terminal state able to drop to `Failed`. Each unit owns its
//! [`DeploymentHandle`]; endpoints only observe it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vf_exec::{Credentials, ExecutionRequest, FanOutReport, RemoteExecutionEngine};
use vf_infra::types::{
    AdminCredentials, DeploymentContext, DeploymentHandle, DeploymentStatus, FleetDescriptor,
    GuestOsFamily, PowerState, VmEndpoint,
};
use vf_infra::{CloudClient, TemplateBuilder};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::config::OrchestratorConfig;
use crate::connectivity::ConnectivityPoller;
use crate::naming::NameGenerator;
use crate::teardown::{self, RunOutcome, TeardownAction, TeardownPolicy};
use crate::{Error, Result};

/// Where one deployment unit goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub container: String,
    pub region: String,
    pub index: u32,
}

/// Identity of the run the fleet serves.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: String,
    pub test_name: String,
    pub admin: AdminCredentials,
}

/// A unit that reached `Ready`, with its bound endpoints.
#[derive(Debug)]
pub struct Deployment {
    pub handle: DeploymentHandle,
    pub endpoints: Vec<VmEndpoint>,
}

impl Deployment {
    pub fn container(&self) -> &str {
        &self.handle.name
    }
}

#[derive(Debug, Default)]
pub struct FleetDeployment {
    pub planned: Vec<UnitPlan>,
    pub ready: Vec<Deployment>,
    /// `(container, error)` for every unit that did not reach `Ready`.
    pub failed: Vec<(String, Error)>,
}

impl FleetDeployment {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty() && self.ready.len() == self.planned.len()
    }
}

enum SubmitFailure {
    /// Nothing worth retrying: container creation or template rendering.
    Fatal(String),
    Submit(String),
}

pub struct FleetLifecycleOrchestrator {
    cloud: Arc<dyn CloudClient>,
    templates: Arc<dyn TemplateBuilder>,
    engine: Arc<RemoteExecutionEngine>,
    poller: ConnectivityPoller,
    config: OrchestratorConfig,
}

impl FleetLifecycleOrchestrator {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        templates: Arc<dyn TemplateBuilder>,
        engine: Arc<RemoteExecutionEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cloud,
            templates,
            engine,
            poller: ConnectivityPoller::new(),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<RemoteExecutionEngine> {
        &self.engine
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Planning and admission ──────────────────────────────────────

    /// Name every unit and spread units over the listed regions in order.
    pub fn plan(&self, fleet: &FleetDescriptor, run_id: &str) -> Result<Vec<UnitPlan>> {
        let regions = fleet.regions();
        if regions.is_empty() {
            return Err(Error::NoRegion);
        }

        let names = NameGenerator::new(fleet, run_id);
        let units = fleet.units.max(1);
        Ok((0..units)
            .map(|index| UnitPlan {
                container: if units > 1 {
                    names.for_unit(index)
                } else {
                    names.next()
                },
                region: regions[index as usize % regions.len()].to_string(),
                index,
            })
            .collect())
    }

    /// Re-evaluate quota until the fleet fits in `region` or the wait runs out.
    pub async fn admit(&self, fleet: &FleetDescriptor, region: &str) -> Result<AdmissionDecision> {
        let catalog = match self.cloud.vm_sizes(region).await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(region, error = %e, "size catalog unavailable, relying on declared core counts");
                BTreeMap::new()
            }
        };
        let controller = AdmissionController::with_catalog(catalog);
        let deadline = Instant::now() + self.config.quota_wait;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let usage = match self.cloud.query_quota(region).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(region, error = %e, "quota query failed, admitting without a check");
                    return Ok(AdmissionDecision {
                        ok: true,
                        violations: Vec::new(),
                    });
                }
            };

            let decision = controller.evaluate(fleet, &usage, self.config.allowed_quota_percent);
            if decision.ok {
                info!(region, attempt, units = fleet.units, "fleet admitted");
                return Ok(decision);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(region, attempt, "quota wait exhausted");
                return Err(Error::AdmissionRejected {
                    region: region.to_string(),
                    violations: decision.violations,
                });
            }

            let pause = self.backoff().min(deadline - now);
            for v in &decision.violations {
                warn!(region, family = %v.family, current = v.current, projected = v.projected, allowed = v.allowed, "quota exceeded");
            }
            info!(region, attempt, wait_secs = pause.as_secs(), "waiting for quota");
            tokio::time::sleep(pause).await;
        }
    }

    fn backoff(&self) -> Duration {
        let lo = self.config.quota_backoff_min.as_millis() as u64;
        let hi = self.config.quota_backoff_max.as_millis() as u64;
        if hi <= lo {
            return self.config.quota_backoff_min;
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    // ── Provisioning ────────────────────────────────────────────────

    /// Admit, provision and verify every unit of `fleet`.
    ///
    /// Admission failure aborts the whole fleet. Past admission, units are
    /// provisioned concurrently and a failing unit never stops its siblings.
    pub async fn deploy(&self, fleet: &FleetDescriptor, ctx: &RunContext) -> Result<FleetDeployment> {
        let planned = self.plan(fleet, &ctx.run_id)?;

        let mut per_region: BTreeMap<String, u32> = BTreeMap::new();
        for unit in &planned {
            *per_region.entry(unit.region.clone()).or_default() += 1;
        }
        for (region, units) in &per_region {
            let mut scoped = fleet.clone();
            scoped.units = *units;
            self.admit(&scoped, region).await?;
        }

        if self.config.dry_run {
            for unit in &planned {
                info!(container = %unit.container, region = %unit.region, unit = unit.index, "dry run, not provisioning");
            }
            return Ok(FleetDeployment {
                planned,
                ..Default::default()
            });
        }

        let results = join_all(planned.iter().map(|unit| self.provision_unit(fleet, unit, ctx))).await;

        let mut deployment = FleetDeployment {
            planned,
            ..Default::default()
        };
        for (unit, result) in deployment.planned.iter().zip(results) {
            match result {
                Ok(ready) => deployment.ready.push(ready),
                Err(e) => {
                    warn!(container = %unit.container, error = %e, "unit failed");
                    deployment.failed.push((unit.container.clone(), e));
                }
            }
        }
        info!(
            ready = deployment.ready.len(),
            failed = deployment.failed.len(),
            "fleet deployment finished"
        );
        Ok(deployment)
    }

    async fn provision_unit(
        &self,
        fleet: &FleetDescriptor,
        unit: &UnitPlan,
        ctx: &RunContext,
    ) -> Result<Deployment> {
        let started = Instant::now();
        let container = unit.container.as_str();
        let mut handle = DeploymentHandle::new(container, &unit.region, unit.index);
        handle.advance(DeploymentStatus::Provisioning)?;
        info!(container, region = %unit.region, unit = unit.index, "provisioning unit");

        // a leftover from an aborted run with the same name must go first
        if let Err(e) = self.drain(container).await {
            handle.fail();
            return Err(Error::ProvisioningFailed {
                container: container.to_string(),
                reason: format!("pre-delete failed: {e}"),
                preserved: false,
            });
        }

        let attempts = self.config.submit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let reason = match self.create_and_submit(fleet, unit, ctx).await {
                Ok(()) => break,
                Err(SubmitFailure::Fatal(reason)) => {
                    warn!(container, reason = %reason, "unit setup failed");
                    if let Err(e) = self.drain(container).await {
                        warn!(container, error = %e, "cleanup after failed setup incomplete");
                    }
                    handle.fail();
                    return Err(Error::ProvisioningFailed {
                        container: container.to_string(),
                        reason,
                        preserved: false,
                    });
                }
                Err(SubmitFailure::Submit(reason)) => reason,
            };

            let running = self.running_members(container).await;
            if running > 0 {
                warn!(container, running, reason = %reason, "deployment failed with running members, preserving");
                let tags = teardown::preserve_tags(&ctx.test_name, &ctx.run_id, RunOutcome::Failed);
                if let Err(e) = self.cloud.tag_container(container, &tags).await {
                    warn!(container, error = %e, "tagging preserved container failed");
                }
                handle.preserved = true;
                handle.fail();
                return Err(Error::ProvisioningFailed {
                    container: container.to_string(),
                    reason,
                    preserved: true,
                });
            }

            warn!(container, attempt, reason = %reason, "deployment failed with nothing running, deleting");
            if let Err(e) = self.drain(container).await {
                warn!(container, error = %e, "cleanup after failed deployment incomplete");
            }
            if attempt >= attempts {
                handle.fail();
                return Err(Error::ProvisioningFailed {
                    container: container.to_string(),
                    reason,
                    preserved: false,
                });
            }
            info!(container, attempt = attempt + 1, "retrying deployment");
        }

        handle.provision_elapsed = Some(started.elapsed());
        handle.advance(DeploymentStatus::Verifying)?;

        let members = match self.cloud.list_members(container).await {
            Ok(members) if !members.is_empty() => members,
            Ok(_) => {
                handle.fail();
                return Err(Error::ProvisioningFailed {
                    container: container.to_string(),
                    reason: "deployment produced no members".into(),
                    preserved: false,
                });
            }
            Err(e) => {
                handle.fail();
                return Err(Error::ProvisioningFailed {
                    container: container.to_string(),
                    reason: format!("listing members failed: {e}"),
                    preserved: false,
                });
            }
        };

        let endpoints: Vec<VmEndpoint> = members
            .into_iter()
            .map(|m| m.bind(handle.deployment_ref()))
            .collect();
        let report = self
            .poller
            .probe(
                &endpoints,
                |e| e.management_port,
                self.config.connect_attempts,
                self.config.connect_interval,
            )
            .await;

        if !report.all_reachable() {
            self.collect_diagnostics(container, &report.unreachable_in(&endpoints))
                .await;
            handle.fail();
            return Err(Error::ConnectivityTimeout {
                container: container.to_string(),
                unreachable: report.unreachable,
            });
        }

        handle.advance(DeploymentStatus::Ready)?;
        info!(
            container,
            members = endpoints.len(),
            provision_secs = handle.provision_elapsed.map(|d| d.as_secs()).unwrap_or_default(),
            "unit ready"
        );
        Ok(Deployment { handle, endpoints })
    }

    async fn create_and_submit(
        &self,
        fleet: &FleetDescriptor,
        unit: &UnitPlan,
        ctx: &RunContext,
    ) -> std::result::Result<(), SubmitFailure> {
        let container = unit.container.as_str();

        match self.cloud.create_container(container, &unit.region).await {
            Ok(state) if state.is_succeeded() => debug!(container, "container created"),
            Ok(state) => {
                return Err(SubmitFailure::Fatal(format!("container creation ended {state}")));
            }
            Err(e) => return Err(SubmitFailure::Fatal(format!("container creation failed: {e}"))),
        }

        let deployment_ctx = DeploymentContext {
            container: container.to_string(),
            region: unit.region.clone(),
            run_id: ctx.run_id.clone(),
            unit_index: unit.index,
            admin: ctx.admin.clone(),
        };
        let template = self
            .templates
            .render(fleet, &deployment_ctx)
            .map_err(|e| SubmitFailure::Fatal(format!("template rendering failed: {e}")))?;

        let submit = self.cloud.submit_deployment(container, &template);
        match tokio::time::timeout(self.config.deploy_timeout, submit).await {
            Ok(Ok(state)) if state.is_succeeded() => {
                info!(container, "deployment succeeded");
                Ok(())
            }
            Ok(Ok(state)) => Err(SubmitFailure::Submit(format!("deployment ended {state}"))),
            Ok(Err(e)) => Err(SubmitFailure::Submit(e.to_string())),
            Err(_) => Err(SubmitFailure::Submit(format!(
                "deployment did not finish within {}s",
                self.config.deploy_timeout.as_secs()
            ))),
        }
    }

    /// Members reported running. A failed listing counts as none.
    async fn running_members(&self, container: &str) -> usize {
        match self.cloud.list_members(container).await {
            Ok(members) => members
                .iter()
                .filter(|m| m.power == PowerState::Running)
                .count(),
            Err(e) => {
                warn!(container, error = %e, "listing members failed, assuming none running");
                0
            }
        }
    }

    /// Best effort: fetch serial logs of unreachable members into the
    /// diagnostics directory.
    async fn collect_diagnostics(&self, container: &str, unreachable: &[&VmEndpoint]) {
        let Some(root) = &self.config.diagnostics_dir else {
            return;
        };
        let dir = root.join(container);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(path = %dir.display(), error = %e, "cannot create diagnostics directory");
            return;
        }

        for vm in unreachable {
            match self.cloud.boot_diagnostics(container, &vm.name).await {
                Ok(Some(log)) => {
                    let path = dir.join(format!("{}_serial_console.log", vm.name));
                    match tokio::fs::write(&path, log).await {
                        Ok(()) => info!(vm = %vm.name, path = %path.display(), "serial console log saved"),
                        Err(e) => warn!(vm = %vm.name, error = %e, "writing serial console log failed"),
                    }
                }
                Ok(None) => debug!(vm = %vm.name, "no boot diagnostics available"),
                Err(e) => warn!(vm = %vm.name, error = %e, "fetching boot diagnostics failed"),
            }
        }
    }

    async fn drain(&self, container: &str) -> Result<()> {
        teardown::drain_container(
            self.cloud.as_ref(),
            container,
            &self.config.protected_resource_types,
            self.config.drain_passes,
        )
        .await
    }

    // ── Use and teardown ────────────────────────────────────────────

    /// Run `command` on every member of the unit, each bounded by `max_duration`.
    pub async fn execute_on_fleet(
        &self,
        deployment: &Deployment,
        command: &str,
        credentials: &Credentials,
        elevated: bool,
        max_duration: Duration,
    ) -> FanOutReport {
        let requests = deployment
            .endpoints
            .iter()
            .map(|e| {
                let req = ExecutionRequest::new(command, e.clone(), credentials.clone())
                    .with_max_duration(max_duration);
                if elevated { req.with_elevation() } else { req }
            })
            .collect();
        let wait = self.engine.config().request_ceiling(max_duration);
        self.engine.execute_all(requests, wait).await
    }

    /// Record the guest OS of every member so the engine picks the right shell.
    pub async fn detect_guest_os(
        &self,
        deployment: &Deployment,
        credentials: &Credentials,
    ) -> Result<Vec<(String, GuestOsFamily)>> {
        let mut detected = Vec::with_capacity(deployment.endpoints.len());
        for endpoint in &deployment.endpoints {
            let os = self.engine.detect_guest_os(endpoint, credentials).await?;
            detected.push((endpoint.name.clone(), os));
        }
        Ok(detected)
    }

    /// Reboot every member and wait until all are reachable again.
    pub async fn restart_fleet(&self, deployment: &Deployment, credentials: &Credentials) -> Result<()> {
        let container = deployment.container();
        info!(container, members = deployment.endpoints.len(), "restarting fleet");

        // the channel drops mid-command, so only wait for the shell to start
        let requests = deployment
            .endpoints
            .iter()
            .map(|e| {
                ExecutionRequest::new("reboot", e.clone(), credentials.clone())
                    .with_elevation()
                    .in_background()
            })
            .collect();
        let report = self
            .engine
            .execute_all(requests, self.engine.config().ready_window * 2)
            .await;
        if !report.all_succeeded() {
            return Err(Error::RestartFailed {
                container: container.to_string(),
                failures: report
                    .failures()
                    .into_iter()
                    .map(|(name, reason)| format!("{name}: {reason}"))
                    .collect(),
            });
        }

        // script files under the remote temp dir may not survive a reboot
        self.engine.forget_uploads();
        tokio::time::sleep(self.config.connect_interval).await;

        let reachability = self
            .poller
            .probe(
                &deployment.endpoints,
                |e| e.management_port,
                self.config.connect_attempts,
                self.config.connect_interval,
            )
            .await;
        if !reachability.all_reachable() {
            return Err(Error::ConnectivityTimeout {
                container: container.to_string(),
                unreachable: reachability.unreachable,
            });
        }
        info!(container, "fleet back after restart");
        Ok(())
    }

    /// Delete or preserve a unit according to `policy`.
    pub async fn teardown(
        &self,
        deployment: &mut Deployment,
        outcome: RunOutcome,
        policy: &TeardownPolicy,
        ctx: &RunContext,
    ) -> Result<TeardownAction> {
        let container = deployment.container().to_string();
        let action = policy.decide(outcome);

        match action {
            TeardownAction::Delete => {
                self.drain(&container).await?;
                if deployment.handle.status() == DeploymentStatus::Ready {
                    deployment.handle.advance(DeploymentStatus::TornDown)?;
                }
                info!(container, outcome = outcome.as_str(), "fleet deleted");
            }
            TeardownAction::Preserve => {
                let tags = teardown::preserve_tags(&ctx.test_name, &ctx.run_id, outcome);
                self.cloud.tag_container(&container, &tags).await?;
                deployment.handle.preserved = true;
                warn!(container, outcome = outcome.as_str(), "fleet preserved for inspection");
            }
        }
        Ok(action)
    }

    /// Apply `policy` to a unit that never reached `Ready`.
    ///
    /// Units that failed provisioning were already tagged or deleted on the
    /// spot; only units that failed verification still need tagging.
    pub async fn settle_failed(
        &self,
        container: &str,
        error: &Error,
        policy: &TeardownPolicy,
        ctx: &RunContext,
    ) -> Result<TeardownAction> {
        let action = policy.decide(RunOutcome::Failed);
        match action {
            TeardownAction::Delete => {
                info!(container, "discarding failed unit");
                self.drain(container).await?;
            }
            TeardownAction::Preserve => {
                if let Error::ConnectivityTimeout { .. } = error {
                    let tags = teardown::preserve_tags(&ctx.test_name, &ctx.run_id, RunOutcome::Failed);
                    self.cloud.tag_container(container, &tags).await?;
                    warn!(container, "unreachable unit preserved for inspection");
                } else {
                    debug!(container, error = %error, "nothing left to preserve");
                }
            }
        }
        Ok(action)
    }
}
