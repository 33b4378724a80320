mod config;
mod error;
mod plan;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vf_core::{
    Deployment, FleetLifecycleOrchestrator, OrchestratorConfig, RunContext, RunOutcome,
};
use vf_exec::{Credentials, ExecConfig, RemoteExecutionEngine, SshShell};
use vf_infra::template::ArmTemplateBuilder;
use vf_infra::types::AdminCredentials;

use crate::config::AppConfig;
use crate::error::Result;
use crate::plan::{RunPlan, ValidationStep};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(RunOutcome::Passed) => {
            info!("run passed");
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            error!(outcome = outcome.as_str(), "run did not pass");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<RunOutcome> {
    let config = AppConfig::from_env()?;
    let plan = RunPlan::load(&config.descriptor).await?;

    let cloud = vf_infra::build_cloud()?;
    let engine = Arc::new(RemoteExecutionEngine::new(
        Arc::new(SshShell::from_env()?),
        ExecConfig::from_env()?,
    ));
    let orchestrator = FleetLifecycleOrchestrator::new(
        cloud,
        Arc::new(ArmTemplateBuilder),
        engine.clone(),
        OrchestratorConfig::from_env()?,
    );

    let ctx = RunContext {
        run_id: config.run_id.clone(),
        test_name: config.test_name.clone(),
        admin: admin_credentials(&config).await,
    };
    info!(
        run_id = %ctx.run_id,
        test = %ctx.test_name,
        units = plan.fleet.units,
        region = %plan.fleet.region,
        steps = plan.validation.len(),
        "starting run"
    );

    let mut fleet = orchestrator.deploy(&plan.fleet, &ctx).await?;
    if orchestrator.config().dry_run {
        info!(units = fleet.planned.len(), "dry run complete");
        return Ok(RunOutcome::Passed);
    }

    let mut outcome = if fleet.all_ready() {
        RunOutcome::Passed
    } else {
        RunOutcome::Failed
    };

    let credentials = config.credentials();
    for deployment in &fleet.ready {
        if validate(&orchestrator, deployment, &plan.validation, &credentials).await != RunOutcome::Passed {
            outcome = RunOutcome::Failed;
        }
    }

    let cancelled = engine.jobs().cancel_all();
    if cancelled > 0 {
        info!(cancelled, "cancelled leftover background jobs");
    }

    let policy = config.teardown_policy();
    for deployment in &mut fleet.ready {
        if let Err(e) = orchestrator.teardown(deployment, outcome, &policy, &ctx).await {
            error!(container = %deployment.container(), error = %e, "teardown failed");
        }
    }
    for (container, failure) in &fleet.failed {
        if let Err(e) = orchestrator.settle_failed(container, failure, &policy, &ctx).await {
            error!(container = %container, error = %e, "cleanup of failed unit failed");
        }
    }

    Ok(outcome)
}

async fn admin_credentials(config: &AppConfig) -> AdminCredentials {
    let ssh_public_key = match config.public_key_path() {
        Some(path) => match tokio::fs::read_to_string(&path).await {
            Ok(key) => Some(key.trim().to_string()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "public key unreadable, deploying without it");
                None
            }
        },
        None => None,
    };

    AdminCredentials {
        user: config.ssh_user.clone(),
        password: config.ssh_password.clone(),
        ssh_public_key,
    }
}

/// Run every step on one unit; the first failing step fails the unit.
async fn validate(
    orchestrator: &FleetLifecycleOrchestrator,
    deployment: &Deployment,
    steps: &[ValidationStep],
    credentials: &Credentials,
) -> RunOutcome {
    let container = deployment.container();

    match orchestrator.detect_guest_os(deployment, credentials).await {
        Ok(detected) => {
            for (vm, os) in detected {
                info!(container, vm = %vm, os = os.as_str(), "member ready");
            }
        }
        Err(e) => {
            error!(container, error = %e, "guest os detection failed");
            return RunOutcome::Failed;
        }
    }

    for step in steps {
        if step.restart_before
            && let Err(e) = orchestrator.restart_fleet(deployment, credentials).await
        {
            error!(container, step = %step.name, error = %e, "restart before step failed");
            return RunOutcome::Failed;
        }

        let report = orchestrator
            .execute_on_fleet(
                deployment,
                &step.command,
                credentials,
                step.elevated,
                Duration::from_secs(step.timeout_secs),
            )
            .await;

        if !report.all_succeeded() {
            for (vm, reason) in report.failures() {
                error!(container, step = %step.name, vm, reason = %reason, "validation step failed");
            }
            return RunOutcome::Failed;
        }
        info!(container, step = %step.name, members = report.outcomes.len(), "validation step passed");
    }

    RunOutcome::Passed
}
