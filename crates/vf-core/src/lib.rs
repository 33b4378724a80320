//! Fleet lifecycle: admission, provisioning, verification and teardown.

pub mod admission;
pub mod config;
pub mod connectivity;
pub mod naming;
pub mod orchestrator;
pub mod sku;
pub mod teardown;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, AdmissionDecision, Violation};
pub use config::OrchestratorConfig;
pub use connectivity::{ConnectivityPoller, ReachabilityReport};
pub use orchestrator::{Deployment, FleetDeployment, FleetLifecycleOrchestrator, RunContext, UnitPlan};
pub use teardown::{RunOutcome, TeardownAction, TeardownPolicy};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("admission rejected in {region}: {}", join(violations))]
    AdmissionRejected {
        region: String,
        violations: Vec<Violation>,
    },

    #[error("provisioning of {container} failed ({}): {reason}", if *preserved { "preserved" } else { "not preserved" })]
    ProvisioningFailed {
        container: String,
        reason: String,
        preserved: bool,
    },

    #[error("{container}: endpoints never became reachable: {}", unreachable.join(", "))]
    ConnectivityTimeout {
        container: String,
        unreachable: Vec<String>,
    },

    #[error("{container}: resources left after drain: {}", remaining.join(", "))]
    TeardownIncomplete {
        container: String,
        remaining: Vec<String>,
    },

    #[error("{container}: restart failed on {}", failures.join("; "))]
    RestartFailed {
        container: String,
        failures: Vec<String>,
    },

    #[error("fleet descriptor names no region")]
    NoRegion,

    #[error(transparent)]
    Infra(#[from] vf_infra::Error),

    #[error(transparent)]
    Exec(#[from] vf_exec::Error),
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
