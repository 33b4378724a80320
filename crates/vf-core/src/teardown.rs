use std::collections::BTreeMap;

use tracing::{info, warn};
use vf_infra::CloudClient;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownAction {
    Delete,
    Preserve,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownPolicy {
    /// Keep the fleet even when the run passed.
    pub preserve: bool,
    /// Delete even failed fleets. Wins over everything else.
    pub force_delete: bool,
}

impl TeardownPolicy {
    pub fn decide(&self, outcome: RunOutcome) -> TeardownAction {
        if self.force_delete {
            return TeardownAction::Delete;
        }
        match outcome {
            RunOutcome::Passed if !self.preserve => TeardownAction::Delete,
            _ => TeardownAction::Preserve,
        }
    }
}

/// Tags attached to a container kept for inspection.
pub fn preserve_tags(test_name: &str, run_id: &str, outcome: RunOutcome) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("testName".to_string(), test_name.to_string()),
        ("preserve".to_string(), "yes".to_string()),
        ("runId".to_string(), run_id.to_string()),
        ("outcome".to_string(), outcome.as_str().to_string()),
    ])
}

fn is_protected(kind: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| p.eq_ignore_ascii_case(kind))
}

/// Remove everything in `container` except protected resource types.
///
/// Without protected resources the container itself is deleted. Otherwise
/// resources are deleted one by one, re-listing between passes, until only
/// protected ones remain or `max_passes` runs out.
pub async fn drain_container(
    cloud: &dyn CloudClient,
    container: &str,
    protected: &[String],
    max_passes: u32,
) -> Result<()> {
    if !cloud.container_exists(container).await? {
        return Ok(());
    }

    let resources = cloud.list_resources(container).await?;
    if !resources.iter().any(|r| is_protected(&r.kind, protected)) {
        cloud.delete_container(container).await?;
        info!(container, "container deleted");
        return Ok(());
    }

    let mut remaining = resources;
    for pass in 1..=max_passes {
        remaining.retain(|r| !is_protected(&r.kind, protected));
        if remaining.is_empty() {
            info!(container, passes = pass - 1, "container drained, protected resources kept");
            return Ok(());
        }

        for resource in &remaining {
            if let Err(e) = cloud.delete_resource(resource).await {
                warn!(container, resource = %resource.name, kind = %resource.kind, error = %e, "resource delete failed");
            }
        }
        remaining = cloud.list_resources(container).await?;
    }

    remaining.retain(|r| !is_protected(&r.kind, protected));
    if remaining.is_empty() {
        info!(container, "container drained, protected resources kept");
        return Ok(());
    }

    Err(Error::TeardownIncomplete {
        container: container.to_string(),
        remaining: remaining.into_iter().map(|r| r.name).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use vf_infra::types::ResourceRef;

    fn res(name: &str, kind: &str) -> ResourceRef {
        ResourceRef {
            id: format!("/rg/{name}"),
            name: name.into(),
            kind: kind.into(),
        }
    }

    const AVSET: &str = "Microsoft.Compute/availabilitySets";

    #[test]
    fn passed_runs_are_deleted_failed_runs_preserved() {
        let default = TeardownPolicy::default();
        assert_eq!(default.decide(RunOutcome::Passed), TeardownAction::Delete);
        assert_eq!(default.decide(RunOutcome::Failed), TeardownAction::Preserve);
        assert_eq!(default.decide(RunOutcome::Aborted), TeardownAction::Preserve);

        let keep = TeardownPolicy {
            preserve: true,
            force_delete: false,
        };
        assert_eq!(keep.decide(RunOutcome::Passed), TeardownAction::Preserve);
    }

    #[test]
    fn force_delete_overrides_preservation() {
        let policy = TeardownPolicy {
            preserve: true,
            force_delete: true,
        };
        for outcome in [RunOutcome::Passed, RunOutcome::Failed, RunOutcome::Aborted] {
            assert_eq!(policy.decide(outcome), TeardownAction::Delete);
        }
    }

    #[test]
    fn preserve_tags_carry_run_metadata() {
        let tags = preserve_tags("NETWORK-IPERF", "run-7", RunOutcome::Failed);
        assert_eq!(tags["preserve"], "yes");
        assert_eq!(tags["testName"], "NETWORK-IPERF");
        assert_eq!(tags["runId"], "run-7");
        assert_eq!(tags["outcome"], "failed");
    }

    #[tokio::test]
    async fn unprotected_container_is_deleted_whole() {
        let cloud = FakeCloud::new();
        cloud.add_container("rg-1", vec![res("vm0", "Microsoft.Compute/virtualMachines")]);

        drain_container(&cloud, "rg-1", &[AVSET.into()], 5).await.unwrap();
        assert!(cloud.calls().contains(&"delete_container:rg-1".to_string()));
        assert!(!cloud.container_present("rg-1"));
    }

    #[tokio::test]
    async fn protected_resources_survive_drain() {
        let cloud = FakeCloud::new();
        cloud.add_container(
            "rg-1",
            vec![
                res("avset", AVSET),
                res("vm0", "Microsoft.Compute/virtualMachines"),
                res("nic0", "Microsoft.Network/networkInterfaces"),
            ],
        );

        drain_container(&cloud, "rg-1", &[AVSET.into()], 5).await.unwrap();
        let left = cloud.resources("rg-1");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "avset");
        assert!(!cloud.calls().contains(&"delete_container:rg-1".to_string()));
    }

    #[tokio::test]
    async fn stubborn_resources_exhaust_passes() {
        let cloud = FakeCloud::new();
        cloud.add_container(
            "rg-1",
            vec![res("avset", AVSET), res("locked", "Microsoft.Storage/storageAccounts")],
        );
        cloud.fail_resource_delete("locked");

        let err = drain_container(&cloud, "rg-1", &[AVSET.into()], 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TeardownIncomplete { ref remaining, .. } if remaining == &["locked".to_string()]));
        let attempts = cloud
            .calls()
            .iter()
            .filter(|c| c.as_str() == "delete_resource:locked")
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn missing_container_is_already_drained() {
        let cloud = FakeCloud::new();
        drain_container(&cloud, "rg-gone", &[], 5).await.unwrap();
        assert_eq!(cloud.calls(), vec!["container_exists:rg-gone".to_string()]);
    }
}
