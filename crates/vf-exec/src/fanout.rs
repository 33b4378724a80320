//! One request per target, dispatched concurrently and joined under a
//! single deadline. A failing target never cancels its siblings.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};
use vf_infra::types::VmEndpoint;

use crate::engine::{ExecutionRequest, ExecutionResult, RemoteExecutionEngine};
use crate::protocol::SentinelProtocol;
use crate::shell::Credentials;
use crate::Error;

#[derive(Debug)]
pub enum FanOutOutcome {
    Completed(ExecutionResult),
    Failed(Error),
    /// Still running when the join deadline passed, or the worker died.
    Unfinished,
}

impl FanOutOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(r) if r.is_success())
    }
}

#[derive(Debug)]
pub struct FanOutReport {
    /// `(member name, outcome)` in request order.
    pub outcomes: Vec<(String, FanOutOutcome)>,
}

impl FanOutReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| o.is_success())
    }

    /// Members that did not succeed, with a short reason.
    pub fn failures(&self) -> Vec<(&str, String)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(name, o)| {
                let reason = match o {
                    FanOutOutcome::Completed(r) => format!("{:?}: {}", r.exit, r.stderr),
                    FanOutOutcome::Failed(e) => e.to_string(),
                    FanOutOutcome::Unfinished => "did not finish in time".to_string(),
                };
                (name.as_str(), reason)
            })
            .collect()
    }
}

impl RemoteExecutionEngine {
    /// Run every request concurrently and wait at most `wait` for all of them.
    pub async fn execute_all(
        self: &Arc<Self>,
        requests: Vec<ExecutionRequest>,
        wait: Duration,
    ) -> FanOutReport {
        let deadline = Instant::now() + wait;
        let mut outcomes: Vec<(String, FanOutOutcome)> = requests
            .iter()
            .map(|r| (r.target.name.clone(), FanOutOutcome::Unfinished))
            .collect();

        let mut workers = JoinSet::new();
        for (idx, req) in requests.into_iter().enumerate() {
            let engine = Arc::clone(self);
            workers.spawn(async move { (idx, engine.execute(&req).await) });
        }

        loop {
            match timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Ok((idx, result)))) => {
                    outcomes[idx].1 = match result {
                        Ok(r) => FanOutOutcome::Completed(r),
                        Err(e) => FanOutOutcome::Failed(e),
                    };
                }
                Ok(Some(Err(e))) => warn!(error = %e, "fan-out worker died"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = workers.len(), "fan-out wait expired");
                    workers.abort_all();
                    break;
                }
            }
        }

        let report = FanOutReport { outcomes };
        info!(
            targets = report.outcomes.len(),
            failed = report.failures().len(),
            "fan-out finished"
        );
        report
    }

    /// Write `content` to `path` on every target.
    pub async fn upload_all(
        self: &Arc<Self>,
        targets: &[VmEndpoint],
        credentials: &Credentials,
        content: &[u8],
        path: &str,
        wait: Duration,
    ) -> FanOutReport {
        let requests = targets
            .iter()
            .map(|t| {
                let line = SentinelProtocol::write_file_line(self.flavor_for(t), content, path);
                ExecutionRequest::new(line, t.clone(), credentials.clone())
            })
            .collect();
        self.execute_all(requests, wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use vf_infra::types::{DeploymentHandle, DeploymentStatus, GuestOsFamily, MemberRecord, PowerState};

    use crate::engine::{ExecConfig, ExitClass};
    use crate::shell::{OutputChunk, ProcessControl, ShellExecPrimitive, ShellTarget, SpawnedShell};

    /// Succeeds everywhere except on `bad_address`, where the login is rejected.
    struct SplitShell {
        bad_address: &'static str,
    }

    struct Done(Option<i32>);

    #[async_trait]
    impl ProcessControl for Done {
        fn pid(&self) -> Option<u32> {
            None
        }
        async fn wait(&mut self) -> io::Result<Option<i32>> {
            Ok(self.0)
        }
        async fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ShellExecPrimitive for SplitShell {
        async fn spawn(
            &self,
            target: &ShellTarget,
            _credentials: &Credentials,
            command_line: &str,
            _pty: bool,
        ) -> io::Result<SpawnedShell> {
            let (tx, rx) = mpsc::channel(4);
            if target.address == self.bad_address {
                tx.send(OutputChunk::Stderr("Permission denied, please try again.".into()))
                    .await
                    .unwrap();
                return Ok(SpawnedShell {
                    output: rx,
                    control: Box::new(Done(Some(255))),
                });
            }
            let start = command_line.find("VF-EXIT-").unwrap();
            let end = command_line[start..].find("-$?").unwrap();
            tx.send(OutputChunk::Stdout(format!(
                "{}-0",
                &command_line[start..start + end]
            )))
            .await
            .unwrap();
            Ok(SpawnedShell {
                output: rx,
                control: Box::new(Done(Some(0))),
            })
        }

        fn name(&self) -> &'static str {
            "split"
        }
    }

    fn member(handle: &DeploymentHandle, name: &str, address: &str) -> VmEndpoint {
        MemberRecord {
            name: name.into(),
            role: name.into(),
            public_address: Some(address.into()),
            internal_address: None,
            os: GuestOsFamily::Linux,
            ports: Default::default(),
            power: PowerState::Running,
        }
        .bind(handle.deployment_ref())
    }

    #[tokio::test]
    async fn one_bad_target_does_not_cancel_the_rest() {
        let handle = DeploymentHandle::new("rg-fan", "westus2", 0);
        handle.advance(DeploymentStatus::Provisioning).unwrap();
        handle.advance(DeploymentStatus::Verifying).unwrap();
        handle.advance(DeploymentStatus::Ready).unwrap();

        let targets = vec![
            member(&handle, "vm0", "10.0.0.4"),
            member(&handle, "vm1", "10.0.0.5"),
            member(&handle, "vm2", "10.0.0.6"),
        ];
        let engine = Arc::new(RemoteExecutionEngine::new(
            Arc::new(SplitShell {
                bad_address: "10.0.0.5",
            }),
            ExecConfig {
                retry_delay: Duration::ZERO,
                ..ExecConfig::default()
            },
        ));

        let report = engine
            .upload_all(
                &targets,
                &Credentials::default(),
                b"payload",
                "/tmp/payload.bin",
                Duration::from_secs(30),
            )
            .await;

        assert!(!report.all_succeeded());
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "vm1");
        assert!(matches!(
            report.outcomes[0].1,
            FanOutOutcome::Completed(ref r) if r.exit == ExitClass::Success
        ));
        assert!(matches!(
            report.outcomes[1].1,
            FanOutOutcome::Failed(Error::AuthFailure { .. })
        ));
        assert!(report.outcomes[2].1.is_success());
    }
}
