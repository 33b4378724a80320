//! Remote command execution over an unreliable shell transport.

pub mod engine;
pub mod fanout;
pub mod jobs;
pub mod protocol;
pub mod retry;
pub mod shell;

pub use engine::{
    ExecConfig, ExecMode, ExecutionRequest, ExecutionResult, ExitClass, RemoteExecutionEngine,
};
pub use fanout::{FanOutOutcome, FanOutReport};
pub use jobs::{JobHandle, JobRegistry, JobStatus};
pub use shell::{Credentials, LocalShell, ShellExecPrimitive, ShellTarget, SshShell};

use uuid::Uuid;
use vf_infra::types::DeploymentStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{target} is not ready (deployment is {status})")]
    NotReady {
        target: String,
        status: DeploymentStatus,
    },

    #[error("{target}: remote shell execution is not supported on {os}")]
    Unsupported { target: String, os: &'static str },

    #[error("{0} has no reachable address")]
    NoAddress(String),

    #[error("authentication rejected by {target}: {output}")]
    AuthFailure { target: String, output: String },

    #[error("`{command}` on {target} failed after {attempts} attempts ({:?})", last.exit)]
    RetriesExhausted {
        command: String,
        target: String,
        attempts: u32,
        last: Box<ExecutionResult>,
    },

    #[error("failed to spawn remote shell: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no such job: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} still running after wait limit")]
    WaitExpired(Uuid),

    #[error("execution worker for {0} stopped without a result")]
    WorkerPanicked(String),

    #[error(transparent)]
    Config(#[from] vf_infra::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
