use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("cannot read run plan {}: {source}", path.display())]
    ReadPlan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid run plan {}: {source}", path.display())]
    ParsePlan {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("infra error: {0}")]
    Infra(#[from] vf_infra::Error),

    #[error("exec error: {0}")]
    Exec(#[from] vf_exec::Error),

    #[error("{0}")]
    Fleet(#[from] vf_core::Error),
}

pub type Result<T> = std::result::Result<T, RunError>;
