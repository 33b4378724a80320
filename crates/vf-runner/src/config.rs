use std::env;
use std::path::PathBuf;

use chrono::Utc;
use uuid::Uuid;
use vf_core::TeardownPolicy;
use vf_exec::Credentials;
use vf_infra::env_or;

/// Per-run settings. Cloud, orchestrator and engine knobs live with their
/// own `from_env()` constructors.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub descriptor: PathBuf,
    pub run_id: String,
    pub test_name: String,
    pub preserve: bool,
    pub force_delete: bool,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> vf_infra::Result<Self> {
        Ok(Self {
            descriptor: env::var("FLEET_DESCRIPTOR")
                .map(PathBuf::from)
                .map_err(|_| vf_infra::Error::MissingEnv("FLEET_DESCRIPTOR".into()))?,
            run_id: env::var("FLEET_RUN_ID").unwrap_or_else(|_| generate_run_id()),
            test_name: env::var("FLEET_TEST_NAME").unwrap_or_else(|_| "validation".into()),
            preserve: env_or("FLEET_PRESERVE", false)?,
            force_delete: env_or("FLEET_FORCE_DELETE", false)?,
            ssh_user: env::var("FLEET_SSH_USER").unwrap_or_else(|_| "vfadmin".into()),
            ssh_password: env::var("FLEET_SSH_PASSWORD").ok().filter(|p| !p.is_empty()),
            ssh_key: env::var("FLEET_SSH_KEY").ok().map(PathBuf::from),
        })
    }

    pub fn teardown_policy(&self) -> TeardownPolicy {
        TeardownPolicy {
            preserve: self.preserve,
            force_delete: self.force_delete,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.ssh_user.clone(),
            password: self.ssh_password.clone(),
            private_key: self.ssh_key.clone(),
        }
    }

    /// Public half of the ssh key, expected next to it as `<key>.pub`.
    pub fn public_key_path(&self) -> Option<PathBuf> {
        self.ssh_key.as_ref().map(|key| {
            let mut path = key.clone().into_os_string();
            path.push(".pub");
            PathBuf::from(path)
        })
    }
}

/// `YYYYmmddHHMMSS-xxxxxx`: sortable, and unique enough across hosts.
fn generate_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..6])
}
