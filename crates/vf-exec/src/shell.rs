use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::Result;

/// Where a remote shell is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShellTarget {
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Handle on a spawned shell process.
#[async_trait]
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit. `None` when the process was killed by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Forcibly terminate and reap.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A running remote shell: line-oriented output plus process control.
pub struct SpawnedShell {
    pub output: mpsc::Receiver<OutputChunk>,
    pub control: Box<dyn ProcessControl>,
}

/// Opens a remote shell and runs one command line in it.
#[async_trait]
pub trait ShellExecPrimitive: Send + Sync + 'static {
    async fn spawn(
        &self,
        target: &ShellTarget,
        credentials: &Credentials,
        command_line: &str,
        pty: bool,
    ) -> io::Result<SpawnedShell>;

    fn name(&self) -> &'static str;
}

// ── Subprocess plumbing ─────────────────────────────────────────────

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

async fn forward<R>(mut lines: Lines<R>, tx: mpsc::Sender<OutputChunk>, wrap: fn(String) -> OutputChunk)
where
    R: AsyncBufRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).await.is_err() {
            break;
        }
    }
}

fn spawn_command(mut cmd: Command) -> io::Result<SpawnedShell> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let (tx, rx) = mpsc::channel(256);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward(BufReader::new(stdout).lines(), tx.clone(), OutputChunk::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward(BufReader::new(stderr).lines(), tx, OutputChunk::Stderr));
    }

    Ok(SpawnedShell {
        output: rx,
        control: Box::new(ChildControl { child }),
    })
}

// ── ssh ─────────────────────────────────────────────────────────────

/// Runs commands through the system `ssh` client. Password logins go
/// through `sshpass -e` so the secret never appears in the argument list.
#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout: Duration,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SshShell {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Create from env vars:
    ///
    /// - `FLEET_SSH_CONNECT_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Ok(Self::new(Duration::from_secs(vf_infra::env_or(
            "FLEET_SSH_CONNECT_TIMEOUT_SECS",
            30,
        )?)))
    }

    fn argv(
        &self,
        target: &ShellTarget,
        credentials: &Credentials,
        command_line: &str,
        pty: bool,
    ) -> (String, Vec<String>) {
        let mut args: Vec<String> = Vec::new();
        let program = if credentials.password.is_some() && credentials.private_key.is_none() {
            args.extend(["-e".into(), "ssh".into()]);
            "sshpass".to_string()
        } else {
            "ssh".to_string()
        };

        for opt in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".into());
            args.push(opt);
        }
        args.push("-p".into());
        args.push(target.port.to_string());
        if let Some(key) = &credentials.private_key {
            args.push("-i".into());
            args.push(key.display().to_string());
        }
        args.push(if pty { "-tt" } else { "-T" }.into());
        args.push(format!("{}@{}", credentials.user, target.address));
        args.push(command_line.to_string());

        (program, args)
    }
}

#[async_trait]
impl ShellExecPrimitive for SshShell {
    async fn spawn(
        &self,
        target: &ShellTarget,
        credentials: &Credentials,
        command_line: &str,
        pty: bool,
    ) -> io::Result<SpawnedShell> {
        let (program, args) = self.argv(target, credentials, command_line, pty);
        debug!(address = %target.address, port = target.port, pty, "ssh: opening shell");

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(password) = &credentials.password {
            cmd.env("SSHPASS", password);
        }
        spawn_command(cmd)
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

// ── local ───────────────────────────────────────────────────────────

/// Runs command lines with the local `sh`, ignoring the target. Used for
/// loopback fleets and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

#[async_trait]
impl ShellExecPrimitive for LocalShell {
    async fn spawn(
        &self,
        _target: &ShellTarget,
        _credentials: &Credentials,
        command_line: &str,
        _pty: bool,
    ) -> io::Result<SpawnedShell> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        spawn_command(cmd)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
