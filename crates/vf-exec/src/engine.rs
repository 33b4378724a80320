use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};
use vf_infra::env_or;
use vf_infra::types::{GuestOsFamily, VmEndpoint};

use crate::jobs::{JobHandle, JobRegistry, JobStatus};
use crate::protocol::{self, SentinelProtocol, ShellFlavor};
use crate::retry::{AttemptMode, Decision, RetryPolicy};
use crate::shell::{Credentials, OutputChunk, ShellExecPrimitive, ShellTarget, SpawnedShell};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub command: String,
    pub target: VmEndpoint,
    pub credentials: Credentials,
    pub mode: ExecMode,
    pub max_duration: Duration,
    pub elevated: bool,
    pub ignore_exit_code: bool,
}

impl ExecutionRequest {
    pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

    pub fn new(command: impl Into<String>, target: VmEndpoint, credentials: Credentials) -> Self {
        Self {
            command: command.into(),
            target,
            credentials,
            mode: ExecMode::Foreground,
            max_duration: Self::DEFAULT_MAX_DURATION,
            elevated: false,
            ignore_exit_code: false,
        }
    }

    pub fn in_background(mut self) -> Self {
        self.mode = ExecMode::Background;
        self
    }

    pub fn with_elevation(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn allow_nonzero_exit(mut self) -> Self {
        self.ignore_exit_code = true;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    CommandFailed(i32),
    Timeout,
    AuthFailure,
    ChannelFailure,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit: ExitClass,
    pub stdout: String,
    pub stderr: String,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Set for background executions.
    pub job: Option<JobHandle>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit == ExitClass::Success
    }
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Attempts spent in each pty mode before giving up.
    pub attempts_per_mode: u32,
    /// How long a background shell has to print its ready marker.
    pub ready_window: Duration,
    pub retry_delay: Duration,
    /// Upload bound; uploads never exceed the request's own limit.
    pub upload_timeout: Duration,
    /// Remote directory receiving command scripts.
    pub script_dir: String,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            attempts_per_mode: 3,
            ready_window: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(120),
            script_dir: "/tmp".into(),
        }
    }
}

impl ExecConfig {
    /// Load from env vars, falling back to defaults:
    ///
    /// - `FLEET_EXEC_ATTEMPTS_PER_MODE` (3)
    /// - `FLEET_EXEC_READY_WINDOW_SECS` (30)
    /// - `FLEET_EXEC_RETRY_DELAY_SECS` (5)
    /// - `FLEET_EXEC_UPLOAD_TIMEOUT_SECS` (120)
    /// - `FLEET_EXEC_SCRIPT_DIR` (`/tmp`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();
        Ok(Self {
            attempts_per_mode: env_or("FLEET_EXEC_ATTEMPTS_PER_MODE", d.attempts_per_mode)?,
            ready_window: Duration::from_secs(env_or(
                "FLEET_EXEC_READY_WINDOW_SECS",
                d.ready_window.as_secs(),
            )?),
            retry_delay: Duration::from_secs(env_or(
                "FLEET_EXEC_RETRY_DELAY_SECS",
                d.retry_delay.as_secs(),
            )?),
            upload_timeout: Duration::from_secs(env_or(
                "FLEET_EXEC_UPLOAD_TIMEOUT_SECS",
                d.upload_timeout.as_secs(),
            )?),
            script_dir: env_or("FLEET_EXEC_SCRIPT_DIR", d.script_dir)?,
        })
    }

    /// Longest a request limited to `max_duration` can take across the whole
    /// retry budget. Every attempt may re-upload its script, run for the full
    /// duration and then sleep out the retry delay.
    pub fn request_ceiling(&self, max_duration: Duration) -> Duration {
        let per_attempt = max_duration + self.upload_timeout.min(max_duration) + self.retry_delay;
        per_attempt * (self.attempts_per_mode * 2)
    }
}

/// Last payload written, keyed by everything that determines its location.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UploadKey {
    command: String,
    address: String,
    port: u16,
    user: String,
}

/// What one shell process produced.
#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<String>,
    stderr: Vec<String>,
    status: Option<i32>,
    timed_out: bool,
    cancelled: bool,
}

struct Attempt {
    exit: ExitClass,
    stdout: String,
    stderr: String,
    job: Option<JobHandle>,
}

/// Runs commands on fleet members through a [`ShellExecPrimitive`].
pub struct RemoteExecutionEngine {
    shell: Arc<dyn ShellExecPrimitive>,
    protocol: SentinelProtocol,
    config: ExecConfig,
    jobs: JobRegistry,
    last_upload: Mutex<Option<UploadKey>>,
    flavors: Mutex<HashMap<ShellTarget, ShellFlavor>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteExecutionEngine {
    pub fn new(shell: Arc<dyn ShellExecPrimitive>, config: ExecConfig) -> Self {
        Self {
            shell,
            protocol: SentinelProtocol::new(),
            config,
            jobs: JobRegistry::new(),
            last_upload: Mutex::new(None),
            flavors: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Drop the upload memo, e.g. after members rebooted and `/tmp` was wiped.
    pub fn forget_uploads(&self) {
        guard(&self.last_upload).take();
    }

    /// Override the shell flavor used for a target.
    pub fn set_flavor(&self, target: &VmEndpoint, flavor: ShellFlavor) {
        if let Ok(key) = Self::shell_target(target) {
            guard(&self.flavors).insert(key, flavor);
        }
    }

    pub fn flavor_for(&self, target: &VmEndpoint) -> ShellFlavor {
        Self::shell_target(target)
            .ok()
            .and_then(|key| guard(&self.flavors).get(&key).copied())
            .unwrap_or_else(|| ShellFlavor::for_os(target.os))
    }

    fn shell_target(target: &VmEndpoint) -> Result<ShellTarget> {
        let address = target
            .address()
            .ok_or_else(|| Error::NoAddress(target.name.clone()))?;
        Ok(ShellTarget {
            address: address.to_string(),
            port: target.management_port,
        })
    }

    fn check_preconditions(target: &VmEndpoint) -> Result<ShellTarget> {
        if !target.is_live() {
            return Err(Error::NotReady {
                target: target.name.clone(),
                status: target.deployment.status(),
            });
        }
        if target.os == GuestOsFamily::Windows {
            return Err(Error::Unsupported {
                target: target.name.clone(),
                os: target.os.as_str(),
            });
        }
        Self::shell_target(target)
    }

    /// Run one request under the two-phase retry budget.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionResult> {
        let target = Self::check_preconditions(&req.target)?;
        let label = req.target.display_target();
        let flavor = self.flavor_for(&req.target);
        let script = SentinelProtocol::script_path(&self.config.script_dir, &req.command);
        let started = Instant::now();

        let mut state = RetryPolicy::new(req.elevated, self.config.attempts_per_mode).start();
        info!(host = %label, command = %req.command, mode = ?req.mode, elevated = req.elevated, "executing remote command");

        loop {
            let attempt = self
                .attempt(req, &target, flavor, &script, state.mode())
                .await?;

            let result = ExecutionResult {
                exit: attempt.exit,
                stdout: attempt.stdout,
                stderr: attempt.stderr,
                attempts: state.attempts() + 1,
                elapsed: started.elapsed(),
                job: attempt.job,
            };

            match state.record(&result.exit) {
                Decision::Finish => {
                    debug!(host = %label, exit = ?result.exit, attempts = result.attempts, "remote command finished");
                    return Ok(result);
                }
                Decision::Abort => {
                    warn!(host = %label, "credentials rejected, not retrying");
                    let output = if result.stderr.is_empty() {
                        result.stdout
                    } else {
                        result.stderr
                    };
                    return Err(Error::AuthFailure {
                        target: label,
                        output,
                    });
                }
                Decision::Retry(mode) => {
                    warn!(host = %label, exit = ?result.exit, attempt = result.attempts, next_mode = ?mode, "remote command attempt failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Decision::Exhausted => {
                    warn!(host = %label, command = %req.command, attempts = result.attempts, "remote command retries exhausted");
                    return Err(Error::RetriesExhausted {
                        command: req.command.clone(),
                        target: label,
                        attempts: result.attempts,
                        last: Box::new(result),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        req: &ExecutionRequest,
        target: &ShellTarget,
        flavor: ShellFlavor,
        script: &str,
        mode: AttemptMode,
    ) -> Result<Attempt> {
        if let Some(failed) = self.upload_script(req, target, flavor, script, mode).await? {
            return Ok(failed);
        }

        let elevation = req.elevated.then(|| req.credentials.password.as_deref());
        let background = req.mode == ExecMode::Background;
        let line = self
            .protocol
            .invocation(flavor, script, elevation, background);

        let shell = self
            .shell
            .spawn(target, &req.credentials, &line, mode.pty())
            .await?;

        match req.mode {
            ExecMode::Foreground => {
                let captured = self
                    .run_to_completion(shell, req.max_duration, req.target.display_target())
                    .await?;
                Ok(self.classify(captured, req.ignore_exit_code, req.elevated))
            }
            ExecMode::Background => self.start_background(shell, req).await,
        }
    }

    /// Write the command script unless the same payload was just written to
    /// the same target. Returns the failed attempt when the write did not
    /// succeed.
    async fn upload_script(
        &self,
        req: &ExecutionRequest,
        target: &ShellTarget,
        flavor: ShellFlavor,
        script: &str,
        mode: AttemptMode,
    ) -> Result<Option<Attempt>> {
        let key = UploadKey {
            command: req.command.clone(),
            address: target.address.clone(),
            port: target.port,
            user: req.credentials.user.clone(),
        };
        if guard(&self.last_upload).as_ref() == Some(&key) {
            debug!(host = %req.target.display_target(), script, "payload already uploaded");
            return Ok(None);
        }

        let line = self
            .protocol
            .upload_line(flavor, req.command.as_bytes(), script);
        let shell = self
            .shell
            .spawn(target, &req.credentials, &line, mode.pty())
            .await?;
        let limit = self.config.upload_timeout.min(req.max_duration);
        let captured = self
            .run_to_completion(shell, limit, req.target.display_target())
            .await?;

        let mut attempt = self.classify(captured, false, false);
        match attempt.exit {
            ExitClass::Success => {
                *guard(&self.last_upload) = Some(key);
                Ok(None)
            }
            ExitClass::CommandFailed(code) => {
                warn!(host = %req.target.display_target(), code, stderr = %attempt.stderr, "payload upload failed");
                attempt.exit = ExitClass::ChannelFailure;
                Ok(Some(attempt))
            }
            _ => Ok(Some(attempt)),
        }
    }

    /// Drive a shell to completion on its own task and collect the result.
    async fn run_to_completion(
        &self,
        shell: SpawnedShell,
        max: Duration,
        label: String,
    ) -> Result<Captured> {
        let (tx, rx) = oneshot::channel();
        let worker_label = label.clone();
        tokio::spawn(async move {
            let captured = drive(shell, Instant::now() + max, None, Vec::new(), &worker_label).await;
            let _ = tx.send(captured);
        });
        rx.await.map_err(|_| Error::WorkerPanicked(label))
    }

    async fn start_background(&self, mut shell: SpawnedShell, req: &ExecutionRequest) -> Result<Attempt> {
        let label = req.target.display_target();
        let ready_deadline = Instant::now() + self.config.ready_window.min(req.max_duration);
        let mut early = Captured::default();

        let ready = loop {
            tokio::select! {
                chunk = shell.output.recv() => match chunk {
                    Some(OutputChunk::Stdout(line)) if self.protocol.is_ready_line(&line) => break true,
                    Some(OutputChunk::Stdout(line)) => early.stdout.push(line),
                    Some(OutputChunk::Stderr(line)) => early.stderr.push(line),
                    None => break false,
                },
                _ = sleep_until(ready_deadline) => break false,
            }
        };

        if !ready {
            if let Err(e) = shell.control.kill().await {
                debug!(host = %label, error = %e, "kill after missing ready marker");
            }
            let stderr = early.stderr.join("\n");
            let stdout = early.stdout.join("\n");
            let exit = if protocol::is_auth_failure(&stderr) || protocol::is_auth_failure(&stdout) {
                ExitClass::AuthFailure
            } else {
                ExitClass::ChannelFailure
            };
            warn!(host = %label, "background shell never reported ready");
            return Ok(Attempt {
                exit,
                stdout,
                stderr,
                job: None,
            });
        }

        let job = JobHandle::new(label.clone(), req.command.clone());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.jobs.register(job.clone(), cancel_tx);
        info!(host = %label, job = %job.id, "background command started");

        let early_stderr = early.stderr.join("\n");
        let early_stdout = std::mem::take(&mut early.stdout);
        let registry = self.jobs.clone();
        let sentinel = self.protocol.clone();
        let ignore_exit_code = req.ignore_exit_code;
        let elevated = req.elevated;
        let deadline = Instant::now() + req.max_duration;
        let id = job.id;
        let started = Instant::now();
        tokio::spawn(async move {
            let captured = drive(shell, deadline, Some(cancel_rx), early_stdout, &label).await;
            if captured.cancelled {
                registry.complete(id, JobStatus::Cancelled);
                return;
            }
            let attempt = classify_captured(&sentinel, captured, ignore_exit_code, elevated);
            info!(host = %label, job = %id, exit = ?attempt.exit, "background command ended");
            registry.complete(
                id,
                JobStatus::Finished(ExecutionResult {
                    exit: attempt.exit,
                    stdout: attempt.stdout,
                    stderr: attempt.stderr,
                    attempts: 1,
                    elapsed: started.elapsed(),
                    job: None,
                }),
            );
        });

        Ok(Attempt {
            exit: ExitClass::Success,
            stdout: String::new(),
            stderr: early_stderr,
            job: Some(job),
        })
    }

    fn classify(&self, captured: Captured, ignore_exit_code: bool, elevated: bool) -> Attempt {
        classify_captured(&self.protocol, captured, ignore_exit_code, elevated)
    }

    /// Run `uname -s` and remember the matching shell flavor for the target.
    pub async fn detect_guest_os(
        &self,
        target: &VmEndpoint,
        credentials: &Credentials,
    ) -> Result<GuestOsFamily> {
        let req = ExecutionRequest::new("uname -s", target.clone(), credentials.clone())
            .with_max_duration(Duration::from_secs(60));
        let result = self.execute(&req).await?;

        let os = match result.exit {
            ExitClass::Success => GuestOsFamily::from_uname(&result.stdout),
            _ => None,
        };
        let os = os.unwrap_or_else(|| {
            warn!(host = %target.display_target(), output = %result.stdout, "unrecognized guest os, assuming linux");
            GuestOsFamily::Linux
        });

        self.set_flavor(target, ShellFlavor::for_os(os));
        info!(host = %target.display_target(), os = os.as_str(), "guest os detected");
        Ok(os)
    }
}

/// With a sentinel the command ran, so its output is the command's own and
/// only a rejected sudo password counts as an auth failure. Without one,
/// login rejection text decides between auth and channel failure.
fn classify_captured(
    sentinel: &SentinelProtocol,
    captured: Captured,
    ignore_exit_code: bool,
    elevated: bool,
) -> Attempt {
    let raw_stdout = captured.stdout.join("\n");
    let stderr = protocol::filter_sudo_prompt(&captured.stderr.join("\n"));

    if captured.timed_out {
        return Attempt {
            exit: ExitClass::Timeout,
            stdout: protocol::filter_sudo_prompt(&raw_stdout),
            stderr,
            job: None,
        };
    }

    match sentinel.parse(&raw_stdout) {
        Some(framed) => {
            let sudo_rejected = elevated
                && (protocol::is_sudo_rejection(&stderr) || protocol::is_sudo_rejection(&raw_stdout));
            let exit = match framed.code {
                0 => ExitClass::Success,
                _ if ignore_exit_code => ExitClass::Success,
                _ if sudo_rejected => ExitClass::AuthFailure,
                code => ExitClass::CommandFailed(code),
            };
            Attempt {
                exit,
                stdout: framed.output,
                stderr,
                job: None,
            }
        }
        None => {
            let auth_rejected =
                protocol::is_auth_failure(&stderr) || protocol::is_auth_failure(&raw_stdout);
            debug!(shell_status = ?captured.status, "no exit sentinel in remote output");
            Attempt {
                exit: if auth_rejected {
                    ExitClass::AuthFailure
                } else {
                    ExitClass::ChannelFailure
                },
                stdout: protocol::filter_sudo_prompt(&raw_stdout),
                stderr,
                job: None,
            }
        }
    }
}

/// Collect output until the shell closes, the deadline passes or a cancel
/// arrives. Expiry and cancellation kill the process.
async fn drive(
    mut shell: SpawnedShell,
    deadline: Instant,
    cancel: Option<oneshot::Receiver<()>>,
    stdout: Vec<String>,
    label: &str,
) -> Captured {
    let started = Instant::now();
    let mut captured = Captured {
        stdout,
        ..Captured::default()
    };

    let cancelled = async move {
        match cancel {
            // a dropped sender is not a cancellation
            Some(rx) => {
                if rx.await.is_err() {
                    std::future::pending::<()>().await
                }
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            chunk = shell.output.recv() => match chunk {
                Some(OutputChunk::Stdout(line)) => {
                    debug!(host = label, elapsed_secs = started.elapsed().as_secs(), line = %line, "remote output");
                    captured.stdout.push(line);
                }
                Some(OutputChunk::Stderr(line)) => captured.stderr.push(line),
                None => break,
            },
            _ = sleep_until(deadline) => {
                warn!(host = label, elapsed_secs = started.elapsed().as_secs(), "remote command exceeded its time limit, killing");
                kill(&mut shell, label).await;
                captured.timed_out = true;
                return captured;
            }
            _ = &mut cancelled => {
                kill(&mut shell, label).await;
                captured.cancelled = true;
                return captured;
            }
        }
    }

    match timeout_at(deadline, shell.control.wait()).await {
        Ok(Ok(status)) => captured.status = status,
        Ok(Err(e)) => warn!(host = label, error = %e, "failed to reap remote shell"),
        Err(_) => {
            kill(&mut shell, label).await;
            captured.timed_out = true;
        }
    }
    captured
}

async fn kill(shell: &mut SpawnedShell, label: &str) {
    let pid = shell.control.pid();
    if let Err(e) = shell.control.kill().await {
        warn!(host = label, ?pid, error = %e, "failed to kill remote shell");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{Notify, mpsc};
    use vf_infra::types::{DeploymentHandle, DeploymentStatus, MemberRecord, PowerState};

    use crate::shell::ProcessControl;

    /// Scripted behavior of one invocation.
    #[derive(Debug, Clone)]
    enum Behavior {
        Exit(i32, &'static str),
        /// Shell closes without ever printing the sentinel.
        Drop,
        /// Rejected login: stderr noise and no sentinel.
        Auth,
        /// Never finishes until killed.
        Hang,
    }

    #[derive(Default)]
    struct FakeShell {
        script: Mutex<VecDeque<Behavior>>,
        lines: Mutex<Vec<(String, bool)>>,
        uploads: AtomicUsize,
        invocations: AtomicUsize,
        kills: Arc<AtomicUsize>,
    }

    impl FakeShell {
        fn with(script: impl IntoIterator<Item = Behavior>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            })
        }

        fn idle() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn ptys(&self) -> Vec<bool> {
            guard(&self.lines)
                .iter()
                .filter(|(l, _)| !l.starts_with("printf"))
                .map(|(_, pty)| *pty)
                .collect()
        }

        fn invocation_lines(&self) -> Vec<String> {
            guard(&self.lines)
                .iter()
                .filter(|(l, _)| !l.starts_with("printf"))
                .map(|(l, _)| l.clone())
                .collect()
        }
    }

    struct FakeControl {
        exit: Option<i32>,
        hang: Option<mpsc::Sender<OutputChunk>>,
        killed: Arc<Notify>,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProcessControl for FakeControl {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            if self.hang.is_some() {
                self.killed.notified().await;
                return Ok(None);
            }
            Ok(self.exit)
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.hang = None;
            self.killed.notify_one();
            Ok(())
        }
    }

    fn token_of(line: &str) -> String {
        let start = line.find("VF-EXIT-").unwrap();
        let end = line[start..].find("-$?").unwrap();
        line[start..start + end].to_string()
    }

    fn ready_of(line: &str) -> Option<String> {
        line.strip_prefix("echo ")
            .and_then(|rest| rest.split(';').next())
            .filter(|m| m.starts_with("VF-READY-"))
            .map(str::to_string)
    }

    #[async_trait]
    impl ShellExecPrimitive for FakeShell {
        async fn spawn(
            &self,
            _target: &ShellTarget,
            _credentials: &Credentials,
            command_line: &str,
            pty: bool,
        ) -> io::Result<SpawnedShell> {
            guard(&self.lines).push((command_line.to_string(), pty));
            let token = token_of(command_line);
            let (tx, rx) = mpsc::channel(16);

            let behavior = if command_line.starts_with("printf") {
                self.uploads.fetch_add(1, Ordering::SeqCst);
                Behavior::Exit(0, "")
            } else {
                self.invocations.fetch_add(1, Ordering::SeqCst);
                if let Some(ready) = ready_of(command_line) {
                    tx.send(OutputChunk::Stdout(ready)).await.unwrap();
                }
                guard(&self.script)
                    .pop_front()
                    .unwrap_or(Behavior::Exit(0, ""))
            };

            let mut control = FakeControl {
                exit: None,
                hang: None,
                killed: Arc::new(Notify::new()),
                kills: Arc::clone(&self.kills),
            };
            match behavior {
                Behavior::Exit(code, out) => {
                    if !out.is_empty() {
                        tx.send(OutputChunk::Stdout(out.into())).await.unwrap();
                    }
                    tx.send(OutputChunk::Stdout(format!("{token}-{code}")))
                        .await
                        .unwrap();
                    control.exit = Some(code);
                }
                Behavior::Drop => control.exit = Some(255),
                Behavior::Auth => {
                    tx.send(OutputChunk::Stderr(
                        "tester@10.0.0.4: Permission denied (publickey,password).".into(),
                    ))
                    .await
                    .unwrap();
                    control.exit = Some(255);
                }
                Behavior::Hang => control.hang = Some(tx.clone()),
            }
            drop(tx);

            Ok(SpawnedShell {
                output: rx,
                control: Box::new(control),
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn config() -> ExecConfig {
        ExecConfig {
            retry_delay: Duration::ZERO,
            ..ExecConfig::default()
        }
    }

    fn endpoint(os: GuestOsFamily, ready: bool) -> (DeploymentHandle, VmEndpoint) {
        let handle = DeploymentHandle::new("rg-test", "westus2", 0);
        if ready {
            handle.advance(DeploymentStatus::Provisioning).unwrap();
            handle.advance(DeploymentStatus::Verifying).unwrap();
            handle.advance(DeploymentStatus::Ready).unwrap();
        }
        let endpoint = MemberRecord {
            name: "vm0".into(),
            role: "client".into(),
            public_address: Some("10.0.0.4".into()),
            internal_address: None,
            os,
            ports: Default::default(),
            power: PowerState::Running,
        }
        .bind(handle.deployment_ref());
        (handle, endpoint)
    }

    fn creds() -> Credentials {
        Credentials {
            user: "tester".into(),
            password: Some("pw".into()),
            private_key: None,
        }
    }

    #[test]
    fn request_ceiling_covers_uploads_on_every_attempt() {
        let config = ExecConfig::default();
        // (30 run + 30 upload + 5 delay) * 6 attempts
        assert_eq!(config.request_ceiling(Duration::from_secs(30)), Duration::from_secs(390));
        // upload capped at its own bound
        assert_eq!(config.request_ceiling(Duration::from_secs(600)), Duration::from_secs(4350));

        let single = ExecConfig {
            attempts_per_mode: 1,
            retry_delay: Duration::ZERO,
            ..ExecConfig::default()
        };
        assert_eq!(single.request_ceiling(Duration::from_secs(10)), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn success_returns_output_without_sentinel() {
        let shell = FakeShell::with([Behavior::Exit(0, "hello")]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let result = engine
            .execute(&ExecutionRequest::new("echo hello", ep, creds()))
            .await
            .unwrap();
        assert_eq!(result.exit, ExitClass::Success);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.attempts, 1);
        assert!(!result.stdout.contains("VF-EXIT"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_unless_ignored() {
        let shell = FakeShell::with([Behavior::Exit(7, "partial"), Behavior::Exit(7, "partial")]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let failed = engine
            .execute(&ExecutionRequest::new("false", ep.clone(), creds()))
            .await
            .unwrap();
        assert_eq!(failed.exit, ExitClass::CommandFailed(7));
        assert_eq!(failed.attempts, 1);

        let ignored = engine
            .execute(&ExecutionRequest::new("false", ep, creds()).allow_nonzero_exit())
            .await
            .unwrap();
        assert_eq!(ignored.exit, ExitClass::Success);
        assert_eq!(ignored.stdout, "partial");
    }

    #[tokio::test]
    async fn endpoint_not_ready_fails_before_any_spawn() {
        let shell = FakeShell::idle();
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, false);

        let err = engine
            .execute(&ExecutionRequest::new("uptime", ep, creds()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotReady {
                status: DeploymentStatus::Pending,
                ..
            }
        ));
        assert!(guard(&shell.lines).is_empty());
    }

    #[tokio::test]
    async fn auth_failure_makes_exactly_one_attempt() {
        let shell = FakeShell::with([Behavior::Auth, Behavior::Exit(0, "")]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let err = engine
            .execute(&ExecutionRequest::new("uptime", ep, creds()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure { ref output, .. } if output.contains("Permission denied")));
        assert_eq!(shell.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_sudo_password_is_auth_failure_only_when_elevated() {
        let rejected = "sudo: 3 incorrect password attempts";
        let shell = FakeShell::with([Behavior::Exit(1, rejected), Behavior::Exit(1, rejected)]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let err = engine
            .execute(&ExecutionRequest::new("reboot", ep.clone(), creds()).with_elevation())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure { .. }));

        let plain = engine
            .execute(&ExecutionRequest::new("cat /var/log/auth.log", ep, creds()))
            .await
            .unwrap();
        assert_eq!(plain.exit, ExitClass::CommandFailed(1));
    }

    #[tokio::test]
    async fn channel_failures_fall_back_to_other_pty_mode() {
        let shell = FakeShell::with([
            Behavior::Drop,
            Behavior::Drop,
            Behavior::Drop,
            Behavior::Exit(0, "ok"),
        ]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let result = engine
            .execute(&ExecutionRequest::new("reboot-check", ep, creds()).with_elevation())
            .await
            .unwrap();
        assert_eq!(result.exit, ExitClass::Success);
        assert_eq!(result.attempts, 4);
        assert_eq!(shell.ptys(), vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn exhausted_budget_names_command_and_target() {
        let shell = FakeShell::with(std::iter::repeat_n(Behavior::Drop, 6));
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let err = engine
            .execute(&ExecutionRequest::new("uptime", ep, creds()))
            .await
            .unwrap_err();
        match err {
            Error::RetriesExhausted {
                command,
                target,
                attempts,
                last,
            } => {
                assert_eq!(command, "uptime");
                assert_eq!(target, "10.0.0.4:22");
                assert_eq!(attempts, 6);
                assert_eq!(last.exit, ExitClass::ChannelFailure);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(shell.invocations.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_command_times_out_and_is_killed() {
        let shell = FakeShell::with([Behavior::Hang, Behavior::Hang]);
        let engine = RemoteExecutionEngine::new(
            shell.clone(),
            ExecConfig {
                attempts_per_mode: 1,
                ..config()
            },
        );
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let err = engine
            .execute(&ExecutionRequest::new("sleep 999", ep, creds()).with_max_duration(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { ref last, attempts: 2, .. } if last.exit == ExitClass::Timeout));
        assert_eq!(shell.kills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_payload_is_uploaded_once() {
        let shell = FakeShell::idle();
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);
        let run = |cmd: &'static str| ExecutionRequest::new(cmd, ep.clone(), creds());

        engine.execute(&run("uptime")).await.unwrap();
        engine.execute(&run("uptime")).await.unwrap();
        assert_eq!(shell.uploads.load(Ordering::SeqCst), 1);

        engine.execute(&run("uname -a")).await.unwrap();
        assert_eq!(shell.uploads.load(Ordering::SeqCst), 2);

        engine.forget_uploads();
        engine.execute(&run("uname -a")).await.unwrap();
        assert_eq!(shell.uploads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn minimal_shell_uses_sh_and_plain_sudo() {
        let shell = FakeShell::idle();
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::FreeBsd, true);

        engine
            .execute(&ExecutionRequest::new("pkg info", ep, creds()).with_elevation())
            .await
            .unwrap();

        let lines = guard(&shell.lines).clone();
        assert!(lines[0].0.contains("b64decode -r"));
        assert!(lines[1].0.starts_with("echo 'pw' | sudo -S sh "));
        assert!(shell.invocation_lines()[0].contains("sh '/tmp/vf-"));
    }

    #[tokio::test]
    async fn windows_targets_are_rejected() {
        let shell = FakeShell::idle();
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Windows, true);

        let err = engine
            .execute(&ExecutionRequest::new("dir", ep, creds()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { os: "windows", .. }));
    }

    #[tokio::test]
    async fn background_returns_job_and_can_be_cancelled() {
        let shell = FakeShell::with([Behavior::Hang]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let result = engine
            .execute(&ExecutionRequest::new("sleep 999", ep, creds()).in_background())
            .await
            .unwrap();
        let job = result.job.expect("background job handle");
        assert!(engine.jobs().status(job.id).unwrap().is_running());

        assert!(engine.jobs().cancel(job.id).unwrap());
        let status = engine
            .jobs()
            .wait(job.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(status, JobStatus::Cancelled));
        assert_eq!(shell.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn background_job_records_final_result() {
        let shell = FakeShell::with([Behavior::Exit(3, "late")]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        let result = engine
            .execute(&ExecutionRequest::new("work", ep, creds()).in_background())
            .await
            .unwrap();
        let job = result.job.unwrap();

        let status = engine
            .jobs()
            .wait(job.id, Duration::from_secs(5))
            .await
            .unwrap();
        match status {
            JobStatus::Finished(r) => {
                assert_eq!(r.exit, ExitClass::CommandFailed(3));
                assert_eq!(r.stdout, "late");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn guest_os_detection_switches_flavor() {
        let shell = FakeShell::with([Behavior::Exit(0, "FreeBSD")]);
        let engine = RemoteExecutionEngine::new(shell.clone(), config());
        let (_h, ep) = endpoint(GuestOsFamily::Linux, true);

        assert_eq!(engine.flavor_for(&ep), ShellFlavor::Posix);
        let os = engine.detect_guest_os(&ep, &creds()).await.unwrap();
        assert_eq!(os, GuestOsFamily::FreeBsd);
        assert_eq!(engine.flavor_for(&ep), ShellFlavor::Minimal);
    }
}
