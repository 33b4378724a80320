//! Sentinel framing over a text shell.
//!
//! The remote command runs from an uploaded script; the invocation line
//! always echoes `<token>-<exit code>` afterwards, so "the channel closed
//! without a result" is distinguishable from "the command failed". Background
//! invocations print a ready marker first.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use vf_infra::types::GuestOsFamily;

/// ssh and sshpass output when the login itself was rejected. Only
/// meaningful when no exit sentinel came back: a command that ran may print
/// the same words.
const LOGIN_REJECTED_PATTERNS: &[&str] = &[
    "Permission denied (publickey",
    "Permission denied, please try again",
    "Authentication failed",
    "Access denied",
    "Too many authentication failures",
];

/// sudo refusing the password fed to it.
const SUDO_REJECTED: &str = "incorrect password attempt";

const SUDO_PROMPT: &str = "[sudo] password for";

/// Command syntax family of the remote shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellFlavor {
    /// bash, GNU coreutils, `sudo -S -p ''`.
    Posix,
    /// Plain `sh` with a reduced userland; no bash, BSD tools, and sudo
    /// prompts cannot be silenced.
    Minimal,
}

impl ShellFlavor {
    pub fn for_os(os: GuestOsFamily) -> Self {
        match os {
            GuestOsFamily::FreeBsd => Self::Minimal,
            GuestOsFamily::Linux | GuestOsFamily::Windows => Self::Posix,
        }
    }

    fn interpreter(&self) -> &'static str {
        match self {
            Self::Posix => "bash",
            Self::Minimal => "sh",
        }
    }

    fn base64_decode(&self) -> &'static str {
        match self {
            Self::Posix => "base64 -d",
            Self::Minimal => "b64decode -r",
        }
    }

    fn elevate(&self, password: Option<&str>) -> String {
        match (self, password) {
            (Self::Posix, Some(pw)) => format!("echo {} | sudo -S -p '' ", shell_quote(pw)),
            (Self::Minimal, Some(pw)) => format!("echo {} | sudo -S ", shell_quote(pw)),
            (_, None) => "sudo -n ".to_string(),
        }
    }
}

/// Single-quote a value for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Exit code and cleaned output recovered from a sentinel-framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub code: i32,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct SentinelProtocol {
    token: String,
    ready: String,
}

impl Default for SentinelProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelProtocol {
    pub fn new() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            token: format!("VF-EXIT-{id}"),
            ready: format!("VF-READY-{id}"),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ready_marker(&self) -> &str {
        &self.ready
    }

    /// Remote path of the script holding `command`. Identical commands map
    /// to the same path.
    pub fn script_path(dir: &str, command: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(command.as_bytes()));
        format!("{}/vf-{}.sh", dir.trim_end_matches('/'), &digest[..16])
    }

    /// Shell line writing `content` to `path` without needing stdin.
    pub fn write_file_line(flavor: ShellFlavor, content: &[u8], path: &str) -> String {
        format!(
            "printf '%s' {} | {} > {}",
            shell_quote(&STANDARD.encode(content)),
            flavor.base64_decode(),
            shell_quote(path),
        )
    }

    /// Framed line that writes a file and reports the result.
    pub fn upload_line(&self, flavor: ShellFlavor, content: &[u8], path: &str) -> String {
        format!(
            "{}; echo {}-$?",
            Self::write_file_line(flavor, content, path),
            self.token
        )
    }

    /// Framed line that runs an uploaded script.
    pub fn invocation(
        &self,
        flavor: ShellFlavor,
        script: &str,
        elevation: Option<Option<&str>>,
        background: bool,
    ) -> String {
        let prefix = match elevation {
            Some(password) => flavor.elevate(password),
            None => String::new(),
        };
        let run = format!(
            "{prefix}{} {}; echo {}-$?",
            flavor.interpreter(),
            shell_quote(script),
            self.token
        );
        if background {
            format!("echo {}; {run}", self.ready)
        } else {
            run
        }
    }

    pub fn is_ready_line(&self, line: &str) -> bool {
        line.trim_end_matches('\r').trim() == self.ready
    }

    /// Recover the exit code and strip protocol lines. `None` when the
    /// sentinel never arrived.
    pub fn parse(&self, stdout: &str) -> Option<Framed> {
        let mut code = None;
        let mut kept: Vec<&str> = Vec::new();

        for raw in stdout.lines() {
            let line = raw.trim_end_matches('\r');
            if self.is_ready_line(line) {
                continue;
            }
            match line.find(&self.token) {
                Some(idx) => {
                    let rest = &line[idx + self.token.len()..];
                    if let Some(parsed) = rest
                        .strip_prefix('-')
                        .and_then(|digits| digits.trim().parse::<i32>().ok())
                    {
                        code = Some(parsed);
                    }
                    // output without a trailing newline shares the sentinel's line
                    if idx > 0 {
                        kept.push(&line[..idx]);
                    }
                }
                None => kept.push(line),
            }
        }

        code.map(|code| Framed {
            code,
            output: filter_sudo_prompt(&kept.join("\n")),
        })
    }
}

/// The remote shell never started because the login was rejected.
pub fn is_auth_failure(text: &str) -> bool {
    LOGIN_REJECTED_PATTERNS.iter().any(|p| text.contains(p)) || is_sudo_rejection(text)
}

pub fn is_sudo_rejection(text: &str) -> bool {
    text.contains(SUDO_REJECTED)
}

/// Drop sudo password prompts that leak into captured output.
pub fn filter_sudo_prompt(text: &str) -> String {
    text.lines()
        .map(|line| match line.find(SUDO_PROMPT) {
            Some(idx) => match line[idx..].find(':') {
                Some(colon) => format!("{}{}", &line[..idx], line[idx + colon + 1..].trim_start()),
                None => line[..idx].to_string(),
            },
            None => line.to_string(),
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
