use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Executes external commands. `Err` means the process could not be run at
/// all (spawn failure, timeout); a non-zero exit is an `Ok` output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program} {}", args.join(" ")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .with_context(|| format!("{program} timed out after {}s", timeout.as_secs()))?
            .with_context(|| format!("failed to wait for {program}"))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Output fragments that mean "the unprivileged path cannot do this here".
const PRIVILEGE_FALLBACK_SIGNATURES: &[&str] = &[
    "no such file",
    "not loaded",
    "not found",
    "access denied",
    "permission denied",
    "failed to connect to bus",
    "interactive authentication required",
];

pub fn needs_privileged_retry(output: &str) -> bool {
    let lower = output.to_lowercase();
    PRIVILEGE_FALLBACK_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Which path produced a [`FallbackOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Sudo,
}

#[derive(Debug, Clone)]
pub struct FallbackOutput {
    pub output: CommandOutput,
    pub privilege: Privilege,
}

/// The program is missing or may not be executed by this user. Timeouts and
/// other runner errors do not qualify.
fn spawn_denied(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            )
        })
}

/// Run `user_args` unprivileged first. Only when that attempt could not be
/// spawned (not found, permission denied), or failed with a recognized permission/not-found signature, run
/// `sudo <sudo_args>`.
pub async fn run_with_privilege_fallback(
    runner: &dyn CommandRunner,
    program: &str,
    user_args: &[&str],
    sudo_args: &[&str],
    timeout: Duration,
) -> Result<FallbackOutput> {
    match runner.run(program, user_args, timeout).await {
        Ok(out) if out.success() => {
            return Ok(FallbackOutput {
                output: out,
                privilege: Privilege::User,
            })
        }
        Ok(out) => {
            let text = out.combined_output();
            if !needs_privileged_retry(&text) {
                return Ok(FallbackOutput {
                    output: out,
                    privilege: Privilege::User,
                });
            }
            warn!(program, output = %text, "unprivileged attempt failed, retrying with sudo");
        }
        Err(e) if spawn_denied(&e) => {
            warn!(program, "unprivileged attempt could not start, retrying with sudo: {e:#}")
        }
        Err(e) => return Err(e),
    }

    let mut args = Vec::with_capacity(sudo_args.len() + 1);
    args.push(program);
    args.extend_from_slice(sudo_args);
    let output = runner.run("sudo", &args, timeout).await?;
    Ok(FallbackOutput {
        output,
        privilege: Privilege::Sudo,
    })
}
