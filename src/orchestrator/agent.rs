//! Agent invocation.
//!
//! The agent is opaque: it gets the job prompt and a working directory and
//! reports an exit status. Timeouts are enforced by the caller by dropping
//! the future, so implementations must not leave work running on drop.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dispatch_common::Job;
use tokio::process::Command;

use crate::config::AgentConfig;

/// Lines of output kept for error messages.
pub const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl AgentOutput {
    /// Most useful output for a failure message: stderr, else stdout.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail(text, OUTPUT_TAIL_LINES)
    }
}

pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, job: &Job, workdir: &Path) -> Result<AgentOutput>;
}

/// Runs an external command with the job prompt as its last argument.
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.command, config.args.clone())
    }
}

/// SIGKILLs the agent's process group on drop, so a cancelled or timed-out
/// run takes every descendant down with it.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) takes plain integers and touches no memory.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, error = %err, "Failed to kill agent process group");
                }
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn run(&self, job: &Job, workdir: &Path) -> Result<AgentOutput> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg(job.payload.prompt())
            .current_dir(workdir)
            .env("DISPATCH_JOB_ID", job.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn agent '{}'", self.command))?;
        let _group = ProcessGroup {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        };

        tracing::debug!(job_id = %job.id, command = %self.command, "Agent started");
        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent")?;

        Ok(AgentOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
