//! Post-agent checks on a sandbox.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use git2::Repository;
use tokio::process::Command;

use super::agent::{OUTPUT_TAIL_LINES, tail};
use crate::errors::OrchestratorError;

fn failed(diagnostics: impl Into<String>) -> OrchestratorError {
    OrchestratorError::ValidationFailed {
        diagnostics: diagnostics.into(),
    }
}

/// Checks that the index has no conflicts, then runs each configured
/// command through `sh -c` in the sandbox. The first failure wins.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    commands: Vec<String>,
}

impl Validator {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    pub async fn validate(&self, workdir: &Path) -> Result<(), OrchestratorError> {
        let dir: PathBuf = workdir.to_path_buf();
        let conflicts = tokio::task::spawn_blocking(move || -> Result<Vec<String>, git2::Error> {
            let repo = Repository::open(&dir)?;
            let index = repo.index()?;
            if !index.has_conflicts() {
                return Ok(Vec::new());
            }
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            Ok(paths)
        })
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| failed(format!("Failed to inspect sandbox index: {}", e.message())))?;
        if !conflicts.is_empty() {
            return Err(failed(format!(
                "Unresolved merge conflicts: {}",
                conflicts.join(", ")
            )));
        }

        for command in &self.commands {
            self.run_command(command, workdir).await?;
        }
        Ok(())
    }

    async fn run_command(&self, command: &str, workdir: &Path) -> Result<(), OrchestratorError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failed(format!("Failed to run `{}`: {}", command, e)))?;

        if output.status.success() {
            tracing::debug!(command, "Validation command passed");
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(failed(format!(
            "`{}` exited with {}:\n{}",
            command,
            code,
            tail(&combined, OUTPUT_TAIL_LINES)
        )))
    }
}
