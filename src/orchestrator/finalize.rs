//! What happens to a validated sandbox before it is torn down.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use dispatch_common::Job;
use git2::{IndexAddOption, Repository, Signature};
use serde_json::{Value, json};
use tokio::process::Command;

use super::sandbox::Sandbox;
use super::snapshot::SnapshotDiff;
use crate::config::FinalizeMode;
use crate::errors::OrchestratorError;

#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Publish the sandbox's work. The returned value is merged into the
    /// job result.
    async fn finalize(
        &self,
        job: &Job,
        sandbox: &Sandbox,
        changes: &SnapshotDiff,
    ) -> Result<Value, OrchestratorError>;

    /// Whether the job branch must survive sandbox release.
    fn keeps_branch(&self) -> bool {
        false
    }
}

fn finalize_error(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Finalize(message.into())
}

/// Stage everything in the worktree and commit it on the job branch.
/// Returns `None` when the tree matches `HEAD`.
fn commit_all(workdir: &Path, message: &str) -> Result<Option<String>, git2::Error> {
    let repo = Repository::open(workdir)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("dispatch", "dispatch@localhost")?;
    let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    Ok(Some(id.to_string()))
}

async fn commit_sandbox(job: &Job, sandbox: &Sandbox) -> Result<Option<String>, OrchestratorError> {
    let workdir: PathBuf = sandbox.path.clone();
    let message = format!("{}\n\nDispatch job {}", job.payload.title(), job.id);
    let commit = tokio::task::spawn_blocking(move || commit_all(&workdir, &message))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| finalize_error(format!("Commit failed: {}", e.message())))?;
    match &commit {
        Some(id) => tracing::info!(job_id = %job.id, commit = %id, branch = %sandbox.branch, "Committed sandbox changes"),
        None => tracing::info!(job_id = %job.id, "No changes to commit"),
    }
    Ok(commit)
}

/// Commit locally and keep the job branch.
pub struct CommitFinalizer;

#[async_trait]
impl Finalizer for CommitFinalizer {
    async fn finalize(
        &self,
        job: &Job,
        sandbox: &Sandbox,
        _changes: &SnapshotDiff,
    ) -> Result<Value, OrchestratorError> {
        let commit = commit_sandbox(job, sandbox).await?;
        Ok(json!({ "commit": commit, "branch": sandbox.branch }))
    }

    fn keeps_branch(&self) -> bool {
        true
    }
}

/// Commit, push the job branch and open a pull request with `gh`.
pub struct PullRequestFinalizer {
    remote: String,
}

impl PullRequestFinalizer {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }

    async fn push(&self, sandbox: &Sandbox) -> Result<(), OrchestratorError> {
        let output = Command::new("git")
            .args(["push", "-u", &self.remote, &sandbox.branch])
            .current_dir(&sandbox.path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| finalize_error(format!("Failed to run git push: {}", e)))?;
        if !output.status.success() {
            return Err(finalize_error(format!(
                "Failed to push branch {}: {}",
                sandbox.branch,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        job: &Job,
        sandbox: &Sandbox,
        changes: &SnapshotDiff,
    ) -> Result<String, OrchestratorError> {
        let title = job.payload.title();
        let body = pull_request_body(job, changes);
        let output = Command::new("gh")
            .args([
                "pr", "create", "--head", &sandbox.branch, "--title", &title, "--body", &body,
            ])
            .current_dir(&sandbox.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| finalize_error(format!("Failed to run gh pr create: {}", e)))?;
        if !output.status.success() {
            return Err(finalize_error(format!(
                "Failed to create PR: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn pull_request_body(job: &Job, changes: &SnapshotDiff) -> String {
    let mut body = format!(
        "## Summary\n\nAutomated change for: **{}**\n\nSource: `{}` / `{}`\n",
        job.payload.title(),
        job.source,
        job.event_type
    );
    for (label, paths) in [
        ("Added", &changes.added),
        ("Modified", &changes.modified),
        ("Removed", &changes.removed),
    ] {
        if paths.is_empty() {
            continue;
        }
        body.push_str(&format!("\n### {}\n", label));
        for path in paths {
            body.push_str(&format!("- `{}`\n", path));
        }
    }
    body.push_str(&format!("\n---\n*Dispatch job {}*", job.id));
    body
}

#[async_trait]
impl Finalizer for PullRequestFinalizer {
    async fn finalize(
        &self,
        job: &Job,
        sandbox: &Sandbox,
        changes: &SnapshotDiff,
    ) -> Result<Value, OrchestratorError> {
        let Some(commit) = commit_sandbox(job, sandbox).await? else {
            return Ok(json!({ "commit": null, "branch": sandbox.branch, "pull_request": null }));
        };
        self.push(sandbox).await?;
        let url = self.open_pull_request(job, sandbox, changes).await?;
        tracing::info!(job_id = %job.id, pull_request = %url, "Opened pull request");
        Ok(json!({ "commit": commit, "branch": sandbox.branch, "pull_request": url }))
    }

    fn keeps_branch(&self) -> bool {
        true
    }
}

/// Leave the work where it is; the sandbox is discarded on release.
pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn finalize(
        &self,
        _job: &Job,
        _sandbox: &Sandbox,
        _changes: &SnapshotDiff,
    ) -> Result<Value, OrchestratorError> {
        Ok(Value::Null)
    }
}

pub fn from_config(mode: FinalizeMode, remote: &str) -> Box<dyn Finalizer> {
    match mode {
        FinalizeMode::PullRequest => Box::new(PullRequestFinalizer::new(remote)),
        FinalizeMode::Commit => Box::new(CommitFinalizer),
        FinalizeMode::None => Box::new(NoopFinalizer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::sandbox::{SandboxProvider, WorktreeSandbox, testing::init_repo};
    use dispatch_common::JobPayload;
    use git2::BranchType;
    use tempfile::tempdir;

    fn job() -> Job {
        Job::new(
            "manual",
            "job",
            JobPayload::Manual {
                prompt: "Add a changelog".into(),
                repository: None,
            },
        )
    }

    #[tokio::test]
    async fn test_commit_finalizer_commits_on_job_branch() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();
        std::fs::write(sandbox.path.join("CHANGELOG.md"), "# Changes\n").unwrap();

        let result = CommitFinalizer
            .finalize(&job, &sandbox, &SnapshotDiff::default())
            .await
            .unwrap();
        assert!(result["commit"].is_string());
        provider.release(&sandbox, CommitFinalizer.keeps_branch()).await.unwrap();

        let repo = Repository::open(repo_dir.path()).unwrap();
        let branch = repo.find_branch(&sandbox.branch, BranchType::Local).unwrap();
        let commit = branch.get().peel_to_commit().unwrap();
        assert!(commit.message().unwrap().contains(&job.id.to_string()));
        assert!(commit.tree().unwrap().get_name("CHANGELOG.md").is_some());
    }

    #[tokio::test]
    async fn test_commit_finalizer_records_deletions() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();
        std::fs::remove_file(sandbox.path.join("README.md")).unwrap();

        CommitFinalizer
            .finalize(&job, &sandbox, &SnapshotDiff::default())
            .await
            .unwrap();
        let repo = Repository::open(&sandbox.path).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_name("README.md").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_tree_is_not_committed() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        let job = job();
        let sandbox = provider.acquire(&job).await.unwrap();

        let result = CommitFinalizer
            .finalize(&job, &sandbox, &SnapshotDiff::default())
            .await
            .unwrap();
        assert!(result["commit"].is_null());
        assert_eq!(result["branch"], sandbox.branch.as_str());
    }

    #[test]
    fn test_pull_request_body_lists_changes() {
        let changes = SnapshotDiff {
            added: vec!["src/new.rs".into()],
            modified: vec![],
            removed: vec!["old.txt".into()],
        };
        let body = pull_request_body(&job(), &changes);
        assert!(body.contains("### Added\n- `src/new.rs`"));
        assert!(body.contains("### Removed\n- `old.txt`"));
        assert!(!body.contains("### Modified"));
    }

    #[test]
    fn test_from_config_branch_retention() {
        assert!(from_config(FinalizeMode::Commit, "origin").keeps_branch());
        assert!(from_config(FinalizeMode::PullRequest, "origin").keeps_branch());
        assert!(!from_config(FinalizeMode::None, "origin").keeps_branch());
    }
}
