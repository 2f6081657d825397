//! Disposable per-job git worktrees.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dispatch_common::Job;
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};

use crate::errors::SandboxError;

/// A job's private working copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Sandbox {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

impl Sandbox {
    pub fn for_job(job: &Job, sandboxes_dir: &Path) -> Self {
        let name = format!("job-{}", job.id);
        Self {
            path: sandboxes_dir.join(&name),
            branch: format!("dispatch/{}", name),
            name,
        }
    }
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create the sandbox. Any pre-existing directory, worktree or branch
    /// with the job's name is a [`SandboxError::NameCollision`].
    async fn acquire(&self, job: &Job) -> Result<Sandbox, SandboxError>;

    /// Remove the sandbox. `keep_branch` leaves the job branch in the
    /// repository for finalizers that commit locally.
    async fn release(&self, sandbox: &Sandbox, keep_branch: bool) -> Result<(), SandboxError>;
}

/// Worktrees of one repository, checked out under `sandboxes_dir`.
#[derive(Debug, Clone)]
pub struct WorktreeSandbox {
    repo_path: PathBuf,
    sandboxes_dir: PathBuf,
    base_branch: String,
}

impl WorktreeSandbox {
    pub fn new(repo_path: &Path, sandboxes_dir: &Path, base_branch: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            sandboxes_dir: sandboxes_dir.to_path_buf(),
            base_branch: base_branch.to_string(),
        }
    }

    fn open_repo(&self) -> Result<Repository, SandboxError> {
        Repository::open(&self.repo_path).map_err(|e| {
            SandboxError::Git(format!(
                "Failed to open repository {}: {}",
                self.repo_path.display(),
                e.message()
            ))
        })
    }

    fn acquire_blocking(&self, sandbox: Sandbox) -> Result<Sandbox, SandboxError> {
        let repo = self.open_repo()?;
        let collision = |reason: &str| SandboxError::NameCollision {
            name: sandbox.name.clone(),
            reason: reason.to_string(),
        };
        if sandbox.path.exists() {
            return Err(collision("directory already exists"));
        }
        if repo.find_worktree(&sandbox.name).is_ok() {
            return Err(collision("worktree already registered"));
        }
        if repo.find_branch(&sandbox.branch, BranchType::Local).is_ok() {
            return Err(collision("branch already exists"));
        }

        std::fs::create_dir_all(&self.sandboxes_dir).map_err(|source| SandboxError::Io {
            path: self.sandboxes_dir.clone(),
            source,
        })?;
        let base = repo
            .revparse_single(&self.base_branch)?
            .peel_to_commit()?;
        let branch = repo.branch(&sandbox.branch, &base, false)?;
        let reference = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Err(e) = repo.worktree(&sandbox.name, &sandbox.path, Some(&opts)) {
            if let Ok(mut branch) = repo.find_branch(&sandbox.branch, BranchType::Local)
                && let Err(cleanup) = branch.delete()
            {
                tracing::warn!(
                    branch = %sandbox.branch,
                    error = %cleanup,
                    "Failed to delete branch of unusable sandbox"
                );
            }
            return Err(e.into());
        }
        Ok(sandbox)
    }

    fn release_blocking(&self, sandbox: &Sandbox, keep_branch: bool) -> Result<(), SandboxError> {
        let mut first_error = None;

        match std::fs::remove_dir_all(&sandbox.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                first_error.get_or_insert(SandboxError::Io {
                    path: sandbox.path.clone(),
                    source,
                });
            }
        }

        let repo = self.open_repo()?;
        if let Ok(worktree) = repo.find_worktree(&sandbox.name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            if let Err(e) = worktree.prune(Some(&mut opts)) {
                first_error.get_or_insert(e.into());
            }
        }
        if !keep_branch
            && let Ok(mut branch) = repo.find_branch(&sandbox.branch, BranchType::Local)
            && let Err(e) = branch.delete()
        {
            first_error.get_or_insert(e.into());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SandboxProvider for WorktreeSandbox {
    async fn acquire(&self, job: &Job) -> Result<Sandbox, SandboxError> {
        let sandbox = Sandbox::for_job(job, &self.sandboxes_dir);
        let this = self.clone();
        let sandbox = tokio::task::spawn_blocking(move || this.acquire_blocking(sandbox))
            .await
            .map_err(anyhow::Error::from)??;
        tracing::debug!(sandbox = %sandbox.name, path = %sandbox.path.display(), "Sandbox acquired");
        Ok(sandbox)
    }

    async fn release(&self, sandbox: &Sandbox, keep_branch: bool) -> Result<(), SandboxError> {
        let this = self.clone();
        let target = sandbox.clone();
        tokio::task::spawn_blocking(move || this.release_blocking(&target, keep_branch))
            .await
            .map_err(anyhow::Error::from)??;
        tracing::debug!(sandbox = %sandbox.name, keep_branch, "Sandbox released");
        Ok(())
    }
}

/// Test helpers shared by orchestrator tests.
#[cfg(test)]
pub(crate) mod testing {
    use git2::{Repository, Signature};
    use std::path::Path;

    /// Initialize a repository with one commit on `main`.
    pub fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "test").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        {
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("test", "test@test.com").unwrap();
            let commit = repo
                .commit(None, &sig, &sig, "init", &tree, &[])
                .unwrap();
            let commit = repo.find_commit(commit).unwrap();
            repo.branch("main", &commit, true).unwrap();
        }
        repo.set_head("refs/heads/main").unwrap();
        repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_common::JobPayload;
    use tempfile::tempdir;

    fn job() -> Job {
        Job::new(
            "manual",
            "job",
            JobPayload::Manual {
                prompt: "x".into(),
                repository: None,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_creates_worktree_on_branch() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        testing::init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), &ws.path().join("sandboxes"), "main");
        let job = job();

        let sandbox = provider.acquire(&job).await.unwrap();
        assert_eq!(sandbox.name, format!("job-{}", job.id));
        assert!(sandbox.path.join("README.md").exists());

        let repo = Repository::open(repo_dir.path()).unwrap();
        assert!(repo.find_branch(&sandbox.branch, BranchType::Local).is_ok());

        provider.release(&sandbox, false).await.unwrap();
        assert!(!sandbox.path.exists());
        assert!(repo.find_branch(&sandbox.branch, BranchType::Local).is_err());
        assert!(repo.find_worktree(&sandbox.name).is_err());
    }

    #[tokio::test]
    async fn test_release_can_keep_branch() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        testing::init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");

        let sandbox = provider.acquire(&job()).await.unwrap();
        provider.release(&sandbox, true).await.unwrap();

        let repo = Repository::open(repo_dir.path()).unwrap();
        assert!(!sandbox.path.exists());
        assert!(repo.find_branch(&sandbox.branch, BranchType::Local).is_ok());
    }

    #[tokio::test]
    async fn test_existing_directory_is_collision() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        testing::init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        let job = job();
        std::fs::create_dir_all(ws.path().join(format!("job-{}", job.id))).unwrap();

        let err = provider.acquire(&job).await.unwrap_err();
        assert!(matches!(err, SandboxError::NameCollision { .. }));
    }

    #[tokio::test]
    async fn test_existing_branch_is_collision() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        let repo = testing::init_repo(repo_dir.path());
        let job = job();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch(&format!("dispatch/job-{}", job.id), &head, false)
            .unwrap();

        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        let err = provider.acquire(&job).await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::NameCollision { ref reason, .. } if reason.contains("branch")
        ));
        assert!(!ws.path().join(format!("job-{}", job.id)).exists());
    }

    #[tokio::test]
    async fn test_failed_worktree_add_removes_branch() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        testing::init_repo(repo_dir.path());
        let job = job();
        // A stray file where git keeps the worktree's admin dir.
        let admin = repo_dir.path().join(".git").join("worktrees");
        std::fs::create_dir_all(&admin).unwrap();
        std::fs::write(admin.join(format!("job-{}", job.id)), "stray").unwrap();

        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "main");
        assert!(provider.acquire(&job).await.is_err());

        let repo = Repository::open(repo_dir.path()).unwrap();
        assert!(
            repo.find_branch(&format!("dispatch/job-{}", job.id), BranchType::Local)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_base_branch_is_git_error() {
        let repo_dir = tempdir().unwrap();
        let ws = tempdir().unwrap();
        testing::init_repo(repo_dir.path());
        let provider = WorktreeSandbox::new(repo_dir.path(), ws.path(), "develop");
        assert!(matches!(
            provider.acquire(&job()).await.unwrap_err(),
            SandboxError::Git(_)
        ));
    }
}
