//! On-disk provisioning of a workspace directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use super::WorkspaceId;
use crate::config::{QueueConfig, QueueProvider};
use crate::errors::WorkspaceError;
use crate::queue::{FileQueue, SqliteQueue};

const SUBDIRS: &[&str] = &["data", "sandboxes", "snapshots", "logs"];

const SECRETS_TEMPLATE: &str = "\
# Copy this file to `secrets` and fill in the values.
# WEBHOOK_SECRET verifies X-Hub-Signature-256 on incoming webhooks.
WEBHOOK_SECRET=
# Token used by `gh` when the finalizer opens pull requests.
GH_TOKEN=
";

const CONFIG_TEMPLATE: &str = "\
# Per-workspace overrides of dispatch.toml. Every key is optional.
#
# agent_timeout_secs = 1800
# max_workers = 2
#
# [repository]
# path = \"/srv/repos/acme\"
# base_branch = \"main\"
#
# [agent]
# command = \"claude\"
# args = [\"--print\"]
#
# [validation]
# commands = [\"cargo test\"]
#
# [finalize]
# mode = \"pull_request\"
";

pub struct WorkspaceInitializer {
    root: PathBuf,
    queue: QueueConfig,
}

impl WorkspaceInitializer {
    pub fn new(root: &Path, queue: QueueConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            queue,
        }
    }

    /// Provision `<root>/<id>`. New workspaces are assembled in a staging
    /// directory and renamed into place; existing ones get missing pieces
    /// filled in. Safe to call repeatedly and from concurrent processes.
    pub fn create(&self, id: &WorkspaceId) -> Result<PathBuf, WorkspaceError> {
        let init_err = |cause: anyhow::Error| WorkspaceError::Init {
            id: id.to_string(),
            cause,
        };
        let target = self.root.join(id.as_str());
        if !target.exists() {
            self.create_staged(id, &target).map_err(init_err)?;
        }
        self.ensure_layout(&target).map_err(init_err)?;
        Ok(target)
    }

    fn create_staged(&self, id: &WorkspaceId, target: &Path) -> Result<()> {
        let staging = self
            .root
            .join(format!(".staging-{}-{}", id, uuid::Uuid::new_v4().simple()));
        self.ensure_layout(&staging)?;
        match std::fs::rename(&staging, target) {
            Ok(()) => {
                tracing::debug!(workspace = %id, "Created workspace directory");
                Ok(())
            }
            // Another process won the race; its directory is kept.
            Err(_) if target.is_dir() => {
                std::fs::remove_dir_all(&staging).with_context(|| {
                    format!("Failed to remove staging dir {}", staging.display())
                })?;
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                    tracing::warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging dir");
                }
                Err(e).with_context(|| format!("Failed to move workspace into {}", target.display()))
            }
        }
    }

    fn ensure_layout(&self, dir: &Path) -> Result<()> {
        for sub in SUBDIRS {
            let path = dir.join(sub);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create directory: {}", path.display()))?;
        }
        write_if_missing(&dir.join("secrets.template"), SECRETS_TEMPLATE)?;
        write_if_missing(&dir.join("config.toml"), CONFIG_TEMPLATE)?;
        self.init_queue_storage(&dir.join("data"))
    }

    /// Create the empty queue store so the first webhook does not pay for it.
    fn init_queue_storage(&self, data_dir: &Path) -> Result<()> {
        let poll = Duration::from_millis(self.queue.poll_interval_ms);
        match self.queue.provider {
            QueueProvider::Sqlite => {
                SqliteQueue::open(&data_dir.join("jobs.db"), poll)
                    .context("Failed to initialize jobs.db")?;
            }
            QueueProvider::File => {
                FileQueue::open(data_dir.join("queue"), poll)
                    .context("Failed to initialize file queue")?;
            }
            // Keys are created on first enqueue.
            QueueProvider::Redis => {}
        }
        Ok(())
    }
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if !path.exists() {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}
