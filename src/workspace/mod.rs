//! Workspace (tenant) isolation.
//!
//! Every workspace owns a directory under `[workspaces] root`:
//!
//! ```text
//! <root>/
//! ├── workspaces.db        # registry of known workspaces
//! ├── workspaces.toml      # optional manifest of declared workspaces
//! └── <id>/
//!     ├── secrets          # dotenv file, WEBHOOK_SECRET etc. (operator-provided)
//!     ├── secrets.template
//!     ├── config.toml      # per-workspace overrides
//!     ├── data/            # jobs.db or queue/
//!     ├── sandboxes/       # job worktrees
//!     ├── snapshots/
//!     └── logs/
//! ```
//!
//! Nothing is shared between workspaces except the registry itself.

pub mod config;
pub mod context;
pub mod initializer;
pub mod middleware;
pub mod registry;
pub mod repository;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::DispatchConfig;
use crate::errors::WorkspaceError;

pub use config::{WorkspaceEntry, WorkspaceManifest};
pub use context::{current_workspace_id, get_current_workspace};
pub use initializer::WorkspaceInitializer;
pub use middleware::{WORKSPACE_HEADER, resolve_workspace};
pub use registry::QueueRegistry;
pub use repository::{WorkspaceRecord, WorkspaceRepository};

static WORKSPACE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("workspace id pattern is a valid static regex")
    });

/// Validated workspace identifier, safe to use as a directory name and a
/// Redis key segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn parse(id: &str) -> Result<Self, WorkspaceError> {
        if WORKSPACE_ID_REGEX.is_match(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(WorkspaceError::InvalidId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved, enabled workspace.
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub description: Option<String>,
    pub dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.dir.join("sandboxes")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.dir.join("snapshots")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.dir.join("secrets")
    }

    /// Look up one key in the workspace `secrets` file.
    pub fn secret(&self, key: &str) -> anyhow::Result<Option<String>> {
        read_secret(&self.secrets_path(), key)
    }
}

fn read_secret(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let entries = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read secrets file {}", path.display()))?;
    for entry in entries {
        let (name, value) =
            entry.with_context(|| format!("Invalid line in {}", path.display()))?;
        if name == key {
            return Ok(Some(value).filter(|v| !v.is_empty()));
        }
    }
    Ok(None)
}

/// Provisioning and resolution of workspaces. Every resolve reads the
/// registry, so a workspace disabled by another process is refused at once.
pub struct WorkspaceService {
    root: PathBuf,
    default_id: String,
    manifest_path: PathBuf,
    repository: WorkspaceRepository,
    initializer: Arc<WorkspaceInitializer>,
}

impl WorkspaceService {
    pub fn open(config: &DispatchConfig) -> Result<Self, WorkspaceError> {
        let root = config.workspaces.root.clone();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))
            .map_err(WorkspaceError::Repository)?;
        let repository = WorkspaceRepository::open(&root.join("workspaces.db"))?;
        Ok(Self {
            initializer: Arc::new(WorkspaceInitializer::new(&root, config.queue.clone())),
            default_id: config.workspaces.default_id.clone(),
            manifest_path: config.workspaces.manifest_path(),
            root,
            repository,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Provision the default workspace and every manifest entry flagged
    /// `auto_provision`. A manifest `enabled` flag is applied only when the
    /// workspace is first registered; later changes belong to
    /// `set_enabled`.
    pub async fn bootstrap(&self) -> Result<(), WorkspaceError> {
        let manifest =
            WorkspaceManifest::load(&self.manifest_path).map_err(WorkspaceError::Repository)?;
        for warning in manifest.validate() {
            tracing::warn!("{}", warning);
        }

        if manifest.get(&self.default_id).is_none() {
            self.provision(&self.default_id, None, None).await?;
        }
        for entry in &manifest.workspace {
            if !(entry.auto_provision || entry.id == self.default_id) {
                continue;
            }
            let registered = WorkspaceId::parse(&entry.id).is_ok()
                && self.repository.get(&entry.id).await?.is_some();
            self.provision(&entry.id, entry.name.as_deref(), entry.description.as_deref())
                .await?;
            if !registered && !entry.enabled {
                self.repository.set_enabled(&entry.id, false).await?;
            }
        }
        tracing::info!(root = %self.root.display(), "Workspaces bootstrapped");
        Ok(())
    }

    /// Create (or repair) a workspace and register it. Idempotent.
    pub async fn provision(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Workspace, WorkspaceError> {
        let id = WorkspaceId::parse(id)?;
        let initializer = self.initializer.clone();
        let init_id = id.clone();
        let dir = tokio::task::spawn_blocking(move || initializer.create(&init_id))
            .await
            .map_err(|e| WorkspaceError::Init {
                id: id.to_string(),
                cause: e.into(),
            })??;

        let record = self
            .repository
            .upsert(id.as_str(), name, description)
            .await?;
        let workspace = Workspace {
            id,
            name: record.name,
            description: record.description,
            dir,
            created_at: record.created_at,
        };
        tracing::info!(workspace = %workspace.id, dir = %workspace.dir.display(), "Workspace provisioned");
        Ok(workspace)
    }

    /// Resolve an enabled, provisioned workspace. Anything else is NotFound.
    pub async fn resolve(&self, id: &str) -> Result<Workspace, WorkspaceError> {
        let not_found = || WorkspaceError::NotFound(id.to_string());
        let workspace_id = WorkspaceId::parse(id).map_err(|_| not_found())?;
        let record = self
            .repository
            .get(workspace_id.as_str())
            .await?
            .filter(|r| r.enabled)
            .ok_or_else(not_found)?;
        let dir = self.root.join(workspace_id.as_str());
        if !dir.is_dir() {
            return Err(not_found());
        }
        Ok(Workspace {
            id: workspace_id,
            name: record.name,
            description: record.description,
            dir,
            created_at: record.created_at,
        })
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceRecord>, WorkspaceError> {
        self.repository.list().await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), WorkspaceError> {
        self.repository.set_enabled(id, enabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueProvider;
    use tempfile::tempdir;

    fn config(root: &Path) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.workspaces.root = root.to_path_buf();
        config.queue.provider = QueueProvider::Sqlite;
        config
    }

    #[test]
    fn test_workspace_id_rules() {
        assert!(WorkspaceId::parse("acme").is_ok());
        assert!(WorkspaceId::parse("team-2_b").is_ok());
        assert!(WorkspaceId::parse("").is_err());
        assert!(WorkspaceId::parse("-leading").is_err());
        assert!(WorkspaceId::parse("Upper").is_err());
        assert!(WorkspaceId::parse("../etc").is_err());
        assert!(WorkspaceId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_secret_lookup() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("secrets"),
            "# comment\nWEBHOOK_SECRET=abc123\nEMPTY=\n",
        )
        .unwrap();
        let path = dir.path().join("secrets");
        assert_eq!(read_secret(&path, "WEBHOOK_SECRET").unwrap().as_deref(), Some("abc123"));
        assert_eq!(read_secret(&path, "EMPTY").unwrap(), None);
        assert_eq!(read_secret(&path, "MISSING").unwrap(), None);
        assert_eq!(read_secret(&dir.path().join("nope"), "X").unwrap(), None);
    }

    #[tokio::test]
    async fn test_bootstrap_provisions_default() {
        let dir = tempdir().unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        service.bootstrap().await.unwrap();

        let workspace = service.resolve("default").await.unwrap();
        assert!(workspace.data_dir().join("jobs.db").exists());
        assert!(workspace.sandboxes_dir().is_dir());
    }

    #[tokio::test]
    async fn test_bootstrap_applies_manifest() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("workspaces.toml"),
            r#"
[[workspace]]
id = "acme"
name = "Acme Corp"
auto_provision = true

[[workspace]]
id = "retired"
auto_provision = true
enabled = false
"#,
        )
        .unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        service.bootstrap().await.unwrap();

        assert_eq!(service.resolve("acme").await.unwrap().name, "Acme Corp");
        assert!(matches!(
            service.resolve("retired").await.unwrap_err(),
            WorkspaceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown_and_invalid_fail_closed() {
        let dir = tempdir().unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        service.bootstrap().await.unwrap();

        for id in ["ghost", "../default", "DEFAULT", ""] {
            assert!(matches!(
                service.resolve(id).await.unwrap_err(),
                WorkspaceError::NotFound(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_disable_takes_effect_immediately() {
        let dir = tempdir().unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        service.provision("acme", None, None).await.unwrap();
        assert!(service.resolve("acme").await.is_ok());

        service.set_enabled("acme", false).await.unwrap();
        assert!(service.resolve("acme").await.is_err());
    }

    #[tokio::test]
    async fn test_disable_from_another_instance_is_seen() {
        let dir = tempdir().unwrap();
        let server = WorkspaceService::open(&config(dir.path())).unwrap();
        server.provision("acme", None, None).await.unwrap();
        assert!(server.resolve("acme").await.is_ok());

        let cli = WorkspaceService::open(&config(dir.path())).unwrap();
        cli.set_enabled("acme", false).await.unwrap();
        assert!(matches!(
            server.resolve("acme").await.unwrap_err(),
            WorkspaceError::NotFound(_)
        ));

        cli.set_enabled("acme", true).await.unwrap();
        assert!(server.resolve("acme").await.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_operator_disable() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("workspaces.toml"),
            "[[workspace]]\nid = \"acme\"\nauto_provision = true\n",
        )
        .unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        service.bootstrap().await.unwrap();
        service.set_enabled("acme", false).await.unwrap();

        service.bootstrap().await.unwrap();
        assert!(service.resolve("acme").await.is_err());
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let dir = tempdir().unwrap();
        let service = WorkspaceService::open(&config(dir.path())).unwrap();
        let first = service.provision("acme", Some("Acme"), None).await.unwrap();
        let second = service.provision("acme", None, None).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.name, "Acme");
        assert_eq!(service.list().await.unwrap().len(), 1);
    }
}
