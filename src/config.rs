//! Layered configuration for dispatch.
//!
//! Values are resolved file → environment → CLI. The global file is
//! `dispatch.toml`; each workspace may carry its own `config.toml` that
//! overrides the repository, agent, validation and finalize sections.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [queue]
//! provider = "sqlite"        # file | sqlite | redis
//! poll_interval_ms = 250
//!
//! [queue.redis]
//! host = "localhost"
//! port = 6379
//! db = 0
//!
//! [workspaces]
//! root = "workspaces"
//! default = "default"
//!
//! [orchestrator]
//! max_workers = 2
//! agent_timeout_secs = 1800
//!
//! [repository]
//! path = "."
//! base_branch = "main"
//!
//! [agent]
//! command = "claude"
//! args = ["--print", "--dangerously-skip-permissions"]
//!
//! [validation]
//! commands = ["cargo test"]
//!
//! [finalize]
//! mode = "pull_request"      # pull_request | commit | none
//!
//! [board]
//! notify_url = "http://localhost:9000/cards"
//!
//! [board.lists]
//! "Ready for Agent" = "queue"
//! "Doing" = "in_progress"
//! "Done" = "done"
//! "Blocked" = "failed"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default global configuration file name.
pub const CONFIG_FILE: &str = "dispatch.toml";

// ── Queue ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueProvider {
    File,
    #[default]
    Sqlite,
    Redis,
}

impl QueueProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        }
    }
}

impl FromStr for QueueProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "redis" | "dragonfly" => Ok(Self::Redis),
            _ => anyhow::bail!(
                "Invalid queue provider '{}'. Valid values: file, sqlite, redis",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub provider: QueueProvider,
    /// Poll interval for backends without native blocking dequeue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: QueueProvider::default(),
            poll_interval_ms: default_poll_interval_ms(),
            redis: RedisConfig::default(),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Fallback webhook secret when a workspace has none in its secrets file.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Permissive CORS for local dashboards.
    #[serde(default)]
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret: None,
            cors_permissive: false,
        }
    }
}

// ── Workspaces ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    /// Static manifest of declared workspaces (defaults to `<root>/workspaces.toml`).
    #[serde(default)]
    pub manifest: Option<PathBuf>,
    #[serde(default = "default_workspace_id", rename = "default")]
    pub default_id: String,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            manifest: None,
            default_id: default_workspace_id(),
        }
    }
}

impl WorkspacesConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.manifest
            .clone()
            .unwrap_or_else(|| self.root.join("workspaces.toml"))
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,
    /// Claims older than this are returned to PENDING by `recover`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            agent_timeout_secs: default_agent_timeout_secs(),
            dequeue_timeout_secs: default_dequeue_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            retention_days: default_retention_days(),
        }
    }
}

// ── Repository / agent / validation / finalize ────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repository_path(),
            base_branch: default_base_branch(),
            remote: default_remote(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Shell commands run inside the sandbox after the agent; all must exit 0.
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeMode {
    PullRequest,
    #[default]
    Commit,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeConfig {
    #[serde(default)]
    pub mode: FinalizeMode,
}

// ── Board ─────────────────────────────────────────────────────────────

/// What a board list means to the job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardRole {
    /// Moving a card here creates a job.
    Queue,
    InProgress,
    Done,
    Failed,
    /// Known list that never triggers work.
    Ignore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub lists: BTreeMap<String, BoardRole>,
}

// ── Logging ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Write a daily rolling log file into the workspace `logs/` directory.
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: true,
        }
    }
}

// ── Root ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workspaces: WorkspacesConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-workspace overrides read from `<workspace>/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub repository: Option<RepositoryConfig>,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    #[serde(default)]
    pub validation: Option<ValidationConfig>,
    #[serde(default)]
    pub finalize: Option<FinalizeConfig>,
    #[serde(default)]
    pub agent_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl WorkspaceSettings {
    /// Load settings from a workspace directory. Missing file means no overrides.
    pub fn load(workspace_dir: &Path) -> Result<Self> {
        let path = workspace_dir.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

impl DispatchConfig {
    /// Load configuration: explicit path, `DISPATCH_CONFIG`, `./dispatch.toml`,
    /// then the user config dir. Missing files fall back to defaults.
    /// Environment overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var("DISPATCH_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("dispatch").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid dispatch configuration")
    }

    /// Apply `DISPATCH_*` overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup("DISPATCH_QUEUE_PROVIDER") {
            self.queue.provider = provider.parse()?;
        }
        if let Some(host) = lookup("DISPATCH_REDIS_HOST") {
            self.queue.redis.host = host;
        }
        if let Some(port) = lookup("DISPATCH_REDIS_PORT") {
            self.queue.redis.port = port
                .parse()
                .with_context(|| format!("Invalid DISPATCH_REDIS_PORT '{}'", port))?;
        }
        if let Some(root) = lookup("DISPATCH_WORKSPACE_ROOT") {
            self.workspaces.root = PathBuf::from(root);
        }
        if let Some(bind) = lookup("DISPATCH_BIND") {
            self.server.bind = bind;
        }
        if let Some(secret) = lookup("DISPATCH_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        Ok(())
    }

    /// Effective configuration for one workspace: global values with the
    /// workspace's `config.toml` layered on top.
    pub fn for_workspace(&self, workspace_dir: &Path) -> Result<Self> {
        let settings = WorkspaceSettings::load(workspace_dir)?;
        let mut merged = self.clone();
        if let Some(repository) = settings.repository {
            merged.repository = repository;
        }
        if let Some(agent) = settings.agent {
            merged.agent = agent;
        }
        if let Some(validation) = settings.validation {
            merged.validation = validation;
        }
        if let Some(finalize) = settings.finalize {
            merged.finalize = finalize;
        }
        if let Some(secs) = settings.agent_timeout_secs {
            merged.orchestrator.agent_timeout_secs = secs;
        }
        if let Some(workers) = settings.max_workers {
            merged.orchestrator.max_workers = workers;
        }
        Ok(merged)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_workers == 0 {
            warnings.push("orchestrator.max_workers must be at least 1".to_string());
        }
        if self.orchestrator.agent_timeout_secs == 0 {
            warnings.push("orchestrator.agent_timeout_secs must be positive".to_string());
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            warnings.push(format!(
                "server.bind '{}' is not a socket address",
                self.server.bind
            ));
        }
        if crate::workspace::WorkspaceId::parse(&self.workspaces.default_id).is_err() {
            warnings.push(format!(
                "workspaces.default '{}' is not a valid workspace id",
                self.workspaces.default_id
            ));
        }
        if self.queue.provider == QueueProvider::Redis && self.queue.redis.host.is_empty() {
            warnings.push("queue.redis.host must be set for the redis provider".to_string());
        }
        if self.board.notify_url.is_some() && self.board.lists.is_empty() {
            warnings.push("board.notify_url is set but board.lists is empty".to_string());
        }

        warnings
    }
}

// ── Default value functions ───────────────────────────────────────────

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_max_workers() -> usize {
    2
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

fn default_dequeue_timeout_secs() -> u64 {
    5
}

fn default_stale_after_secs() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    30
}

fn default_repository_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
