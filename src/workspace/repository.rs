//! SQLite registry of known workspaces (`<root>/workspaces.db`).

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dispatch_common::now;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::errors::WorkspaceError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created: String = row.get(4)?;
        let updated: String = row.get(5)?;
        let parse = |idx: usize, text: &str| {
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        };
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            enabled: row.get(3)?,
            created_at: parse(4, &created)?,
            updated_at: parse(5, &updated)?,
        })
    }
}

const SELECT: &str =
    "SELECT id, name, description, enabled, created_at, updated_at FROM workspaces";

fn repo_err(e: impl Into<anyhow::Error>) -> WorkspaceError {
    WorkspaceError::Repository(e.into())
}

#[derive(Clone)]
pub struct WorkspaceRepository {
    conn: Arc<Mutex<Connection>>,
}

impl WorkspaceRepository {
    pub fn open(path: &Path) -> Result<Self, WorkspaceError> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open workspace registry {}", path.display()))
            .map_err(WorkspaceError::Repository)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, WorkspaceError> {
        Self::init(Connection::open_in_memory().map_err(repo_err)?)
    }

    fn init(conn: Connection) -> Result<Self, WorkspaceError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(repo_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(repo_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R, WorkspaceError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| repo_err(anyhow::anyhow!("Registry lock poisoned: {}", e)))?;
            f(&guard).map_err(repo_err)
        })
        .await
        .map_err(repo_err)?
    }

    /// Insert a workspace, or update name/description of an existing one.
    /// `None` keeps the stored value; `enabled` is never touched.
    pub async fn upsert(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<WorkspaceRecord, WorkspaceError> {
        let id = id.to_string();
        let name = name.map(str::to_string);
        let description = description.map(str::to_string);
        self.call(move |conn| {
            let ts = now().to_rfc3339();
            conn.execute(
                "INSERT INTO workspaces (id, name, description, enabled, created_at, updated_at)
                 VALUES (?1, COALESCE(?2, ?1), ?3, 1, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = COALESCE(?2, name),
                    description = COALESCE(?3, description),
                    updated_at = ?4",
                params![id, name, description, ts],
            )?;
            conn.query_row(&format!("{} WHERE id = ?1", SELECT), params![id], |row| {
                WorkspaceRecord::from_row(row)
            })
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkspaceRecord>, WorkspaceError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(&format!("{} WHERE id = ?1", SELECT), params![id], |row| {
                WorkspaceRecord::from_row(row)
            })
            .optional()
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceRecord>, WorkspaceError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT))?;
            let rows = stmt.query_map([], WorkspaceRecord::from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), WorkspaceError> {
        let id_owned = id.to_string();
        let updated = self
            .call(move |conn| {
                conn.execute(
                    "UPDATE workspaces SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id_owned, enabled, now().to_rfc3339()],
                )
            })
            .await?;
        if updated == 0 {
            return Err(WorkspaceError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
