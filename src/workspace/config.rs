//! Static workspace manifest (`workspaces.toml`).
//!
//! ```toml
//! [[workspace]]
//! id = "acme"
//! name = "Acme Corp"
//! auto_provision = true
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::WorkspaceId;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Create the workspace directory on startup.
    #[serde(default)]
    pub auto_provision: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    #[serde(default)]
    pub workspace: Vec<WorkspaceEntry>,
}

impl WorkspaceManifest {
    /// Missing file means an empty manifest.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&WorkspaceEntry> {
        self.workspace.iter().find(|e| e.id == id)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        for entry in &self.workspace {
            if WorkspaceId::parse(&entry.id).is_err() {
                warnings.push(format!("Manifest workspace id '{}' is invalid", entry.id));
            }
            if !seen.insert(entry.id.as_str()) {
                warnings.push(format!("Manifest workspace '{}' is declared twice", entry.id));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempdir().unwrap();
        let manifest = WorkspaceManifest::load(&dir.path().join("workspaces.toml")).unwrap();
        assert!(manifest.workspace.is_empty());
    }

    #[test]
    fn test_parse_entries_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspaces.toml");
        std::fs::write(&path, "[[workspace]]\nid = \"acme\"\n").unwrap();
        let manifest = WorkspaceManifest::load(&path).unwrap();
        let entry = manifest.get("acme").unwrap();
        assert!(entry.enabled);
        assert!(!entry.auto_provision);
        assert!(entry.name.is_none());
    }

    #[test]
    fn test_validate_reports_bad_and_duplicate_ids() {
        let manifest = WorkspaceManifest {
            workspace: vec![
                WorkspaceEntry {
                    id: "Bad Id".into(),
                    name: None,
                    description: None,
                    enabled: true,
                    auto_provision: false,
                },
                WorkspaceEntry {
                    id: "acme".into(),
                    name: None,
                    description: None,
                    enabled: true,
                    auto_provision: false,
                },
                WorkspaceEntry {
                    id: "acme".into(),
                    name: None,
                    description: None,
                    enabled: false,
                    auto_provision: false,
                },
            ],
        };
        let warnings = manifest.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("invalid"));
        assert!(warnings[1].contains("twice"));
    }
}
