//! Structural snapshots of a sandbox: path, size and SHA-256 per file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dispatch_common::{JobId, now};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub job_id: JobId,
    pub label: String,
    pub taken_at: DateTime<Utc>,
    /// Keyed by `/`-separated path relative to the sandbox root.
    pub files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

impl Snapshot {
    /// Walk `root`, skipping `.git` (a directory in clones, a file in
    /// worktrees). Symlinks are recorded, not followed.
    pub fn capture(job_id: JobId, label: &str, root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(key) = relative_key(root, entry.path()) else {
                continue;
            };
            let metadata = entry
                .path()
                .symlink_metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            let sha256 = if entry.file_type().is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                hex::encode(Sha256::digest(target.to_string_lossy().as_bytes()))
            } else {
                hash_file(entry.path())
                    .with_context(|| format!("Failed to hash {}", entry.path().display()))?
            };
            files.insert(
                key,
                FileEntry {
                    size: metadata.len(),
                    sha256,
                },
            );
        }
        Ok(Self {
            job_id,
            label: label.to_string(),
            taken_at: now(),
            files,
        })
    }

    /// Write as `<job id>-<label>.json` under `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}-{}.json", self.job_id, self.label));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    /// Changes from `self` to `after`.
    pub fn diff(&self, after: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for (path, entry) in &after.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(before) if before != entry => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .files
            .keys()
            .filter(|p| !after.files.contains_key(*p))
            .cloned()
            .collect();
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_capture_skips_git_and_hashes_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let snap = Snapshot::capture(JobId::new(), "before", dir.path()).unwrap();
        assert_eq!(snap.files.keys().collect::<Vec<_>>(), vec!["src/main.rs"]);
        let entry = &snap.files["src/main.rs"];
        assert_eq!(entry.size, 12);
        assert_eq!(entry.sha256.len(), 64);
    }

    #[test]
    fn test_worktree_git_file_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".git"), "gitdir: /elsewhere").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let snap = Snapshot::capture(JobId::new(), "before", dir.path()).unwrap();
        assert_eq!(snap.files.len(), 1);
    }

    #[test]
    fn test_diff_classifies_changes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), "same").unwrap();
        fs::write(dir.path().join("edit.txt"), "v1").unwrap();
        fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        let id = JobId::new();
        let before = Snapshot::capture(id, "before", dir.path()).unwrap();

        fs::write(dir.path().join("edit.txt"), "v2").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("new.txt"), "hi").unwrap();
        let after = Snapshot::capture(id, "after", dir.path()).unwrap();

        let diff = before.diff(&after);
        assert_eq!(diff.added, vec!["new.txt"]);
        assert_eq!(diff.modified, vec!["edit.txt"]);
        assert_eq!(diff.removed, vec!["gone.txt"]);
        assert!(before.diff(&before).is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let snap = Snapshot::capture(JobId::new(), "before", dir.path()).unwrap();
        let out = tempdir().unwrap();

        let path = snap.save(out.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("-before.json"));
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.files, snap.files);
    }
}
