//! Content-addressed store for tool output, artifacts, and pre-change
//! snapshots. Objects are immutable and named by their BLAKE3 digest;
//! writes go through a temp file and rename.

use super::types::TargetFormat;
use crate::audit::hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pre-change state captured before a run touches a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identity: String,
    pub format: TargetFormat,
    pub taken_at: DateTime<Utc>,
    /// The artifact file that was in the working directory, if any.
    pub prior_artifact_ref: Option<String>,
    /// Backend state dump (`terraform show -json`, `kubectl get -o yaml`).
    pub state_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

/// Write atomically: temp file, then rename over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })
}

impl SnapshotStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.to_path_buf(),
        }
    }

    fn object_path(&self, dir: &str, reference: &str, ext: &str) -> Result<PathBuf, String> {
        let hex = hasher::digest_hex(reference);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid object reference '{}'", reference));
        }
        Ok(self.root.join(dir).join(format!("{}{}", hex, ext)))
    }

    fn put(&self, dir: &str, ext: &str, content: &str) -> Result<String, String> {
        let reference = hasher::hash_string(content);
        let path = self.object_path(dir, &reference, ext)?;
        if !path.exists() {
            write_atomic(&path, content.as_bytes())?;
        }
        Ok(reference)
    }

    fn get(&self, dir: &str, ext: &str, reference: &str) -> Result<String, String> {
        let path = self.object_path(dir, reference, ext)?;
        std::fs::read_to_string(&path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
    }

    /// Store captured tool output under `outputs/<digest>.log`.
    pub fn put_output(&self, text: &str) -> Result<String, String> {
        self.put("outputs", ".log", text)
    }

    pub fn output(&self, reference: &str) -> Result<String, String> {
        self.get("outputs", ".log", reference)
    }

    /// Store an artifact body under `artifacts/<digest>`.
    pub fn put_artifact(&self, content: &str) -> Result<String, String> {
        self.put("artifacts", "", content)
    }

    pub fn artifact(&self, reference: &str) -> Result<String, String> {
        self.get("artifacts", "", reference)
    }

    /// Store a snapshot manifest under `snapshots/<digest>.yaml`.
    pub fn put_snapshot(&self, snapshot: &Snapshot) -> Result<String, String> {
        let yaml = serde_yaml_ng::to_string(snapshot)
            .map_err(|e| format!("serialize error: {}", e))?;
        self.put("snapshots", ".yaml", &yaml)
    }

    pub fn snapshot(&self, reference: &str) -> Result<Snapshot, String> {
        let yaml = self.get("snapshots", ".yaml", reference)?;
        serde_yaml_ng::from_str(&yaml)
            .map_err(|e| format!("invalid snapshot {}: {}", reference, e))
    }
}
