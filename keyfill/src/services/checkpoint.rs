//! Checkpoint store
//!
//! Durable JSON snapshot of the record cache:
//!
//! ```json
//! { "cache": { "K1": { "Name": "Acme" }, "K2": null } }
//! ```
//!
//! Saves write a temp file beside the target, fsync it, then rename over the
//! target, so a crash mid-write leaves the previous snapshot intact.

use crate::error::{Error, Result};
use crate::types::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Serialized form of the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub cache: BTreeMap<String, Option<Record>>,
}

impl CheckpointSnapshot {
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// File-backed checkpoint location
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default checkpoint path for a dataset: `.<stem>.checkpoint.json` beside it
    pub fn default_path_for(input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset");
        let file_name = format!(".{}.checkpoint.json", stem);
        match input.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the snapshot; a missing file is an empty snapshot
    pub fn load(&self) -> Result<CheckpointSnapshot> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map_err(|e| Error::CorruptCheckpoint {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace the stored snapshot
    pub fn save(&self, snapshot: &CheckpointSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(keyfill_common::Error::from)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let file_name = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("checkpoint");
        let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        if let Ok(dir) = std::fs::File::open(&parent) {
            let _ = dir.sync_all();
        }

        tracing::debug!(path = %self.path.display(), entries = snapshot.len(), "Checkpoint saved");
        Ok(())
    }

    /// Delete the checkpoint; absent is fine
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
