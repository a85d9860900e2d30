use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::ensure_parent_dir;

/// Writes a JSON document by temp file + fsync + rename, so readers only ever
/// see a complete previous or complete new snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&self, snapshot: &T) -> Result<()> {
        let body =
            serde_json::to_vec_pretty(snapshot).context("failed to serialize snapshot")?;
        let tmp = self.temp_path();
        let result = write_synced(&tmp, &body).and_then(|()| {
            fs::rename(&tmp, &self.path).with_context(|| {
                format!(
                    "failed to move snapshot into place: {} -> {}",
                    tmp.display(),
                    self.path.display()
                )
            })
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

fn write_synced(path: &Path, body: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("failed to create snapshot temp file: {}", path.display()))?;
    file.write_all(body)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write snapshot temp file: {}", path.display()))
}
