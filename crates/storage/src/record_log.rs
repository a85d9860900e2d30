use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ensure_parent_dir;

/// Append-only NDJSON log. Every line is flushed before `append` returns.
pub struct RecordLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    lines_written: u64,
}

impl RecordLog {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open record log: {}", path.display()))?;
        info!(path = %path.display(), "record log opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            lines_written: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .with_context(|| format!("record log already closed: {}", self.path.display()))?;
        let line = serde_json::to_string(record).context("failed to serialize log record")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush())
            .with_context(|| format!("failed to append to record log: {}", self.path.display()))?;
        self.lines_written = self.lines_written.saturating_add(1);
        Ok(())
    }

    /// Flushes and releases the file. Later appends fail; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .flush()
            .with_context(|| format!("failed to flush record log: {}", self.path.display()))?;
        writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync record log: {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            lines = self.lines_written,
            "record log closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn appends_one_line_per_record_and_reopens_in_append_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/out/records.ndjson");

        let mut log = RecordLog::open(&path)?;
        log.append(&json!({"signature": "sig-1"}))?;
        log.append(&json!({"signature": "sig-2"}))?;
        // flushed per write, visible before close
        assert_eq!(fs_lines(&path)?.len(), 2);
        log.close()?;

        let mut reopened = RecordLog::open(&path)?;
        reopened.append(&json!({"signature": "sig-3"}))?;
        reopened.close()?;

        let lines = fs_lines(&path)?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["signature"], "sig-3");
        Ok(())
    }

    #[test]
    fn append_after_close_fails_and_close_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("records.ndjson");
        let mut log = RecordLog::open(&path)?;
        log.close()?;
        log.close()?;
        assert!(log.append(&json!({"signature": "late"})).is_err());
        assert!(fs_lines(&path)?.is_empty());
        Ok(())
    }

    fn fs_lines(path: &Path) -> Result<Vec<Value>> {
        std::fs::read_to_string(path)?
            .lines()
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }
}
