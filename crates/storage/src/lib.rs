use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

mod record_log;
mod snapshot;

pub use record_log::RecordLog;
pub use snapshot::SnapshotWriter;

/// Creates the parent directory of an output file, if it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create output parent dir: {}", parent.display())
        })?;
    }
    Ok(())
}
