//! I/O helpers: configuration, artifacts, process launching and notifications.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod artifacts;
pub mod config;
pub mod launcher;
pub mod notifier;
pub mod process;
pub mod report;
pub mod watcher;

/// Write `contents` through a sibling temp file and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
