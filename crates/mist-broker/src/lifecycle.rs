//! Broker lifecycle: PID file and status checks

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Write the current process id to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Check if a broker is running according to the PID file at `path`
pub fn is_running_at(path: &Path) -> bool {
    if let Ok(contents) = fs::read_to_string(path) {
        if let Ok(pid) = contents.trim().parse::<u32>() {
            // Linux-specific
            return Path::new(&format!("/proc/{}", pid)).exists();
        }
    }
    false
}
