//! Single-instance enforcement via a pid-file.
//!
//! Two instances would contend for the same serial devices and the
//! same operator cache directory, so startup takes a pid-file and
//! exit releases it. A stale file (its PID no longer running) is
//! overwritten.

use crate::operator_cache::expand_path;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Pid-file acquisition errors; fatal at startup.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another instance is running (pid {pid}, pid-file {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("pid-file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot resolve pid-file path: {0}")]
    Path(String),
}

/// Whether a process with `pid` currently exists.
fn pid_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Held pid-file; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquires the pid-file at `configured_path` (with `~`
    /// expansion), failing when a live instance holds it.
    pub fn acquire(configured_path: &str) -> Result<Self, PidFileError> {
        let path = expand_path(configured_path).map_err(|e| PidFileError::Path(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| PidFileError::Io {
                path: path.clone(),
                source,
            })?;
        }

        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid_running(pid) {
                    return Err(PidFileError::AlreadyRunning { pid, path });
                }
                warn!(pid, path = %path.display(), "stale pid-file, overwriting");
            }
        }

        fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
            PidFileError::Io {
                path: path.clone(),
                source,
            }
        })?;
        debug!(path = %path.display(), "pid-file acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "pid-file removal failed");
        }
    }
}
