//! Pidfile handling.
//!
//! A pidfile whose recorded process is still alive blocks startup; a stale
//! one is overwritten. The file is removed when the guard drops.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for pidfile operations.
#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("process {pid} from {path} is still running")]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("failed to write pidfile {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Owns a written pidfile; removes it on drop.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Write the current pid to `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PidfileError> {
        let path = path.as_ref().to_path_buf();

        if let Some(pid) = read_pid(&path) {
            if pid != std::process::id() && process_alive(pid) {
                return Err(PidfileError::AlreadyRunning { pid, path });
            }
            tracing::info!(path = %path.display(), pid, "Replacing stale pidfile");
        }

        fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
            PidfileError::Write {
                path: path.clone(),
                source,
            }
        })?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove pidfile");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

// Linux exposes every live process under /proc.
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
