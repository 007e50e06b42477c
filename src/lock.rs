//! Per-session advisory lock
//!
//! Mutating session operations hold an exclusive lock on a file named after
//! the session tag, so two invocations cannot splice or tear down the same
//! session at once. The lock is released when the guard drops, including
//! when the process dies.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Session {0} is busy in another vpnp process")]
    Busy(String),
    #[error("Failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Directory holding the lock files
    pub fn default_dir() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vpn-porthole")
    }

    /// Take the lock for `tag` without waiting.
    pub fn acquire_in(dir: &Path, tag: &str) -> Result<Self, LockError> {
        let io_err = |path: &Path, source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let path = dir.join(lock_file_name(tag));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Locked {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => Err(LockError::Busy(tag.to_string())),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// `vpnp/work_alice` becomes `vpnp_work_alice.lock`.
fn lock_file_name(tag: &str) -> String {
    let safe: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.lock", safe)
}
