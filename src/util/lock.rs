//! Per-job-type pid file preventing overlapping runs (e.g. two cron runs).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Display, Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[display("another {job} backup is already running (pid {pid}, lock {})", path.display())]
    AlreadyRunning {
        #[error(ignore)]
        job: String,
        #[error(ignore)]
        pid: u32,
        #[error(ignore)]
        path: PathBuf,
    },
    #[display("acquiring lock {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Held lock; the pid file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock file location for `job` inside `lock_dir`.
    pub fn path_for(lock_dir: &Path, job: &str) -> PathBuf {
        lock_dir.join(format!("nimbus-{}.pid", job.to_lowercase()))
    }

    /// Creates the pid file, replacing a stale one left by a dead process.
    pub fn acquire(lock_dir: &Path, job: &str) -> Result<Self, LockError> {
        let path = Self::path_for(lock_dir, job);
        let io_error = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(lock_dir).map_err(io_error)?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id()).map_err(io_error)?;
                    log::debug!(target: "lock", "Acquired {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = match fs::read_to_string(&path) {
                        Ok(text) => text.trim().parse::<u32>().ok(),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_error(e)),
                    };
                    if let Some(pid) = holder.filter(|pid| process_alive(*pid)) {
                        return Err(LockError::AlreadyRunning {
                            job: job.to_string(),
                            pid,
                            path,
                        });
                    }

                    log::warn!(target: "lock", "Removing stale lock {}", path.display());
                    match fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_error(e)),
                    }
                }
                Err(e) => return Err(io_error(e)),
            }
        }

        Err(io_error(io::Error::new(
            io::ErrorKind::WouldBlock,
            "lock kept changing hands",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .map(|pid| pid.trim() == std::process::id().to_string())
            .unwrap_or(false);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!(target: "lock", "Releasing {} failed: {e}", self.path.display());
            }
        }
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
