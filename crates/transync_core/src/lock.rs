use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

static RUNNING: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

fn registry() -> MutexGuard<'static, BTreeSet<PathBuf>> {
    RUNNING
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Who holds the run lock, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub started_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub running: bool,
    pub holder: Option<LockHolder>,
}

/// Held for the duration of one `make` or `compile`. Dropping it releases
/// both the in-process registration and the advisory file lock.
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
    file: File,
}

impl RunGuard {
    /// Returns `None` when another run, in this process or another one,
    /// already holds `lock_path`.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>> {
        let mut running = registry();
        if running.contains(lock_path) {
            return Ok(None);
        }

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                debug!(path = %lock_path.display(), "lock held by another process");
                return Ok(None);
            }
            Err(TryLockError::Error(error)) => {
                return Err(error)
                    .with_context(|| format!("failed to lock {}", lock_path.display()));
            }
        }

        let holder = LockHolder {
            pid: std::process::id(),
            started_unix: unix_timestamp()?,
        };
        let record = serde_json::to_string(&holder).context("failed to encode lock holder")?;
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(record.as_bytes()))
            .with_context(|| format!("failed to record lock holder in {}", lock_path.display()))?;

        running.insert(lock_path.to_path_buf());
        Ok(Some(Self {
            path: lock_path.to_path_buf(),
            file,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(error) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %error, "failed to clear lock file");
        }
        if let Err(error) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %error, "failed to unlock");
        }
        registry().remove(&self.path);
    }
}

pub fn is_running(lock_path: &Path) -> Result<bool> {
    Ok(lock_status(lock_path)?.running)
}

pub fn lock_status(lock_path: &Path) -> Result<LockStatus> {
    let held_here = registry().contains(lock_path);
    if !lock_path.exists() {
        return Ok(LockStatus {
            running: held_here,
            holder: None,
        });
    }

    let mut file = File::open(lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("failed to read lock file {}", lock_path.display()))?;
    let holder = serde_json::from_str::<LockHolder>(content.trim()).ok();

    let running = held_here
        || match file.try_lock_shared() {
            Ok(()) => {
                file.unlock()
                    .with_context(|| format!("failed to unlock {}", lock_path.display()))?;
                false
            }
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Error(error)) => {
                return Err(error)
                    .with_context(|| format!("failed to probe {}", lock_path.display()));
            }
        };
    Ok(LockStatus {
        running,
        holder: if running { holder } else { None },
    })
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{RunGuard, is_running, lock_status};

    #[test]
    fn second_acquire_is_refused_until_the_guard_drops() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join(".transync/make.lock");
        assert!(!is_running(&path).expect("status"));

        let guard = RunGuard::try_acquire(&path)
            .expect("acquire")
            .expect("first guard");
        assert!(is_running(&path).expect("status"));
        assert!(RunGuard::try_acquire(&path).expect("acquire").is_none());

        let status = lock_status(&path).expect("status");
        assert_eq!(
            status.holder.map(|holder| holder.pid),
            Some(std::process::id())
        );

        drop(guard);
        assert!(!is_running(&path).expect("status"));
        assert!(RunGuard::try_acquire(&path).expect("acquire").is_some());
    }

    #[test]
    fn guard_is_released_when_a_run_panics() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("make.lock");
        let moved = path.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = RunGuard::try_acquire(&moved)
                .expect("acquire")
                .expect("guard");
            panic!("extraction blew up");
        });
        assert!(result.is_err());
        assert!(!is_running(&path).expect("status"));
    }

    #[test]
    fn distinct_lock_paths_do_not_block_each_other() {
        let temp = tempdir().expect("tempdir");
        let first = RunGuard::try_acquire(&temp.path().join("a.lock")).expect("acquire");
        let second = RunGuard::try_acquire(&temp.path().join("b.lock")).expect("acquire");
        assert!(first.is_some());
        assert!(second.is_some());
    }
}
