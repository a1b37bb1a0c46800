//! Advisory pid-file locks.
//!
//! A lock is a small file containing the holder's pid in ascii. Acquisition
//! is an `O_EXCL` create; a leftover file whose pid is no longer alive and
//! whose mtime is older than [`STALE_AFTER`] is broken after re-checking
//! that the pid is still absent.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::warn;

/// How long to keep retrying a lock held by a live process.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// A dead holder's lock file may be broken once it is this old.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("lock file \"{path}\" is held by process {pid}")]
    Busy { path: Utf8PathBuf, pid: i32 },
    #[error("could not access lock file \"{path}\": {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An acquired lock. Dropping the guard releases the lock by unlinking
/// the pid file.
pub struct LockGuard {
    path: Utf8PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove lock file {}: {e}", self.path);
            }
        }
    }
}

fn io_err(path: &Utf8Path, source: io::Error) -> LockError {
    LockError::Io {
        path: path.to_owned(),
        source,
    }
}

fn pid_is_alive(pid: i32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Read the holder pid out of an existing lock file. A file we cannot
/// parse is treated as held by an unknown live process (never broken).
fn read_holder(path: &Utf8Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<i32>().ok()
}

fn try_create(path: &Utf8Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_stale(path: &Utf8Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        // vanished under us, next create attempt decides
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age >= STALE_AFTER)
        .unwrap_or(false)
}

/// Acquire an exclusive pid-file lock, retrying against live holders for
/// up to [`ACQUIRE_TIMEOUT`].
pub fn acquire(path: &Utf8Path) -> Result<LockGuard, LockError> {
    let deadline = SystemTime::now() + ACQUIRE_TIMEOUT;
    loop {
        if try_create(path).map_err(|e| io_err(path, e))? {
            return Ok(LockGuard {
                path: path.to_owned(),
            });
        }

        match read_holder(path) {
            Some(pid) if pid_is_alive(pid) => {
                if SystemTime::now() >= deadline {
                    return Err(LockError::Busy {
                        path: path.to_owned(),
                        pid,
                    });
                }
                std::thread::sleep(RETRY_INTERVAL);
            }
            holder => {
                // Holder is gone (or the file is garbage). Only break the
                // lock once the file is old enough, and re-check the pid
                // right before unlinking.
                if is_stale(path) {
                    if let Some(pid) = holder {
                        if pid_is_alive(pid) {
                            continue;
                        }
                    }
                    warn!("breaking stale lock file {path}");
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(path, e)),
                    }
                } else {
                    std::thread::sleep(RETRY_INTERVAL);
                }
            }
        }
    }
}

/// Verify that no live process holds the lock, without taking it.
/// Used by read-only commands that must not observe in-flight mutations.
pub fn check_unlocked(path: &Utf8Path) -> Result<(), LockError> {
    match read_holder(path) {
        Some(pid) if pid_is_alive(pid) => Err(LockError::Busy {
            path: path.to_owned(),
            pid,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");

        let guard = acquire(&path).unwrap();
        assert!(path.exists());
        let pid = read_holder(&path).unwrap();
        assert_eq!(pid as u32, std::process::id());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn live_holder_blocks_reader() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");

        let _guard = acquire(&path).unwrap();
        // our own pid is alive, so a reader must see the lock as busy
        assert!(matches!(
            check_unlocked(&path),
            Err(LockError::Busy { .. })
        ));
    }

    #[test]
    fn dead_holder_does_not_block_reader() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.pid");

        // pid 0 is never a valid holder; kill(0, ..) targets the process
        // group, but i32::MAX is practically guaranteed to be vacant
        std::fs::write(&path, format!("{}\n", i32::MAX)).unwrap();
        check_unlocked(&path).unwrap();
    }
}
