//! Advisory destination lock.
//!
//! A `(dest_host, new_name)` pair behaves like a mutex for the duration of
//! a clone: two concurrent operations targeting the same destination VM
//! name must not interleave. The lock is a plain file containing the
//! holder's pid and start time; a stale lock (holder process no longer
//! alive) is reclaimed rather than blocking forever.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use crate::error::{Error, Result};

use super::events::Event;
use super::reporter::Reporter;

fn lock_path(state_dir: &Path, dest_host: &str, vm_name: &str) -> PathBuf {
    state_dir.join("locks").join(dest_host).join(format!("{vm_name}.lock"))
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // kill(pid, 0) probes for existence/permission without sending a signal.
    unsafe { libc::kill(pid, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    true
}

/// A held advisory lock; releases on drop.
pub struct Lock {
    path: PathBuf,
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_holder_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

/// Acquire the advisory lock for `(dest_host, vm_name)` under `state_dir`.
/// Reclaims the lock if its recorded holder pid is no longer alive.
pub fn acquire(
    state_dir: &Path,
    dest_host: &str,
    vm_name: &str,
    reporter: &mut dyn Reporter,
) -> Result<Lock> {
    let path = lock_path(state_dir, dest_host, vm_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut reclaimed = false;
    if path.exists() {
        match read_holder_pid(&path) {
            Some(pid) if process_is_alive(pid) => {
                return Err(Error::General {
                    message: format!(
                        "VM `{vm_name}` on {dest_host} is locked by another in-flight operation (pid {pid})"
                    ),
                });
            }
            _ => {
                fs::remove_file(&path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
                reclaimed = true;
            }
        }
    }

    let pid = std::process::id();
    let started = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let mut file = File::create(&path).map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;
    writeln!(file, "{pid}\n{started}").map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;

    reporter.report(Event::LockAcquired {
        dest_host: dest_host.to_string(),
        vm_name: vm_name.to_string(),
        reclaimed_stale: reclaimed,
    });

    Ok(Lock { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases_a_fresh_lock() {
        let dir = tempdir().unwrap();
        let mut events = Vec::new();
        {
            let _lock = acquire(dir.path(), "dest", "v1", &mut events).unwrap();
            assert!(lock_path(dir.path(), "dest", "v1").exists());
        }
        assert!(!lock_path(dir.path(), "dest", "v1").exists());
        assert!(matches!(events[0], Event::LockAcquired { reclaimed_stale: false, .. }));
    }

    #[test]
    fn reclaims_a_lock_left_by_a_dead_pid() {
        let dir = tempdir().unwrap();
        let path = lock_path(dir.path(), "dest", "v1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "999999999\n2020-01-01T00:00:00Z\n").unwrap();

        let mut events = Vec::new();
        let _lock = acquire(dir.path(), "dest", "v1", &mut events).unwrap();
        assert!(matches!(events[0], Event::LockAcquired { reclaimed_stale: true, .. }));
    }

    #[test]
    fn refuses_to_acquire_while_held_by_a_live_process() {
        let dir = tempdir().unwrap();
        let path = lock_path(dir.path(), "dest", "v1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{}\n2020-01-01T00:00:00Z\n", std::process::id())).unwrap();

        let mut events = Vec::new();
        let result = acquire(dir.path(), "dest", "v1", &mut events);
        assert!(result.is_err());
    }
}
