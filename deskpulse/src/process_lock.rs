//! Process-level lock that keeps a single deskpulse service per database.
//!
//! The lock is an advisory OS file lock (flock) held for the lifetime of the
//! `run` command. The lock file records the owner's pid.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const SERVICE_LOCK_FILE: &str = "deskpulse-service.lock";

/// Held by the `run` command for as long as the service is up.
pub struct ServiceGuard {
    _lock: ProcessLock,
}

/// Acquire the service lock for `db_path`.
///
/// Fails if another service is already running against the same database.
pub fn acquire_service_guard(db_path: &Path) -> Result<ServiceGuard> {
    match try_acquire_lock(SERVICE_LOCK_FILE, db_path)? {
        Some(lock) => Ok(ServiceGuard { _lock: lock }),
        None => anyhow::bail!(
            "another deskpulse service is already running for {}",
            db_path.display()
        ),
    }
}

/// Whether a service currently holds the lock for `db_path`.
pub fn service_running(db_path: &Path) -> Result<bool> {
    Ok(try_acquire_lock(SERVICE_LOCK_FILE, db_path)?.is_none())
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("deskpulse");
    dir
}

/// One lock per database, so test or alternate databases don't collide.
fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("deskpulse process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_guard_is_refused() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data.db");

        let guard = acquire_service_guard(&db_path).unwrap();
        assert!(service_running(&db_path).unwrap());
        assert!(acquire_service_guard(&db_path).is_err());

        drop(guard);
        assert!(!service_running(&db_path).unwrap());
    }

    #[test]
    fn test_locks_are_scoped_per_database() {
        let dir = TempDir::new().unwrap();
        let _a = acquire_service_guard(&dir.path().join("a.db")).unwrap();
        let _b = acquire_service_guard(&dir.path().join("b.db")).unwrap();
    }
}
