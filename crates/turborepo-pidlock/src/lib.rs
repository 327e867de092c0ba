#![deny(clippy::all)]
//! A pid-file lock used to keep the daemon a singleton per repository.
//!
//! A lock is "acquired" when a file exists at the agreed path containing the
//! pid of a live process. Stale files (from a crashed daemon) are detected by
//! probing the recorded pid and cleaned up automatically.

use std::{fs, io, path::PathBuf, process};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PidlockError {
    /// The lock is held by a live process.
    #[error("lock at {0} is owned by a running process")]
    AlreadyOwned(PathBuf),
    /// An operation was attempted in the wrong state, e.g. releasing before
    /// acquiring.
    #[error("invalid lock state")]
    InvalidState,
    #[error("pid file error at {1}: {0}")]
    Io(io::Error, PathBuf),
}

#[derive(Debug, PartialEq)]
enum PidlockState {
    New,
    Acquired,
    Released,
}

/// Check whether a process exists, to decide whether a pid file is stale.
fn process_exists(pid: i32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 performs error checking without delivering a signal.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::{
            Foundation::{CloseHandle, STILL_ACTIVE},
            System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION},
        };
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION, 0, pid as u32);
        let mut code = 0;
        GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        code == STILL_ACTIVE as u32
    }
}

pub struct Pidlock {
    pid: u32,
    path: PathBuf,
    state: PidlockState,
}

impl Pidlock {
    pub fn new(path: PathBuf) -> Self {
        Self {
            pid: process::id(),
            path,
            state: PidlockState::New,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// The pid recorded in the lock file, if the file exists and is owned by
    /// a live process.
    pub fn get_owner(&self) -> Result<Option<u32>, PidlockError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let pid = contents.trim().parse::<i32>().ok();
                match pid {
                    Some(pid) if process_exists(pid) => Ok(Some(pid as u32)),
                    _ => Ok(None),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PidlockError::Io(err, self.path.clone())),
        }
    }

    /// Acquires the lock, replacing a stale pid file if one is found.
    pub fn acquire(&mut self) -> Result<(), PidlockError> {
        if self.state != PidlockState::New {
            return Err(PidlockError::InvalidState);
        }
        if self.get_owner()?.is_some() {
            return Err(PidlockError::AlreadyOwned(self.path.clone()));
        }
        if self.path.exists() {
            warn!("removing stale pid file at {}", self.path.display());
            fs::remove_file(&self.path).map_err(|e| PidlockError::Io(e, self.path.clone()))?;
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PidlockError::Io(e, self.path.clone()))?;
        }
        fs::write(&self.path, format!("{}\n", self.pid))
            .map_err(|e| PidlockError::Io(e, self.path.clone()))?;

        self.state = PidlockState::Acquired;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), PidlockError> {
        if self.state != PidlockState::Acquired {
            return Err(PidlockError::InvalidState);
        }
        fs::remove_file(&self.path).map_err(|e| PidlockError::Io(e, self.path.clone()))?;
        self.state = PidlockState::Released;
        Ok(())
    }
}

impl Drop for Pidlock {
    fn drop(&mut self) {
        if self.state == PidlockState::Acquired {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("turbod.pid")
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Pidlock::new(lock_path(&dir));
        lock.acquire().unwrap();
        assert!(lock.path().exists());
        lock.release().unwrap();
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_live_owner_blocks_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        // The current process is definitionally alive.
        fs::write(&path, format!("{}\n", process::id())).unwrap();

        let mut lock = Pidlock::new(path);
        assert!(matches!(
            lock.acquire(),
            Err(PidlockError::AlreadyOwned(_))
        ));
    }

    #[test]
    fn test_stale_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        // Garbage contents are treated the same as a dead pid.
        fs::write(&path, "not-a-pid\n").unwrap();

        let mut lock = Pidlock::new(path);
        lock.acquire().unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), process::id());
    }

    #[test]
    fn test_release_before_acquire_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Pidlock::new(lock_path(&dir));
        assert!(matches!(lock.release(), Err(PidlockError::InvalidState)));
    }

    #[test]
    fn test_drop_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        {
            let mut lock = Pidlock::new(path.clone());
            lock.acquire().unwrap();
        }
        assert!(!path.exists());
    }
}
