//! The output-change daemon.
//!
//! A single long-lived process per repository owns a recursive filesystem
//! watcher and a map of task hash to watched output globs. Runs ask it
//! "have the outputs for hash H changed since they were written?" and skip
//! re-checking the filesystem when the answer is no.
//!
//! Every daemon interaction is a best-effort optimization: any failure
//! degrades the engine to direct filesystem checks and is never fatal.

mod client;
mod glob_watcher;
mod proto;
#[cfg(unix)]
mod server;

pub use client::{DaemonClient, DaemonConnector};
pub use glob_watcher::GlobWatcher;
pub use proto::{Request, Response};
#[cfg(unix)]
pub use server::{CloseReason, DaemonServer};
use thiserror::Error;
use turbopath::AbsoluteSystemPath;

/// Wire protocol version. The first RPC is `Hello`; a mismatch shuts the
/// daemon down so a fresh one with the right version can take its place.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is unavailable: {0}")]
    Unavailable(String),
    #[error("daemon version mismatch")]
    VersionMismatch,
    #[error("daemon returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("daemon request failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not acquire daemon lock: {0}")]
    Pidlock(#[from] turborepo_pidlock::PidlockError),
    #[error("daemon is not supported on this platform")]
    Unsupported,
}

/// Filesystem locations owned by the daemon, derived from the repo root so
/// that every clone gets its own socket and lock under the OS tempdir.
#[derive(Debug, Clone)]
pub struct Paths {
    pub daemon_root: std::path::PathBuf,
}

impl Paths {
    pub fn from_repo_root(repo_root: &AbsoluteSystemPath) -> Self {
        let repo_hash = turborepo_hash::hash_bytes(repo_root.as_str());
        let daemon_root = std::env::temp_dir()
            .join("turbod")
            .join(&repo_hash[..turborepo_hash::DISPLAYED_HASH_LENGTH]);
        Self { daemon_root }
    }

    pub fn pid_file(&self) -> std::path::PathBuf {
        self.daemon_root.join("turbod.pid")
    }

    pub fn sock_file(&self) -> std::path::PathBuf {
        self.daemon_root.join("turbod.sock")
    }
}

#[cfg(test)]
mod tests {
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_paths_are_stable_per_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();

        let first = Paths::from_repo_root(&repo_root);
        let second = Paths::from_repo_root(&repo_root);
        assert_eq!(first.daemon_root, second.daemon_root);
        assert_eq!(first.pid_file().file_name().unwrap(), "turbod.pid");
        assert_eq!(first.sock_file().file_name().unwrap(), "turbod.sock");
    }

    #[test]
    fn test_paths_differ_between_repos() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let root_a = AbsoluteSystemPathBuf::try_from(dir_a.path()).unwrap();
        let root_b = AbsoluteSystemPathBuf::try_from(dir_b.path()).unwrap();

        assert_ne!(
            Paths::from_repo_root(&root_a).daemon_root,
            Paths::from_repo_root(&root_b).daemon_root
        );
    }
}
