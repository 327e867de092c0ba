#![deny(clippy::all)]
//! The lockfile capability consumed by the task engine.
//!
//! Parsing package-manager lockfiles is a concern of the embedding tool; the
//! engine only needs to ask "which external packages does this workspace
//! resolve to" so that their keys and versions can feed the task hash.

use std::fmt::Debug;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("lockfile is unreadable: {0}")]
    Unreadable(String),
    #[error("workspace {0} is missing from the lockfile")]
    MissingWorkspace(String),
}

/// An external package pinned by the lockfile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Package {
    pub key: String,
    pub version: String,
}

/// Access to resolved external dependencies, supplied by the caller.
pub trait Lockfile: Debug + Send + Sync {
    /// The transitive set of external packages resolved for the workspace at
    /// the given repo-relative unix directory. Order does not matter; the
    /// hash sorts.
    fn external_packages(&self, workspace_dir: &str) -> Result<Vec<Package>, Error>;

    /// Whether a change between two lockfiles invalidates every workspace,
    /// e.g. a registry or lockfile-version switch.
    fn global_change(&self, other: &dyn Lockfile) -> bool;
}

/// Capability for repos without a lockfile: no external packages anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockfile;

impl Lockfile for NoopLockfile {
    fn external_packages(&self, _workspace_dir: &str) -> Result<Vec<Package>, Error> {
        Ok(Vec::new())
    }

    fn global_change(&self, _other: &dyn Lockfile) -> bool {
        false
    }
}
