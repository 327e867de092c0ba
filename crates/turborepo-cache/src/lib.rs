#![deny(clippy::all)]
//! Content-addressed storage for task outputs.
//!
//! A cache entry is a zstd-compressed tar archive of every path matched by a
//! task's output globs plus its captured log, keyed by the task hash. The
//! local filesystem layer is always consulted first; a configured remote
//! layer is pulled through it. Entries are immutable: the hash is both the
//! key and the identity of the inputs that produced the outputs.

/// A wrapper that performs uploads in the background with bounded workers.
mod async_cache;
/// Archive creation and sandboxed restoration.
pub mod cache_archive;
/// The local filesystem layer.
pub mod fs;
/// The remote HTTP layer.
pub mod http;
/// Layering of local and remote caches.
mod multiplexer;
/// HMAC signing of remote artifacts.
pub mod signature_authentication;

use std::io;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
pub use multiplexer::{CacheMultiplexer, CacheState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid file path: {0}")]
    Path(#[from] turbopath::PathError),
    #[error("failed to contact remote cache: {0}")]
    ApiClient(#[from] turborepo_api_client::Error),
    #[error("signing artifact failed: {0}")]
    Signature(#[from] SignatureError),
    #[error("artifact verification failed: downloaded artifact is missing the x-artifact-tag header")]
    ArtifactTagMissing,
    #[error("invalid artifact verification tag")]
    InvalidTag,
    #[error("invalid artifact duration")]
    InvalidDuration,
    #[error("Invalid cache metadata file")]
    InvalidMetadata(serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(serde_json::Error),
    #[error("tar file is malformed")]
    MalformedTar,
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    #[error("attempted to store unsupported file type")]
    CreateUnsupportedFileType,
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("tar attempts to write through a symlink: {0}")]
    RestoreThroughSymlink(String),
    #[error("unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Local,
    Remote,
}

/// What a cache hit tells the caller beyond "it exists": where it came from
/// and how long the original execution took, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from("node_modules/.cache/turbo"),
            skip_remote: false,
            skip_filesystem: false,
            workers: 8,
            remote_cache_opts: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    pub team_id: Option<String>,
    pub signature: bool,
}
