#![deny(clippy::all)]
//! Typed path values for turborepo.
//!
//! Paths come in three flavors, each with a borrowed and an owned form:
//! - `AbsoluteSystemPath(Buf)`: absolute, system separators. The only type
//!   that touches the filesystem.
//! - `AnchoredSystemPath(Buf)`: relative to some anchor (usually the repo
//!   root), system separators.
//! - `RelativeUnixPath(Buf)`: relative, forward slashes. The canonical form
//!   for anything that crosses into a hash or a cache archive.
//!
//! Conversions between flavors are explicit. Hashes must be identical across
//! platforms, so a path is converted to its unix form before it is hashed,
//! and converted back to a system path before it is used to touch disk.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;
mod relative_unix_path_buf;

use std::io;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path::RelativeUnixPath;
pub use relative_unix_path_buf::RelativeUnixPathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("Path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("Path is not relative: {0}")]
    NotRelative(String),
    #[error("Path {0} is not a parent of {1}")]
    NotParent(String, String),
    #[error("path is malformed: {0}")]
    MalformedPath(String),
    #[error("IO Error {0}")]
    IO(#[from] io::Error),
}

impl PathError {
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        matches!(self, PathError::IO(err) if err.kind() == kind)
    }
}

/// Converts a system-separated path string to unix separators.
pub(crate) fn to_unix_string(value: &str) -> String {
    #[cfg(windows)]
    {
        value.replace('\\', "/")
    }
    #[cfg(not(windows))]
    {
        value.to_string()
    }
}

/// Converts a unix-separated path string to system separators.
pub(crate) fn to_system_string(value: &str) -> String {
    #[cfg(windows)]
    {
        value.replace('/', "\\")
    }
    #[cfg(not(windows))]
    {
        value.to_string()
    }
}
