#![deny(clippy::all)]
//! Stable fingerprinting for turborepo.
//!
//! Everything that feeds a cache key goes through this crate so that hashing
//! stays deterministic across platforms and runs. Structured values are
//! serialized to a canonical form (sorted keys, stable number formatting)
//! before being hashed, which makes the hash independent of container
//! insertion order.

mod traits;

use std::io::Read;

use sha2::{Digest, Sha256};
use thiserror::Error;
pub use traits::TurboHash;
use turbopath::AbsoluteSystemPath;

/// Number of hex characters of the full hash shown to users.
pub const DISPLAYED_HASH_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot canonicalize value for hashing: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cannot hash file: {0}")]
    Io(#[from] std::io::Error),
}

/// Hashes raw bytes. Returns the full 64 character lowercase hex digest.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Hashes any serializable value via its canonical serialization.
///
/// `serde_json`'s object representation is backed by a `BTreeMap`, so maps
/// come out with sorted keys no matter how they were built.
pub fn hash_object<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    let canonical = serde_json::to_value(value)?;
    Ok(hash_bytes(serde_json::to_string(&canonical)?))
}

/// Streams a file's contents through the hasher without retaining them.
pub fn hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let mut file = path.open()?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// The truncated form of a hash used for display.
pub fn short_hash(hash: &str) -> &str {
    &hash[..DISPLAYED_HASH_LENGTH.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    #[test]
    fn test_hash_bytes_is_stable() {
        assert_eq!(
            hash_bytes("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_object_ignores_insertion_order() -> Result<()> {
        let mut forward = HashMap::new();
        forward.insert("a", 1);
        forward.insert("b", 2);
        forward.insert("c", 3);

        let mut backward = HashMap::new();
        backward.insert("c", 3);
        backward.insert("b", 2);
        backward.insert("a", 1);

        assert_eq!(hash_object(&forward)?, hash_object(&backward)?);
        Ok(())
    }

    #[test]
    fn test_hash_object_distinguishes_values() -> Result<()> {
        let a = vec!["build", "test"];
        let b = vec!["build", "lint"];
        assert_ne!(hash_object(&a)?, hash_object(&b)?);
        Ok(())
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let file = root.join_component("input.txt");
        file.create_with_contents("file contents")?;

        assert_eq!(hash_file(&file)?, hash_bytes("file contents"));
        Ok(())
    }

    #[test]
    fn test_short_hash() {
        let full = hash_bytes("anything");
        assert_eq!(short_hash(&full).len(), 16);
        assert!(full.starts_with(short_hash(&full)));
    }
}
