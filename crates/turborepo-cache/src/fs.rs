use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

/// The local filesystem cache layer.
///
/// Entries live in the cache directory as `<hash>.tar.zst` next to a
/// `<hash>-meta.json` sidecar recording the originating task and its
/// duration. Both are written via temp-file-plus-rename so that concurrent
/// invocations sharing the directory never observe partial entries.
pub struct FSCache {
    cache_directory: AbsoluteSystemPathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FSCache {
    pub fn new(cache_dir: &Utf8Path, repo_root: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;
        Ok(FSCache { cache_directory })
    }

    fn archive_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}.tar.zst"))
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory
            .join_component(&format!("{hash}-meta.json"))
    }

    #[tracing::instrument(skip_all)]
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let archive_path = self.archive_path(hash);
        if !archive_path.exists() {
            debug!("local cache miss for {hash}");
            return Ok(None);
        }

        let mut reader = CacheReader::open(&archive_path)?;
        let restored_files = reader.restore(anchor)?;

        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|meta| meta.duration)
            .unwrap_or(0);

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: duration,
            },
            restored_files,
        )))
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if !self.archive_path(hash).exists() {
            return Ok(None);
        }
        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|meta| meta.duration)
            .unwrap_or(0);
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    #[tracing::instrument(skip_all)]
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        task: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut writer = CacheWriter::create(&self.archive_path(hash))?;
        for file in files {
            writer.add_file(anchor, file)?;
        }
        // Atomic rename from the temp file happens here.
        writer.finish()?;

        self.write_metadata(hash, Some(task), duration)
    }

    /// Stores raw archive bytes pulled from the remote layer, so that the
    /// next run hits locally.
    pub fn put_archive_bytes(
        &self,
        hash: &str,
        task: Option<&str>,
        body: &[u8],
        duration: u64,
    ) -> Result<(), CacheError> {
        let final_path = self.archive_path(hash);
        let temp_path = self
            .cache_directory
            .join_component(&format!(".{hash}.tar.zst.{}.tmp", std::process::id()));
        temp_path.create_with_contents(body)?;
        temp_path.rename(&final_path)?;

        self.write_metadata(hash, task, duration)
    }

    fn write_metadata(
        &self,
        hash: &str,
        task: Option<&str>,
        duration: u64,
    ) -> Result<(), CacheError> {
        let meta = CacheMetadata {
            hash: hash.to_string(),
            task: task.map(str::to_string),
            duration,
        };
        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        let temp_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));
        temp_path.create_with_contents(&meta_json)?;
        temp_path.rename(&self.metadata_path(hash))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::AnchoredSystemPathBuf;

    use super::*;

    fn setup() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf, FSCache)> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;
        let cache = FSCache::new(Utf8Path::new("cache"), &repo_root)?;
        Ok((repo, repo_root, cache))
    }

    #[test]
    fn test_miss_then_round_trip() -> Result<()> {
        let (_repo, repo_root, cache) = setup()?;
        let hash = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

        assert!(cache.fetch(&repo_root, hash)?.is_none());
        assert!(cache.exists(hash)?.is_none());

        repo_root.join_component("dist").create_dir_all()?;
        repo_root
            .join_components(&["dist", "out.js"])
            .create_with_contents("built")?;
        let files = vec![
            AnchoredSystemPathBuf::from_raw("dist")?,
            AnchoredSystemPathBuf::from_raw("dist/out.js")?,
        ];
        cache.put(&repo_root, hash, "web#build", &files, 1234)?;

        let exists = cache.exists(hash)?.unwrap();
        assert_eq!(exists.source, CacheSource::Local);
        assert_eq!(exists.time_saved, 1234);

        // Blow away the outputs, then restore from cache.
        repo_root.join_component("dist").remove_dir_all()?;
        let (metadata, restored) = cache.fetch(&repo_root, hash)?.unwrap();
        assert_eq!(metadata.time_saved, 1234);
        assert_eq!(restored.len(), 2);
        assert_eq!(
            repo_root
                .join_components(&["dist", "out.js"])
                .read_to_string()?,
            "built"
        );
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_do_not_corrupt() -> Result<()> {
        let (_repo, repo_root, _) = setup()?;
        let hash = "feedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedface";

        repo_root
            .join_component("artifact.txt")
            .create_with_contents("artifact")?;
        let files = vec![AnchoredSystemPathBuf::from_raw("artifact.txt")?];

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let repo_root = repo_root.clone();
                let files = files.clone();
                std::thread::spawn(move || {
                    let cache = FSCache::new(Utf8Path::new("cache"), &repo_root).unwrap();
                    cache.put(&repo_root, hash, "web#build", &files, 1).unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let cache = FSCache::new(Utf8Path::new("cache"), &repo_root)?;
        assert!(cache.fetch(&repo_root, hash)?.is_some());

        // No temp files may survive.
        let leftovers: Vec<_> = std::fs::read_dir(repo_root.join_component("cache").as_std_path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[test]
    fn test_corrupt_archive_is_an_error() -> Result<()> {
        let (_repo, repo_root, cache) = setup()?;
        let hash = "c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00";

        repo_root
            .join_components(&["cache", &format!("{hash}.tar.zst")])
            .create_with_contents("not a zstd archive")?;

        assert!(cache.fetch(&repo_root, hash).is_err());
        Ok(())
    }
}
