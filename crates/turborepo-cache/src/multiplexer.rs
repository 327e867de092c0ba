use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};

use crate::{
    fs::FSCache, http::HTTPCache, CacheError, CacheHitMetadata, CacheOpts, CacheSource,
};

/// Whether an entry is present in each configured layer. Used by dry runs
/// and run summaries, which must not restore anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheState {
    pub local: bool,
    pub remote: bool,
}

/// Layers the local and remote caches.
///
/// Reads go local-first; a remote hit seeds the local layer so the next run
/// stays on disk. Remote failures are never fatal: a terminal error (auth,
/// other 4xx) disables the remote layer for the remainder of the run and the
/// engine degrades to local-only.
pub struct CacheMultiplexer {
    fs: Option<FSCache>,
    http: Option<HTTPCache>,
    remote_disabled: AtomicBool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        api_client: Option<(APIClient, APIAuth)>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote;
        // The flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache at all. Worth a warning,
        // not worth failing the build.
        if !use_fs_cache && !use_http_cache {
            warn!("no caches are enabled");
        }

        let fs = use_fs_cache
            .then(|| FSCache::new(&opts.cache_dir, repo_root))
            .transpose()?;
        let http = use_http_cache
            .then(|| api_client.map(|(client, auth)| HTTPCache::new(client, opts, auth)))
            .flatten();

        Ok(CacheMultiplexer {
            fs,
            http,
            remote_disabled: AtomicBool::new(false),
        })
    }

    fn http(&self) -> Option<&HTTPCache> {
        if self.remote_disabled.load(Ordering::Relaxed) {
            return None;
        }
        self.http.as_ref()
    }

    fn disable_remote(&self, err: &CacheError) {
        if !self.remote_disabled.swap(true, Ordering::Relaxed) {
            warn!("remote caching disabled for the rest of this run: {err}");
        }
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        task: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        if let Some(fs) = &self.fs {
            fs.put(anchor, hash, task, files, duration)?;
        }

        if let Some(http) = self.http() {
            if let Err(err) = http.put(anchor, hash, files, duration).await {
                self.disable_remote(&err);
            }
        }

        Ok(())
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            match fs.fetch(anchor, hash) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                // A corrupt local entry is a miss, not a failure; the task
                // reruns and overwrites it.
                Err(err) => warn!("local cache restore failed for {hash}, rebuilding: {err}"),
            }
        }

        if let Some(http) = self.http() {
            match http.fetch_bytes(hash).await {
                Ok(Some((duration, body))) => {
                    // Seed the local layer so the next run never leaves disk.
                    if let Some(fs) = &self.fs {
                        if let Err(err) = fs.put_archive_bytes(hash, None, &body, duration) {
                            warn!("failed to store remote artifact locally: {err}");
                        }
                    }
                    let files = HTTPCache::restore_tar(anchor, &body)?;
                    return Ok(Some((
                        CacheHitMetadata {
                            source: CacheSource::Remote,
                            time_saved: duration,
                        },
                        files,
                    )));
                }
                Ok(None) => {}
                Err(err) => self.disable_remote(&err),
            }
        }

        Ok(None)
    }

    pub async fn exists(&self, hash: &str) -> CacheState {
        let local = self
            .fs
            .as_ref()
            .and_then(|fs| fs.exists(hash).ok())
            .flatten()
            .is_some();

        let remote = match self.http() {
            Some(http) => match http.exists(hash).await {
                Ok(hit) => hit.is_some(),
                Err(err) => {
                    self.disable_remote(&err);
                    false
                }
            },
            None => false,
        };

        CacheState { local, remote }
    }
}
