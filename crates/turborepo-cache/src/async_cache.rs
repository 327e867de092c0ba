use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};

use crate::{multiplexer::CacheState, CacheError, CacheHitMetadata, CacheMultiplexer};

type FetchResult = Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>;

/// The cache handle held by the run.
///
/// Writes happen on background workers bounded by `--cache-workers`, so a
/// slow upload never blocks the task that produced the outputs. Reads are
/// single-flight per hash: concurrent fetches collapse to one restoration
/// and share its result.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    repo_root: AbsoluteSystemPathBuf,
    writer_sem: Arc<Semaphore>,
    writes: Mutex<Vec<JoinHandle<()>>>,
    fetch_results: Arc<tokio::sync::Mutex<HashMap<String, FetchResult>>>,
}

impl AsyncCache {
    pub fn new(
        real_cache: CacheMultiplexer,
        repo_root: &AbsoluteSystemPath,
        max_workers: u32,
    ) -> AsyncCache {
        AsyncCache {
            real_cache: Arc::new(real_cache),
            repo_root: repo_root.to_owned(),
            writer_sem: Arc::new(Semaphore::new(max_workers.max(1) as usize)),
            writes: Mutex::new(Vec::new()),
            fetch_results: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Queues a cache write. The returned future resolves once the write has
    /// been accepted, not once it has completed; `shutdown` waits for
    /// completion.
    pub async fn put(
        &self,
        hash: String,
        task: String,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        let permit = self
            .writer_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CacheError::CacheShuttingDown)?;

        let cache = self.real_cache.clone();
        let repo_root = self.repo_root.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = cache
                .put(&repo_root, &hash, &task, &files, duration)
                .await
            {
                // A failed write never fails the task that produced the
                // outputs.
                warn!("failed to write {hash} to cache: {err}");
            }
        });

        self.writes
            .lock()
            .expect("cache write list is never poisoned")
            .push(handle);
        Ok(())
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<FetchResult, CacheError> {
        // Serializing on the results map gives single-flight per process: a
        // second fetch for the same hash waits here, then reuses the stored
        // outcome instead of restoring again.
        let mut results = self.fetch_results.lock().await;
        if let Some(result) = results.get(hash) {
            return Ok(result.clone());
        }
        let result = self.real_cache.fetch(anchor, hash).await?;
        results.insert(hash.to_string(), result.clone());
        Ok(result)
    }

    pub async fn exists(&self, hash: &str) -> CacheState {
        self.real_cache.exists(hash).await
    }

    /// Waits for all queued writes to land.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .writes
            .lock()
            .expect("cache write list is never poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("cache write worker panicked: {err}");
            }
        }
    }
}
