use std::{io::Write, sync::Arc};

use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_cache::{AsyncCache, CacheError, CacheHitMetadata, CacheSource, CacheState};
use turborepo_globwalk::{globwalk, WalkType};

use crate::{
    cli::OutputLogsMode,
    daemon::DaemonClient,
    opts::RunCacheOpts,
    task_id::TaskId,
    turbo_json::{TaskDefinition, TaskOutputs},
};

/// Run-wide cache handle: the async cache plus the run's cache-behavior
/// flags and the optional daemon connection.
pub struct RunCache {
    task_output_logs_override: Option<OutputLogsMode>,
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
    daemon_client: tokio::sync::Mutex<Option<DaemonClient>>,
}

impl RunCache {
    pub fn new(
        cache: AsyncCache,
        repo_root: &AbsoluteSystemPath,
        opts: &RunCacheOpts,
        daemon_client: Option<DaemonClient>,
    ) -> Self {
        RunCache {
            task_output_logs_override: opts.task_output_logs_override,
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
            daemon_client: tokio::sync::Mutex::new(daemon_client),
        }
    }

    /// Scopes the run cache down to one task instance.
    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        package_dir: &turbopath::AnchoredSystemPath,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let log_file_path = self
            .repo_root
            .resolve(&package_dir.to_owned())
            .join_components(&[".turbo", &format!("turbo-{}.log", task_id.task())]);
        let repo_relative_globs =
            task_definition.repo_relative_hashable_outputs(&task_id, &package_dir.to_unix());

        let mut task_output_logs = task_definition.output_logs;
        if let Some(task_output_logs_override) = self.task_output_logs_override {
            task_output_logs = task_output_logs_override;
        }

        TaskCache {
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_owned(),
            task_id,
            task_output_logs,
            caching_disabled: !task_definition.cacheable(),
            log_file_path,
            expanded_outputs: Vec::new(),
        }
    }

    /// Flushes pending cache writes.
    pub async fn shutdown_cache(&self) {
        self.cache.shutdown().await;
    }
}

/// The cache interface for a single task instance.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
    expanded_outputs: Vec<AnchoredSystemPathBuf>,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    pub fn log_file_path(&self) -> &AbsoluteSystemPath {
        &self.log_file_path
    }

    pub fn expanded_outputs(&self) -> &[AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    /// Cache presence in each layer, for dry runs and summaries. Never
    /// restores anything.
    pub async fn exists(&self) -> CacheState {
        if self.caching_disabled {
            return CacheState::default();
        }
        self.run_cache.cache.exists(&self.hash).await
    }

    /// Copies the captured log from a previous run to `output`, used when a
    /// cache hit replays what the task printed.
    pub fn replay_log_file(&self, output: &mut impl Write) -> Result<(), std::io::Error> {
        if !self.log_file_path.exists() {
            return Ok(());
        }
        let contents = self.log_file_path.read()?;
        output.write_all(&contents)
    }

    /// Attempts to satisfy the task from cache.
    ///
    /// The daemon is consulted first: when it reports that no output glob
    /// changed since the entry was written, the on-disk outputs are already
    /// correct and no restoration happens at all.
    pub async fn restore_outputs(&mut self) -> Result<Option<CacheHitMetadata>, CacheError> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }

        let changed_globs = self.changed_output_globs().await;
        if let Some(changed) = changed_globs {
            if changed.is_empty() {
                debug!(
                    "daemon reports unchanged outputs for {}, skipping restore",
                    self.task_id
                );
                return Ok(Some(CacheHitMetadata {
                    source: CacheSource::Local,
                    time_saved: 0,
                }));
            }
        }

        let Some((metadata, restored_files)) = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await?
        else {
            return Ok(None);
        };
        self.expanded_outputs = restored_files;

        self.notify_outputs_written(metadata.time_saved).await;
        Ok(Some(metadata))
    }

    /// Enumerates the task's outputs on disk and stores them, log included.
    pub async fn save_outputs(&mut self, duration: u64) -> Result<(), CacheError> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        let files = globwalk(
            &self.run_cache.repo_root,
            &self.repo_relative_globs.inclusions,
            &self.repo_relative_globs.exclusions,
            WalkType::All,
        )
        .map_err(|err| {
            CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
        })?;

        let mut anchored_files = Vec::with_capacity(files.len());
        for file in files {
            anchored_files.push(self.run_cache.repo_root.anchor(&file)?);
        }

        self.run_cache
            .cache
            .put(
                self.hash.clone(),
                self.task_id.to_string(),
                anchored_files.clone(),
                duration,
            )
            .await?;
        self.expanded_outputs = anchored_files;

        self.notify_outputs_written(duration).await;
        Ok(())
    }

    async fn changed_output_globs(&self) -> Option<Vec<String>> {
        let mut daemon = self.run_cache.daemon_client.lock().await;
        let client = daemon.as_mut()?;
        match client
            .get_changed_outputs(self.hash.clone(), self.repo_relative_globs.inclusions.clone())
            .await
        {
            Ok(changed) => Some(changed),
            Err(err) => {
                // Daemon trouble downgrades to direct filesystem checks.
                warn!("failed to query daemon for changed outputs: {err}");
                *daemon = None;
                None
            }
        }
    }

    async fn notify_outputs_written(&self, time_saved: u64) {
        let mut daemon = self.run_cache.daemon_client.lock().await;
        let Some(client) = daemon.as_mut() else {
            return;
        };
        if let Err(err) = client
            .notify_outputs_written(
                self.hash.clone(),
                self.repo_relative_globs.inclusions.clone(),
                self.repo_relative_globs.exclusions.clone(),
                time_saved,
            )
            .await
        {
            warn!("failed to notify daemon of written outputs: {err}");
            *daemon = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use camino::Utf8Path;
    use turbopath::AnchoredSystemPath;
    use turborepo_cache::{CacheMultiplexer, CacheOpts};

    use super::*;
    use crate::turbo_json::TaskInputs;

    fn run_cache(repo_root: &AbsoluteSystemPath, opts: RunCacheOpts) -> Result<Arc<RunCache>> {
        let cache_opts = CacheOpts {
            cache_dir: Utf8Path::new("cache").to_owned(),
            skip_remote: true,
            ..Default::default()
        };
        let multiplexer = CacheMultiplexer::new(&cache_opts, repo_root, None)?;
        let cache = AsyncCache::new(multiplexer, repo_root, 2);
        Ok(Arc::new(RunCache::new(cache, repo_root, &opts, None)))
    }

    fn build_definition() -> TaskDefinition {
        TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec![],
            },
            inputs: TaskInputs::default(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_then_restore() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let package_dir = repo_root.join_components(&["packages", "web"]);
        package_dir.join_component("dist").create_dir_all()?;
        package_dir
            .join_components(&["dist", "main.js"])
            .create_with_contents("bundle")?;
        package_dir.join_component(".turbo").create_dir_all()?;
        package_dir
            .join_components(&[".turbo", "turbo-build.log"])
            .create_with_contents("build output\n")?;

        let run_cache = run_cache(&repo_root, RunCacheOpts::default())?;
        let task_id = TaskId::new("web", "build").into_owned();
        let definition = build_definition();
        let package_rel = AnchoredSystemPath::new("packages/web")?;

        let mut task_cache =
            run_cache.task_cache(&definition, package_rel, task_id.clone(), &"a".repeat(64));
        task_cache.save_outputs(1500).await?;
        run_cache.shutdown_cache().await;

        // Wipe outputs, then restore from cache.
        package_dir.join_component("dist").remove_dir_all()?;
        let mut task_cache =
            run_cache.task_cache(&definition, package_rel, task_id, &"a".repeat(64));
        let hit = task_cache.restore_outputs().await?.unwrap();
        assert_eq!(hit.time_saved, 1500);
        assert!(package_dir.join_components(&["dist", "main.js"]).exists());

        let mut replayed = Vec::new();
        task_cache.replay_log_file(&mut replayed)?;
        assert_eq!(replayed, b"build output\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_force_skips_reads_but_still_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let package_dir = repo_root.join_components(&["packages", "web"]);
        package_dir.join_component("dist").create_dir_all()?;
        package_dir
            .join_components(&["dist", "main.js"])
            .create_with_contents("bundle")?;

        let opts = RunCacheOpts {
            skip_reads: true,
            ..Default::default()
        };
        let run_cache = run_cache(&repo_root, opts)?;
        let task_id = TaskId::new("web", "build").into_owned();
        let definition = build_definition();
        let package_rel = AnchoredSystemPath::new("packages/web")?;

        let mut task_cache =
            run_cache.task_cache(&definition, package_rel, task_id.clone(), &"b".repeat(64));
        task_cache.save_outputs(100).await?;
        run_cache.shutdown_cache().await;

        let mut task_cache =
            run_cache.task_cache(&definition, package_rel, task_id, &"b".repeat(64));
        assert!(task_cache.restore_outputs().await?.is_none());
        // The entry is present even though reads are disabled.
        assert!(task_cache.exists().await.local);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_cacheable_task_never_caches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let run_cache = run_cache(&repo_root, RunCacheOpts::default())?;

        let definition = TaskDefinition {
            cache: false,
            ..build_definition()
        };
        let task_id = TaskId::new("web", "dev").into_owned();
        let package_rel = AnchoredSystemPath::new("packages/web")?;

        let mut task_cache =
            run_cache.task_cache(&definition, package_rel, task_id, &"c".repeat(64));
        assert!(task_cache.is_caching_disabled());
        task_cache.save_outputs(100).await?;
        run_cache.shutdown_cache().await;
        assert!(task_cache.restore_outputs().await?.is_none());
        assert_eq!(task_cache.exists().await, CacheState::default());
        Ok(())
    }
}
