use std::{
    collections::HashSet,
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Instant,
};

use chrono::Local;
use futures::{stream::FuturesUnordered, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_cache::CacheSource;
use turborepo_env::EnvironmentVariableMap;
use turborepo_hash::short_hash;

use crate::{
    cli::{LogOrder, OutputLogsMode},
    engine::{Engine, ExecuteError, ExecutionOptions, Message, StopExecution, TaskNode},
    opts::RunOpts,
    package_graph::{PackageGraph, PackageName},
    process::{ChildExit, Command, ProcessManager},
    run::{
        cache::{RunCache, TaskCache},
        summary::{
            CacheStatus, CacheSummary, ExecutionTracker, TaskExecutionSummary, TaskOutcome,
            TaskSummary,
        },
    },
    task_hash::TaskHasher,
    task_id::{TaskId, ROOT_PKG_NAME},
    ui::PrefixedWriter,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error(
        "root task {task_name} ({command}) looks like it invokes turbo and might cause a loop"
    )]
    RecursiveTurbo { task_name: String, command: String },
    #[error("Could not find definition for task")]
    MissingDefinition,
    #[error("error while executing engine: {0}")]
    Engine(#[from] ExecuteError),
    #[error(transparent)]
    Hash(#[from] crate::task_hash::Error),
}

/// A task that exited unsuccessfully.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task_id: String,
    pub exit_code: Option<i32>,
}

/// What the walk produced: per-task summaries for reporting plus every
/// failure.
#[derive(Debug, Default)]
pub struct VisitResult {
    pub task_summaries: Vec<TaskSummary>,
    pub errors: Vec<TaskError>,
}

/// Drives every task the engine emits through preflight, cache lookup,
/// execution, and bookkeeping.
pub struct Visitor<'a> {
    repo_root: &'a AbsoluteSystemPath,
    package_graph: Arc<PackageGraph>,
    run_cache: Arc<RunCache>,
    task_hasher: &'a TaskHasher<'a>,
    run_opts: &'a RunOpts,
    manager: ProcessManager,
    execution_tracker: ExecutionTracker,
}

impl<'a> Visitor<'a> {
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        task_hasher: &'a TaskHasher<'a>,
        run_opts: &'a RunOpts,
        manager: ProcessManager,
        execution_tracker: ExecutionTracker,
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            run_cache,
            task_hasher,
            run_opts,
            manager,
            execution_tracker,
        }
    }

    pub async fn visit(&self, engine: Arc<Engine>) -> Result<VisitResult, Error> {
        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(std::cmp::max(concurrency, 1));

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency),
                node_sender,
            ))
        };

        let is_dry_run = self.run_opts.dry_run.is_some();
        let stopped = Arc::new(AtomicBool::new(false));
        let unusable: Arc<Mutex<HashSet<TaskId<'static>>>> = Arc::default();
        let summaries: Arc<Mutex<Vec<TaskSummary>>> = Arc::default();
        let errors: Arc<Mutex<Vec<TaskError>>> = Arc::default();

        let mut tasks = FuturesUnordered::new();

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let task_id = info;

            let package_name = PackageName::from(task_id.package());
            let package_json = self
                .package_graph
                .package_json(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: task_id.clone(),
                })?;
            let package_dir = self
                .package_graph
                .package_dir(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: task_id.clone(),
                })?;

            let command = package_json.scripts.get(task_id.task()).cloned();
            if let Some(cmd) = &command {
                if task_id.package() == ROOT_PKG_NAME && turbo_regex().is_match(cmd) {
                    engine_handle.abort();
                    return Err(Error::RecursiveTurbo {
                        task_name: task_id.to_string(),
                        command: cmd.clone(),
                    });
                }
            }

            let task_definition = engine
                .task_definition(&task_id)
                .ok_or(Error::MissingDefinition)?;

            // Hashing happens inline: every dependency has been acknowledged
            // by the time a task is emitted, so its hash is in the tracker.
            let dependency_hashes = self.task_hasher.dependency_hashes(&engine, &task_id);
            let task_hash =
                self.task_hasher
                    .calculate_task_hash(&task_id, task_definition, dependency_hashes)?;
            let task_env = self.task_hasher.task_env(task_definition, &task_hash)?;

            let task_cache = self.run_cache.task_cache(
                task_definition,
                package_dir,
                task_id.clone(),
                &task_hash,
            );

            let (dependencies, dependents) = task_relationships(&engine, &task_id);
            let exec_context = ExecContext {
                task_id: task_id.clone(),
                task_hash,
                command,
                package_dir_absolute: self.repo_root.resolve(&package_dir.to_owned()),
                task_env,
                env_var_hashes: self
                    .task_hasher
                    .task_hash_tracker()
                    .env_vars(&task_id)
                    .map(|vars| vars.hashes())
                    .unwrap_or_default(),
                resolved_definition: task_definition.clone(),
                dependencies,
                dependents,
                task_cache,
                manager: self.manager.clone(),
                execution_tracker: self.execution_tracker.clone(),
                continue_on_error: self.run_opts.continue_on_error,
                is_dry_run,
                persistent: task_definition.persistent,
                log_order: self.run_opts.log_order,
                stopped: stopped.clone(),
                unusable: unusable.clone(),
                summaries: summaries.clone(),
                errors: errors.clone(),
            };

            tasks.push(tokio::spawn(async move {
                let result = exec_context.run().await;
                callback.send(result).ok();
            }));
        }

        while let Some(result) = tasks.next().await {
            result.expect("task executor panicked");
        }
        engine_handle.await.expect("engine execution panicked")?;

        // Writes queued by successful tasks still land, cancellation or not.
        self.run_cache.shutdown_cache().await;

        let task_summaries = std::mem::take(
            &mut *summaries.lock().expect("summary collection lock"),
        );
        let errors = std::mem::take(&mut *errors.lock().expect("error collection lock"));
        Ok(VisitResult {
            task_summaries,
            errors,
        })
    }
}

fn task_relationships(
    engine: &Engine,
    task_id: &TaskId<'static>,
) -> (Vec<TaskId<'static>>, Vec<TaskId<'static>>) {
    let collect = |nodes: Option<HashSet<&TaskNode>>| -> Vec<TaskId<'static>> {
        let mut ids: Vec<_> = nodes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Root => None,
                TaskNode::Task(id) => Some(id.clone()),
            })
            .collect();
        ids.sort();
        ids
    };
    (
        collect(engine.dependencies(task_id)),
        collect(engine.dependents(task_id)),
    )
}

fn turbo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)turbo(?:$|\s)").expect("regex is valid"))
}

/// Everything one task needs to go from Ready to a terminal state.
struct ExecContext {
    task_id: TaskId<'static>,
    task_hash: String,
    command: Option<String>,
    package_dir_absolute: AbsoluteSystemPathBuf,
    task_env: EnvironmentVariableMap,
    env_var_hashes: std::collections::HashMap<String, String>,
    resolved_definition: crate::turbo_json::TaskDefinition,
    dependencies: Vec<TaskId<'static>>,
    dependents: Vec<TaskId<'static>>,
    task_cache: TaskCache,
    manager: ProcessManager,
    execution_tracker: ExecutionTracker,
    continue_on_error: bool,
    is_dry_run: bool,
    persistent: bool,
    log_order: LogOrder,
    stopped: Arc<AtomicBool>,
    unusable: Arc<Mutex<HashSet<TaskId<'static>>>>,
    summaries: Arc<Mutex<Vec<TaskSummary>>>,
    errors: Arc<Mutex<Vec<TaskError>>>,
}

impl ExecContext {
    async fn run(mut self) -> Result<(), StopExecution> {
        if self.is_dry_run {
            self.execute_dry_run().await;
            return Ok(());
        }

        // Skip without running when the run has been stopped or an upstream
        // task failed; the two are distinguishable in the summary.
        if self.stopped.load(Ordering::Relaxed) || self.has_unusable_dependency() {
            self.record_skip();
            return Ok(());
        }

        self.execute().await
    }

    fn has_unusable_dependency(&self) -> bool {
        let unusable = self.unusable.lock().expect("unusable set lock");
        self.dependencies.iter().any(|dep| unusable.contains(dep))
    }

    fn mark_unusable(&self) {
        self.unusable
            .lock()
            .expect("unusable set lock")
            .insert(self.task_id.clone());
    }

    fn record_skip(&self) {
        // "stopped" covers cancellation and fail-fast; the other arm is a
        // failed transitive dependency under --continue.
        let reason = if self.stopped.load(Ordering::Relaxed) {
            "the run was stopped before this task started"
        } else {
            "a task it depends on failed"
        };
        debug!("skipping {}: {reason}", self.task_id);
        self.mark_unusable();
        self.execution_tracker.record(TaskOutcome::Skipped);
        self.push_summary(CacheSummary::default(), None, Some(reason));
    }

    async fn execute_dry_run(&mut self) {
        let cache_state = self.task_cache.exists().await;
        self.push_summary(CacheSummary::miss(cache_state), None, None);
    }

    async fn execute(&mut self) -> Result<(), StopExecution> {
        let output_logs = self.task_cache.output_logs();

        match self.task_cache.restore_outputs().await {
            Ok(Some(cache_hit)) => {
                match output_logs {
                    OutputLogsMode::Full => {
                        self.print_status_line("cache hit, replaying output");
                        self.replay_logs();
                    }
                    OutputLogsMode::HashOnly => {
                        self.print_status_line("cache hit, suppressing output");
                    }
                    OutputLogsMode::NewOnly
                    | OutputLogsMode::ErrorsOnly
                    | OutputLogsMode::None => {}
                }
                self.execution_tracker.record(TaskOutcome::BuiltFromCache);
                self.push_summary(
                    CacheSummary {
                        local: cache_hit.source == CacheSource::Local,
                        remote: cache_hit.source == CacheSource::Remote,
                        status: CacheStatus::Hit,
                        time_saved: cache_hit.time_saved,
                    },
                    None,
                    None,
                );
                return Ok(());
            }
            Ok(None) => {}
            // A failed restore is a miss; the task reruns and overwrites
            // whatever was corrupt.
            Err(err) => warn!("failed to restore outputs for {}: {err}", self.task_id),
        }

        match output_logs {
            OutputLogsMode::Full | OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                self.print_status_line("cache miss, executing");
            }
            OutputLogsMode::ErrorsOnly | OutputLogsMode::None => {}
        }

        let Some(command) = self.command.clone() else {
            // Nothing to run for this package; treated as an instant
            // success so dependents can proceed.
            self.execution_tracker.record(TaskOutcome::Built);
            self.push_summary(CacheSummary::default(), None, None);
            return Ok(());
        };

        let mut cmd = shell_command(&command);
        cmd.current_dir(self.package_dir_absolute.clone());
        cmd.env_clear();
        cmd.envs(self.task_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let start = Instant::now();
        let start_ms = Local::now().timestamp_millis();
        let Some(spawn_result) = self.manager.spawn(cmd) else {
            // The manager is closing because the run is being cancelled.
            self.record_skip();
            return Ok(());
        };
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(err) => {
                warn!("failed to spawn {}: {err}", self.task_id);
                return self.record_failure(None, start_ms);
            }
        };

        let to_terminal = matches!(
            self.task_cache.output_logs(),
            OutputLogsMode::Full | OutputLogsMode::NewOnly
        );
        let grouped = self.log_order == LogOrder::Grouped;
        // In grouped mode output is buffered and printed as one block when
        // the task finishes instead of interleaving line by line.
        let mut group_buffer: Option<Vec<u8>> = (to_terminal && grouped).then(Vec::new);

        let exit = {
            let log_file = self.task_cache.log_file_path();
            if let Err(err) = log_file.ensure_dir() {
                warn!("cannot create log directory for {}: {err}", self.task_id);
            }
            let mut log_writer = match log_file.open_with_options({
                let mut options = std::fs::OpenOptions::new();
                options.write(true).create(true).truncate(true);
                options
            }) {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!("cannot open log file for {}: {err}", self.task_id);
                    None
                }
            };

            let mut prefixed = (to_terminal && !grouped)
                .then(|| PrefixedWriter::new(self.output_prefix(), std::io::stdout()));

            let mut sinks: Vec<&mut (dyn Write + Send)> = Vec::new();
            if let Some(log_writer) = log_writer.as_mut() {
                sinks.push(log_writer);
            }
            if let Some(prefixed) = prefixed.as_mut() {
                sinks.push(prefixed);
            }
            if let Some(group_buffer) = group_buffer.as_mut() {
                sinks.push(group_buffer);
            }
            let writer = crate::ui::MultiWriter::new(sinks);
            child.wait_with_piped_outputs(writer).await
        };

        if let Some(buffer) = group_buffer {
            let mut writer = PrefixedWriter::new(self.output_prefix(), std::io::stdout());
            let _ = writer.write_all(&buffer);
            let _ = writer.flush();
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        match exit {
            Ok(Some(ChildExit::Finished(Some(0)))) => {
                if !self.persistent {
                    if let Err(err) = self.task_cache.save_outputs(duration_ms).await {
                        // A failed write is logged; the task still succeeded.
                        warn!("failed to cache outputs for {}: {err}", self.task_id);
                    }
                }
                self.execution_tracker.record(TaskOutcome::Built);
                self.push_summary(
                    CacheSummary::default(),
                    Some(TaskExecutionSummary {
                        start_time: start_ms,
                        end_time: Local::now().timestamp_millis(),
                        exit_code: Some(0),
                    }),
                    None,
                );
                Ok(())
            }
            Ok(exit) => {
                let exit_code = match exit {
                    Some(ChildExit::Finished(code)) => code,
                    _ => None,
                };
                if self.task_cache.output_logs() == OutputLogsMode::ErrorsOnly {
                    self.print_status_line("finished with error");
                    self.replay_logs();
                }
                self.record_failure(exit_code, start_ms)
            }
            Err(err) => {
                warn!("error capturing output of {}: {err}", self.task_id);
                self.record_failure(None, start_ms)
            }
        }
    }

    fn record_failure(&self, exit_code: Option<i32>, start_ms: i64) -> Result<(), StopExecution> {
        self.mark_unusable();
        self.execution_tracker.record(TaskOutcome::Failed);
        self.errors
            .lock()
            .expect("error collection lock")
            .push(TaskError {
                task_id: self.task_id.to_string(),
                exit_code,
            });
        self.push_summary(
            CacheSummary::default(),
            Some(TaskExecutionSummary {
                start_time: start_ms,
                end_time: Local::now().timestamp_millis(),
                exit_code,
            }),
            None,
        );

        if self.continue_on_error {
            Ok(())
        } else {
            self.stopped.store(true, Ordering::Relaxed);
            Err(StopExecution)
        }
    }

    fn output_prefix(&self) -> String {
        if self.task_id.package() == ROOT_PKG_NAME {
            // Single-package repos and root tasks prefix with the bare task.
            format!("{}: ", self.task_id.task())
        } else {
            format!("{}:{}: ", self.task_id.package(), self.task_id.task())
        }
    }

    fn print_status_line(&self, status: &str) {
        println!(
            "{}{status} {}",
            self.output_prefix(),
            short_hash(&self.task_hash)
        );
    }

    fn replay_logs(&self) {
        let mut writer = PrefixedWriter::new(self.output_prefix(), std::io::stdout());
        if let Err(err) = self.task_cache.replay_log_file(&mut writer) {
            warn!("failed to replay log file for {}: {err}", self.task_id);
        }
        let _ = writer.flush();
    }

    fn push_summary(
        &self,
        cache: CacheSummary,
        execution: Option<TaskExecutionSummary>,
        skipped_reason: Option<&str>,
    ) {
        let summary = TaskSummary {
            task_id: self.task_id.clone(),
            task: self.task_id.task().to_string(),
            package: self.task_id.package().to_string(),
            hash: self.task_hash.clone(),
            command: self.command.clone().unwrap_or_default(),
            cache,
            resolved_task_definition: self.resolved_definition.clone(),
            log_file: self
                .task_cache
                .log_file_path()
                .as_str()
                .to_string(),
            dependencies: self.dependencies.clone(),
            dependents: self.dependents.clone(),
            expanded_outputs: self.task_cache.expanded_outputs().to_vec(),
            environment_variables: self.env_var_hashes.clone(),
            execution,
            skipped_reason: skipped_reason.map(str::to_string),
        };
        self.summaries
            .lock()
            .expect("summary collection lock")
            .push(summary);
    }
}

fn shell_command(script: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.args(["/C", script]);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("turbo run build", true ; "turbo run")]
    #[test_case("turbo build", true ; "bare turbo")]
    #[test_case("npx turbo run build", true ; "npx wrapper")]
    #[test_case("turbofish build", false ; "prefix is not turbo")]
    #[test_case("next build", false ; "unrelated tool")]
    fn test_turbo_loop_guard(command: &str, matches: bool) {
        assert_eq!(turbo_regex().is_match(command), matches);
    }

    #[test]
    fn test_shell_command_runs_through_shell() {
        let cmd = shell_command("echo hello");
        #[cfg(unix)]
        assert!(cmd.label().contains("sh -c echo hello"));
        #[cfg(windows)]
        assert!(cmd.label().contains("cmd.exe /C echo hello"));
    }
}
