pub mod cache;
pub mod global_hash;
pub mod scope;
pub mod summary;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Local;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_api_client::{APIAuth, APIClient};
use turborepo_cache::{AsyncCache, CacheMultiplexer, RemoteCacheOpts};
use turborepo_env::EnvironmentVariableMap;
use turborepo_lockfiles::NoopLockfile;

use crate::{
    cli::{DryRunMode, RunArgs, EXIT_CONFIG_ERROR, EXIT_TASK_FAILURE},
    daemon::{DaemonClient, DaemonConnector, Paths as DaemonPaths},
    engine::EngineBuilder,
    opts::{Opts, DEFAULT_GRACE_PERIOD_SECS},
    package_graph::{PackageGraph, PackageName},
    package_json::PackageJson,
    process::ProcessManager,
    run::{
        cache::RunCache,
        summary::{ExecutionTracker, RunSummary},
    },
    task_graph::{VisitResult, Visitor},
    task_hash::{PackageInputsHashes, TaskHasher},
    task_id::TaskName,
    turbo_json::{TurboJson, TurboJsonLoader},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not find package.json at {0}")]
    MissingRootPackageJson(AbsoluteSystemPathBuf),
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
    #[error(transparent)]
    PackageGraph(#[from] crate::package_graph::Error),
    #[error(transparent)]
    Config(#[from] crate::turbo_json::Error),
    #[error(transparent)]
    EngineBuilder(#[from] crate::engine::BuilderError),
    #[error("Invalid task configuration:\n{0}")]
    EngineValidation(String),
    #[error(transparent)]
    Opts(#[from] crate::opts::Error),
    #[error(transparent)]
    Scope(#[from] scope::Error),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
    #[error(transparent)]
    Hash(#[from] crate::task_hash::Error),
    #[error("Failed to write run summary: {0}")]
    Summary(#[from] summary::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error("Failed to write graph output: {0}")]
    GraphOutput(std::io::Error),
}

impl Error {
    /// Configuration and graph preparation problems exit 2, task failures
    /// exit 1 at the call site.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Visitor(_) => EXIT_TASK_FAILURE,
            _ => EXIT_CONFIG_ERROR,
        }
    }
}

/// Executes `turbo run` end to end and returns the process exit code.
pub async fn run(
    repo_root: AbsoluteSystemPathBuf,
    args: &RunArgs,
    version: &'static str,
) -> Result<i32, Error> {
    let start_time = Local::now();
    let opts = Opts::try_from(args)?;
    if opts.run_opts.since.is_some() {
        warn!("--since requires a source control provider and is ignored");
    }

    let root_package_json_path = repo_root.join_component("package.json");
    if !root_package_json_path.exists() {
        return Err(Error::MissingRootPackageJson(repo_root));
    }
    let root_package_json = PackageJson::load(&root_package_json_path)?;

    let package_graph = Arc::new(
        PackageGraph::builder(&repo_root, root_package_json)
            .with_single_package_mode(opts.run_opts.single_package)
            .with_lockfile(Some(Box::new(NoopLockfile)))
            .build()?,
    );

    let package_dirs: HashMap<PackageName, AbsoluteSystemPathBuf> = package_graph
        .packages()
        .map(|(name, info)| (name.clone(), repo_root.resolve(&info.package_path)))
        .collect();
    let turbo_json_loader = TurboJsonLoader::workspace(repo_root.clone(), package_dirs);
    let root_turbo_json = turbo_json_loader
        .load(&PackageName::Root)?
        .expect("loader errors when the root turbo.json is missing");

    let scoped_packages = scope::resolve_packages(&opts.scope_opts, &package_graph)?;
    let workspaces = if opts.run_opts.single_package {
        vec![PackageName::Root]
    } else {
        scoped_packages
    };

    let engine = EngineBuilder::new(
        &package_graph,
        &turbo_json_loader,
        opts.run_opts.single_package,
    )
    .with_workspaces(workspaces)
    .with_tasks(
        opts.run_opts
            .tasks
            .iter()
            .map(|task| TaskName::from(task.clone())),
    )
    .with_root_tasks(root_turbo_json.root_enabled_tasks())
    .with_tasks_only(opts.run_opts.only)
    .with_scoped_packages_only(opts.run_opts.no_deps)
    .build()?;

    engine
        .validate(&package_graph, opts.run_opts.concurrency)
        .map_err(|errors| {
            Error::EngineValidation(
                errors
                    .iter()
                    .map(|error| error.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;

    if let Some(graph_target) = &opts.run_opts.graph {
        let rendered = engine.dot_graph();
        if graph_target.is_empty() {
            print!("{rendered}");
        } else {
            AbsoluteSystemPathBuf::from_unknown(&repo_root, graph_target.as_str())
                .create_with_contents(rendered)
                .map_err(Error::GraphOutput)?;
        }
        return Ok(0);
    }

    let env_at_execution_start = EnvironmentVariableMap::infer();

    let global_hash = global_hash::get_global_hash_inputs(
        &repo_root,
        &root_turbo_json,
        package_graph.lockfile(),
        &env_at_execution_start,
        opts.run_opts.env_mode,
        opts.run_opts.framework_inference,
    )?
    .calculate();

    let package_inputs_hashes =
        PackageInputsHashes::calculate_file_hashes(&repo_root, &engine, &package_graph)?;

    let task_hasher = TaskHasher::new(
        &package_graph,
        package_inputs_hashes,
        &env_at_execution_start,
        &global_hash,
        opts.run_opts.env_mode,
        root_turbo_json.global_pass_through_env.as_deref(),
        &opts.run_opts.pass_through_args,
    );

    let cache = configure_cache(
        &opts,
        &root_turbo_json,
        &repo_root,
        &env_at_execution_start,
        version,
    )?;

    let daemon_client = connect_daemon(&opts, &root_turbo_json, &repo_root).await;
    let run_cache = Arc::new(RunCache::new(
        cache,
        &repo_root,
        &opts.run_cache_opts,
        daemon_client,
    ));

    let manager = ProcessManager::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS));
    spawn_signal_handler(manager.clone());

    let execution_tracker = ExecutionTracker::default();
    let visitor = Visitor::new(
        &repo_root,
        package_graph.clone(),
        run_cache.clone(),
        &task_hasher,
        &opts.run_opts,
        manager.clone(),
        execution_tracker.clone(),
    );

    let engine = Arc::new(engine);
    let visit_result = visitor.visit(engine.clone()).await?;
    manager.stop().await;

    if let Some(dry_run_mode) = opts.run_opts.dry_run {
        return finish_dry_run(dry_run_mode, &opts, version, global_hash, visit_result);
    }

    let exit_code = if visit_result.errors.is_empty() {
        0
    } else {
        EXIT_TASK_FAILURE
    };

    print_footer(&execution_tracker, start_time);

    if opts.run_opts.summarize {
        let execution = execution_tracker.finish(
            synthesized_command(args),
            start_time,
            exit_code,
        );
        let summary = RunSummary::new(
            version,
            !opts.run_opts.single_package,
            global_hash,
            opts.run_opts.env_mode,
            engine
                .task_ids()
                .map(|task_id| task_id.package().to_string())
                .collect(),
            Some(execution),
            visit_result.task_summaries,
        );
        summary.save(&repo_root)?;
    }

    for error in &visit_result.errors {
        eprintln!(
            "{} task {} failed",
            console::style("ERROR:").red().bold(),
            error.task_id
        );
    }

    Ok(exit_code)
}

fn synthesized_command(args: &RunArgs) -> String {
    let mut command = format!("turbo run {}", args.tasks.join(" "));
    if !args.pass_through_args.is_empty() {
        command.push_str(" -- ");
        command.push_str(&args.pass_through_args.join(" "));
    }
    command
}

fn finish_dry_run(
    mode: DryRunMode,
    opts: &Opts,
    version: &'static str,
    global_hash: String,
    visit_result: VisitResult,
) -> Result<i32, Error> {
    let summary = RunSummary::new(
        version,
        !opts.run_opts.single_package,
        global_hash,
        opts.run_opts.env_mode,
        visit_result
            .task_summaries
            .iter()
            .map(|task| task.package.clone())
            .collect(),
        None,
        visit_result.task_summaries,
    );

    match mode {
        DryRunMode::Json => println!("{}", summary.format_json()?),
        DryRunMode::Text => {
            println!("Tasks to Run");
            for task in &summary.tasks {
                println!("{}", task.task_id);
                println!("  Task\t\t= {}", task.task);
                println!("  Hash\t\t= {}", task.hash);
                println!(
                    "  Cached (Local)\t= {}",
                    task.cache.local
                );
                println!(
                    "  Cached (Remote)\t= {}",
                    task.cache.remote
                );
                println!("  Command\t= {}", task.command);
            }
        }
    }
    Ok(0)
}

fn print_footer(tracker: &ExecutionTracker, start_time: chrono::DateTime<Local>) {
    let attempted = tracker.attempted_count();
    let cached = tracker.cached_count();
    let failed = tracker.failed_count();
    let elapsed = Local::now()
        .signed_duration_since(start_time)
        .num_milliseconds();

    let full_turbo = attempted > 0 && cached == attempted;
    println!();
    println!(" Tasks:    {} successful, {attempted} total", attempted - failed);
    if full_turbo {
        println!(
            "Cached:    {cached} cached, {attempted} total  {}",
            console::style(">>> FULL TURBO").bold().magenta()
        );
    } else {
        println!("Cached:    {cached} cached, {attempted} total");
    }
    println!("  Time:    {}ms", elapsed);
    println!();
}

/// Builds the cache stack: always the local layer unless `--remote-only`,
/// plus the remote layer when a token and team are configured.
fn configure_cache(
    opts: &Opts,
    root_turbo_json: &TurboJson,
    repo_root: &AbsoluteSystemPath,
    env: &EnvironmentVariableMap,
    version: &str,
) -> Result<AsyncCache, Error> {
    let mut cache_opts = opts.cache_opts.clone();

    let remote_config = root_turbo_json.remote_cache.clone().unwrap_or_default();
    let remote_enabled = remote_config.enabled.unwrap_or(true);
    cache_opts.remote_cache_opts = Some(RemoteCacheOpts {
        team_id: None,
        signature: remote_config.signature.unwrap_or(false),
    });

    let token = env
        .get("TURBO_TOKEN")
        .or_else(|| env.get("VERCEL_ARTIFACTS_TOKEN"))
        .cloned();
    let team = env
        .get("TURBO_TEAM")
        .or_else(|| env.get("VERCEL_ARTIFACTS_OWNER"))
        .cloned();
    let api_url = env
        .get("TURBO_API")
        .cloned()
        .unwrap_or_else(|| "https://vercel.com/api".to_string());

    let timeout_secs = env
        .get("TURBO_REMOTE_CACHE_TIMEOUT")
        .and_then(|raw| raw.parse::<u64>().ok())
        .or(remote_config.timeout)
        .unwrap_or(30);

    let api_client = match (remote_enabled, token, team) {
        (true, Some(token), Some(team)) => {
            match APIClient::new(
                &api_url,
                Duration::from_secs(timeout_secs),
                Duration::from_secs(60),
                version,
                remote_config.preflight.unwrap_or(false),
            ) {
                Ok(client) => Some((
                    client,
                    APIAuth {
                        token,
                        team_id: Some(team),
                        team_slug: None,
                    },
                )),
                Err(err) => {
                    warn!("failed to set up remote cache client: {err}");
                    None
                }
            }
        }
        _ => None,
    };
    if api_client.is_none() {
        cache_opts.skip_remote = true;
    }

    let multiplexer = CacheMultiplexer::new(&cache_opts, repo_root, api_client)?;
    Ok(AsyncCache::new(multiplexer, repo_root, cache_opts.workers))
}

/// The daemon is an optional accelerator: failure to connect is logged at
/// debug level and the run proceeds with direct filesystem checks.
async fn connect_daemon(
    opts: &Opts,
    root_turbo_json: &TurboJson,
    repo_root: &AbsoluteSystemPath,
) -> Option<DaemonClient> {
    if opts.run_opts.no_daemon
        || root_turbo_json.daemon == Some(false)
        || opts.run_opts.dry_run.is_some()
    {
        return None;
    }
    let paths = DaemonPaths::from_repo_root(repo_root);
    let connector = DaemonConnector::new(paths, true);
    match connector.connect().await {
        Ok(client) => Some(client),
        Err(err) => {
            debug!("daemon unavailable, falling back to filesystem checks: {err}");
            None
        }
    }
}

fn spawn_signal_handler(manager: ProcessManager) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(_) => {
                    ctrl_c.await.ok();
                    manager.stop().await;
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        eprintln!("turbo: interrupted, stopping running tasks");
        manager.stop().await;
    });
}
