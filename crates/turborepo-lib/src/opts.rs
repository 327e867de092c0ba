use camino::Utf8PathBuf;
use thiserror::Error;
use turborepo_cache::CacheOpts;

use crate::cli::{DryRunMode, EnvMode, OutputLogsMode, RunArgs};

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "invalid value for --concurrency. Use a positive integer or a percentage of CPU cores \
         (e.g. 50%): {0}"
    )]
    InvalidConcurrency(String),
}

#[derive(Debug)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub run_cache_opts: RunCacheOpts,
    pub scope_opts: ScopeOpts,
}

impl TryFrom<&RunArgs> for Opts {
    type Error = Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            run_opts: RunOpts::try_from(args)?,
            cache_opts: CacheOpts::from(args),
            run_cache_opts: RunCacheOpts::from(args),
            scope_opts: ScopeOpts::from(args),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub env_mode: EnvMode,
    pub continue_on_error: bool,
    pub pass_through_args: Vec<String>,
    pub only: bool,
    pub no_deps: bool,
    pub dry_run: Option<DryRunMode>,
    pub graph: Option<String>,
    pub single_package: bool,
    pub summarize: bool,
    pub no_daemon: bool,
    pub framework_inference: bool,
    pub log_order: crate::cli::LogOrder,
    pub since: Option<String>,
}

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

impl TryFrom<&RunArgs> for RunOpts {
    type Error = Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let concurrency = args
            .concurrency
            .as_deref()
            .map(parse_concurrency)
            .transpose()?
            .unwrap_or_else(|| num_cpus::get() as u32);

        Ok(Self {
            tasks: args.tasks.clone(),
            concurrency,
            parallel: args.parallel,
            env_mode: args.env_mode,
            continue_on_error: args.continue_execution,
            pass_through_args: args.pass_through_args.clone(),
            only: args.only,
            no_deps: args.no_deps,
            dry_run: args.dry_run,
            graph: args.graph.clone(),
            single_package: args.single_package,
            summarize: args.summarize,
            no_daemon: args.no_daemon,
            framework_inference: args.framework_inference,
            log_order: crate::cli::LogOrder::from_env(),
            since: args.since.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunCacheOpts {
    /// `--force`: never read from cache, still write.
    pub skip_reads: bool,
    /// `--no-cache`: never write to cache, still read.
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}

impl From<&RunArgs> for RunCacheOpts {
    fn from(args: &RunArgs) -> Self {
        Self {
            skip_reads: args.force,
            skip_writes: args.no_cache,
            task_output_logs_override: args.output_logs,
        }
    }
}

impl From<&RunArgs> for CacheOpts {
    fn from(args: &RunArgs) -> Self {
        CacheOpts {
            cache_dir: args
                .cache_dir
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from("node_modules/.cache/turbo")),
            skip_filesystem: args.remote_only,
            workers: args.cache_workers,
            ..CacheOpts::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScopeOpts {
    pub filter_patterns: Vec<String>,
    pub include_dependencies: bool,
}

impl From<&RunArgs> for ScopeOpts {
    fn from(args: &RunArgs) -> Self {
        let mut filter_patterns = args.filter.clone();
        filter_patterns.extend(args.scope.iter().cloned());
        Self {
            filter_patterns,
            include_dependencies: args.include_dependencies,
        }
    }
}

fn parse_concurrency(raw: &str) -> Result<u32, Error> {
    if let Some(percent) = raw.strip_suffix('%') {
        let percent: f64 = percent
            .parse()
            .map_err(|_| Error::InvalidConcurrency(raw.to_string()))?;
        if percent > 0.0 && percent.is_finite() {
            return Ok((num_cpus::get() as f64 * percent / 100.0).max(1.0) as u32);
        }
        return Err(Error::InvalidConcurrency(raw.to_string()));
    }
    match raw.parse::<u32>() {
        Ok(concurrency) if concurrency >= 1 => Ok(concurrency),
        _ => Err(Error::InvalidConcurrency(raw.to_string())),
    }
}
