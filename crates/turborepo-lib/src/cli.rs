use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;

/// Exit code for task failures.
pub const EXIT_TASK_FAILURE: i32 = 1;
/// Exit code for configuration and usage errors.
pub const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser, Clone, Debug, Default, PartialEq)]
#[clap(author, about = "The build system that makes ship happen", long_about = None)]
#[clap(disable_help_subcommand = true)]
pub struct Args {
    /// Override the current working directory
    #[clap(long, global = true, value_parser)]
    pub cwd: Option<Utf8PathBuf>,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Run tasks across projects in your monorepo
    Run(Box<RunArgs>),
    /// Manage the turborepo background daemon
    Daemon {
        /// Seconds of inactivity before the daemon shuts itself down
        #[clap(long, default_value_t = 4 * 60 * 60)]
        idle_time_secs: u64,
        #[clap(subcommand)]
        command: Option<DaemonCommand>,
    },
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum DaemonCommand {
    /// Launch the daemon in the foreground
    Start,
    /// Report daemon status
    Status,
    /// Stop a running daemon
    Stop,
}

#[derive(Parser, Clone, Debug, Default, PartialEq)]
pub struct RunArgs {
    /// Tasks to run
    pub tasks: Vec<String>,
    /// Restrict execution to packages matching the filter
    #[clap(long, action = ArgAction::Append)]
    pub filter: Vec<String>,
    /// Deprecated alias for --filter
    #[clap(long, action = ArgAction::Append, hide = true)]
    pub scope: Vec<String>,
    /// Restrict execution to packages changed since the given ref
    #[clap(long)]
    pub since: Option<String>,
    /// Limit concurrency; an integer or a percentage of cores (50%)
    #[clap(long)]
    pub concurrency: Option<String>,
    /// Run all tasks at once, ignoring the dependency graph
    #[clap(long)]
    pub parallel: bool,
    /// Keep running sibling tasks when one fails
    #[clap(long = "continue")]
    pub continue_execution: bool,
    /// Plan the run without executing anything
    #[clap(long = "dry", value_enum, num_args = 0..=1, default_missing_value = "text", value_name = "MODE")]
    pub dry_run: Option<DryRunMode>,
    /// Run only the specified tasks, not their dependencies
    #[clap(long)]
    pub only: bool,
    /// Prune dependency edges outside of the scoped packages
    #[clap(long)]
    pub no_deps: bool,
    /// Include the dependencies of scoped packages
    #[clap(long)]
    pub include_dependencies: bool,
    /// Ignore existing cache entries, forcing re-execution
    #[clap(long, env = "TURBO_FORCE")]
    pub force: bool,
    /// Skip writing to the cache
    #[clap(long)]
    pub no_cache: bool,
    /// Skip the local filesystem cache
    #[clap(long, env = "TURBO_REMOTE_ONLY")]
    pub remote_only: bool,
    /// Location of the local cache
    #[clap(long, env = "TURBO_CACHE_DIR")]
    pub cache_dir: Option<Utf8PathBuf>,
    /// Number of background workers for cache writes
    #[clap(long, default_value_t = 10)]
    pub cache_workers: u32,
    /// Override each task's outputMode
    #[clap(long, value_enum)]
    pub output_logs: Option<OutputLogsMode>,
    /// Environment variable handling for task processes
    #[clap(long = "env-mode", value_enum, default_value_t = EnvMode::Infer)]
    pub env_mode: EnvMode,
    /// Emit the task graph as dot, to stdout or to a file
    #[clap(long, num_args = 0..=1, default_missing_value = "", value_name = "FILE")]
    pub graph: Option<String>,
    /// Write a run summary to .turbo/runs
    #[clap(long, env = "TURBO_RUN_SUMMARY")]
    pub summarize: bool,
    /// Write a chrome-compatible trace file
    #[clap(long)]
    pub profile: Option<String>,
    /// Use framework-aware env var inference when hashing
    #[clap(long, num_args = 0..=1, default_missing_value = "true", default_value_t = true)]
    pub framework_inference: bool,
    /// Treat the repository as a single package
    #[clap(long)]
    pub single_package: bool,
    /// Do not attempt to use the daemon for filesystem checks
    #[clap(long)]
    pub no_daemon: bool,
    /// Arguments forwarded to the task processes
    #[clap(last = true)]
    pub pass_through_args: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    #[default]
    Infer,
    Loose,
    Strict,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    None,
    HashOnly,
    NewOnly,
    ErrorsOnly,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunMode {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogOrder {
    #[default]
    Auto,
    Stream,
    Grouped,
}

impl LogOrder {
    /// Resolves `TURBO_LOG_ORDER`; `auto` and anything unrecognized stream.
    pub fn from_env() -> Self {
        match std::env::var("TURBO_LOG_ORDER").as_deref() {
            Ok("grouped") => LogOrder::Grouped,
            _ => LogOrder::Stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_run(args: &[&str]) -> RunArgs {
        let args = Args::try_parse_from(args).unwrap();
        match args.command {
            Some(Command::Run(run_args)) => *run_args,
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_run() {
        let run_args = parse_run(&["turbo", "run", "build"]);
        assert_eq!(run_args.tasks, vec!["build".to_string()]);
        assert_eq!(run_args.env_mode, EnvMode::Infer);
    }

    #[test]
    fn test_dry_run_modes() {
        let run_args = parse_run(&["turbo", "run", "build", "--dry"]);
        assert_eq!(run_args.dry_run, Some(DryRunMode::Text));

        let run_args = parse_run(&["turbo", "run", "build", "--dry=json"]);
        assert_eq!(run_args.dry_run, Some(DryRunMode::Json));

        let run_args = parse_run(&["turbo", "run", "build"]);
        assert_eq!(run_args.dry_run, None);
    }

    #[test]
    fn test_pass_through_args() {
        let run_args = parse_run(&["turbo", "run", "test", "--", "--watch", "-v"]);
        assert_eq!(run_args.tasks, vec!["test".to_string()]);
        assert_eq!(
            run_args.pass_through_args,
            vec!["--watch".to_string(), "-v".to_string()]
        );
    }

    #[test]
    fn test_graph_flag_forms() {
        let run_args = parse_run(&["turbo", "run", "build", "--graph"]);
        assert_eq!(run_args.graph, Some(String::new()));

        let run_args = parse_run(&["turbo", "run", "build", "--graph=out.dot"]);
        assert_eq!(run_args.graph, Some("out.dot".to_string()));
    }
}
