#![deny(clippy::all)]
//! The turborepo task execution engine.
//!
//! `turbo run` flows through this crate: workspace metadata and turbo.json
//! become a task graph, each task instance gets a content-addressed hash,
//! and a bounded-concurrency walker drives every task through cache lookup,
//! execution, and capture.

pub mod cli;
pub mod daemon;
pub mod engine;
pub mod opts;
pub mod package_graph;
pub mod package_json;
pub mod process;
pub mod run;
pub mod task_graph;
pub mod task_hash;
pub mod task_id;
pub mod turbo_json;
pub mod ui;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use turbopath::AbsoluteSystemPathBuf;

use crate::cli::{Args, Command, DaemonCommand, EXIT_CONFIG_ERROR};

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// CLI entry point: parses arguments, sets up logging, dispatches, and
/// returns the process exit code.
pub async fn main() -> i32 {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TURBO_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let repo_root = match resolve_repo_root(&args) {
        Ok(repo_root) => repo_root,
        Err(err) => {
            eprintln!("ERROR: {err}");
            return EXIT_CONFIG_ERROR;
        }
    };

    match args.command {
        Some(Command::Run(run_args)) => match run::run(repo_root, &run_args, get_version()).await {
            Ok(exit_code) => exit_code,
            Err(err) => {
                eprintln!("ERROR: {err}");
                err.exit_code()
            }
        },
        Some(Command::Daemon {
            idle_time_secs,
            command,
        }) => daemon_main(repo_root, idle_time_secs, command).await,
        None => {
            eprintln!("ERROR: no command given; try `turbo run <task>`");
            EXIT_CONFIG_ERROR
        }
    }
}

fn resolve_repo_root(args: &Args) -> Result<AbsoluteSystemPathBuf, turbopath::PathError> {
    match &args.cwd {
        Some(cwd) if cwd.is_absolute() => AbsoluteSystemPathBuf::new(cwd.as_str()),
        Some(cwd) => {
            let base = AbsoluteSystemPathBuf::cwd()?;
            Ok(AbsoluteSystemPathBuf::from_unknown(&base, cwd))
        }
        None => AbsoluteSystemPathBuf::cwd(),
    }
}

async fn daemon_main(
    repo_root: AbsoluteSystemPathBuf,
    idle_time_secs: u64,
    command: Option<DaemonCommand>,
) -> i32 {
    let paths = daemon::Paths::from_repo_root(&repo_root);

    match command.unwrap_or(DaemonCommand::Start) {
        DaemonCommand::Start => {
            #[cfg(unix)]
            {
                let server = daemon::DaemonServer::new(
                    repo_root,
                    paths,
                    Duration::from_secs(idle_time_secs),
                );
                match server.serve().await {
                    Ok(reason) => {
                        tracing::debug!("daemon closed: {reason:?}");
                        0
                    }
                    Err(err) => {
                        eprintln!("ERROR: daemon failed: {err}");
                        1
                    }
                }
            }
            #[cfg(not(unix))]
            {
                eprintln!("ERROR: the daemon is not supported on this platform");
                1
            }
        }
        DaemonCommand::Status => match daemon::DaemonClient::connect(&paths).await {
            Ok(mut client) => match client.status().await {
                Ok(uptime_ms) => {
                    println!("daemon is running (uptime {uptime_ms}ms)");
                    0
                }
                Err(err) => {
                    eprintln!("ERROR: {err}");
                    1
                }
            },
            Err(_) => {
                println!("daemon is not running");
                0
            }
        },
        DaemonCommand::Stop => match daemon::DaemonClient::connect(&paths).await {
            Ok(client) => match client.stop().await {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("ERROR: {err}");
                    1
                }
            },
            Err(_) => {
                println!("daemon is not running");
                0
            }
        },
    }
}
