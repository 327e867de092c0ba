mod execution;
mod task;

pub use execution::{ExecutionSummary, ExecutionTracker, TaskExecutionSummary, TaskOutcome};
use serde::Serialize;
use svix_ksuid::{Ksuid, KsuidLike};
pub use task::{CacheStatus, CacheSummary, TaskSummary};
use thiserror::Error;
use turbopath::AbsoluteSystemPath;

use crate::cli::EnvMode;

// Bump when the shape of the summary changes; consumers key off of it.
const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to write run summary: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize run summary to JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The per-invocation record written to `.turbo/runs/<ksuid>.json` and used
/// as the payload of `--dry=json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: Ksuid,
    pub version: String,
    pub turbo_version: String,
    pub monorepo: bool,
    pub global_hash: String,
    pub env_mode: EnvMode,
    pub packages: Vec<String>,
    pub execution: Option<ExecutionSummary>,
    pub tasks: Vec<TaskSummary>,
}

impl RunSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        turbo_version: &str,
        monorepo: bool,
        global_hash: String,
        env_mode: EnvMode,
        mut packages: Vec<String>,
        execution: Option<ExecutionSummary>,
        mut tasks: Vec<TaskSummary>,
    ) -> Self {
        packages.sort();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Self {
            id: Ksuid::new(None, None),
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            turbo_version: turbo_version.to_string(),
            monorepo,
            global_hash,
            env_mode,
            packages,
            execution,
            tasks,
        }
    }

    /// Persists the summary beneath the repo root. The ksuid filename keeps
    /// summaries time-sortable.
    pub fn save(&self, repo_root: &AbsoluteSystemPath) -> Result<(), Error> {
        let summary_path = repo_root.join_components(&[
            ".turbo",
            "runs",
            &format!("{}.json", self.id),
        ]);
        summary_path.ensure_dir()?;
        let json = serde_json::to_string_pretty(self)?;
        summary_path.create_with_contents(json)?;
        Ok(())
    }

    pub fn format_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
