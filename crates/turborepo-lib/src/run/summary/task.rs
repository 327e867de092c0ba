use std::collections::HashMap;

use serde::Serialize;
use turbopath::AnchoredSystemPathBuf;
use turborepo_cache::CacheState;

use super::TaskExecutionSummary;
use crate::{task_id::TaskId, turbo_json::TaskDefinition};

/// Cache information recorded per task: what was in which layer, and where
/// a hit came from.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    pub time_saved: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    #[default]
    Miss,
}

impl CacheSummary {
    pub fn miss(state: CacheState) -> Self {
        Self {
            local: state.local,
            remote: state.remote,
            status: CacheStatus::Miss,
            time_saved: 0,
        }
    }
}

/// One task instance in the run summary: its identity, resolved definition,
/// hash, cache state, and what happened when it ran.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub command: String,
    pub cache: CacheSummary,
    pub resolved_task_definition: TaskDefinition,
    pub log_file: String,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    /// Values are hashed so that secrets never reach disk.
    pub environment_variables: HashMap<String, String>,
    pub execution: Option<TaskExecutionSummary>,
    /// Present when the task never ran, with the reason it was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_summary_serialization_shape() {
        let summary = TaskSummary {
            task_id: TaskId::new("web", "build").into_owned(),
            task: "build".to_string(),
            package: "web".to_string(),
            hash: "a".repeat(64),
            command: "next build".to_string(),
            cache: CacheSummary::default(),
            resolved_task_definition: TaskDefinition::default(),
            log_file: "packages/web/.turbo/turbo-build.log".to_string(),
            dependencies: vec![],
            dependents: vec![],
            expanded_outputs: vec![],
            environment_variables: HashMap::new(),
            execution: None,
            skipped_reason: None,
        };

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["taskId"], "web#build");
        assert_eq!(value["cache"]["status"], "MISS");
        assert_eq!(value["resolvedTaskDefinition"]["cache"], true);
    }
}
