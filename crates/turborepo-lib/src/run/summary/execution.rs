use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::Serialize;

/// Where a task ended up, for bookkeeping and the final "Cached: X of Y"
/// line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    BuiltFromCache,
    Built,
    Failed,
    Skipped,
}

/// Timing and exit for one executed task.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSummary {
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default)]
struct ExecutionTrackerState {
    attempted: u32,
    cached: u32,
    success: u32,
    failed: u32,
    skipped: u32,
}

/// Run-wide counters, updated concurrently as tasks settle.
#[derive(Debug, Default, Clone)]
pub struct ExecutionTracker {
    state: Arc<Mutex<ExecutionTrackerState>>,
}

impl ExecutionTracker {
    pub fn record(&self, outcome: TaskOutcome) {
        let mut state = self.state.lock().expect("execution tracker lock");
        state.attempted += 1;
        match outcome {
            TaskOutcome::BuiltFromCache => {
                state.cached += 1;
                state.success += 1;
            }
            TaskOutcome::Built => state.success += 1,
            TaskOutcome::Failed => state.failed += 1,
            TaskOutcome::Skipped => state.skipped += 1,
        }
    }

    pub fn finish(
        &self,
        command: String,
        start_time: DateTime<Local>,
        exit_code: i32,
    ) -> ExecutionSummary {
        let state = self.state.lock().expect("execution tracker lock");
        ExecutionSummary {
            command,
            success: state.success,
            failed: state.failed,
            cached: state.cached,
            attempted: state.attempted,
            start_time: start_time.timestamp_millis(),
            end_time: Local::now().timestamp_millis(),
            exit_code,
        }
    }

    pub fn cached_count(&self) -> u32 {
        self.state.lock().expect("execution tracker lock").cached
    }

    pub fn attempted_count(&self) -> u32 {
        self.state.lock().expect("execution tracker lock").attempted
    }

    pub fn failed_count(&self) -> u32 {
        self.state.lock().expect("execution tracker lock").failed
    }
}

/// Aggregate numbers for the whole run.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub command: String,
    pub success: u32,
    pub failed: u32,
    pub cached: u32,
    pub attempted: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub exit_code: i32,
}
