//! The daemon wire protocol: newline-delimited JSON over a unix domain
//! socket, one request and one response per line.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Always the first RPC on a connection. A version mismatch makes the
    /// daemon shut down so that a matching one can be started.
    Hello {
        version: String,
    },
    NotifyOutputsWritten {
        hash: String,
        output_globs: Vec<String>,
        output_exclusion_globs: Vec<String>,
        time_saved: u64,
    },
    GetChangedOutputs {
        hash: String,
        output_globs: Vec<String>,
    },
    Status,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Hello,
    NotifyOutputsWritten,
    GetChangedOutputs {
        changed_output_globs: Vec<String>,
    },
    Status {
        uptime_ms: u64,
    },
    Shutdown,
    Error {
        message: String,
    },
}
