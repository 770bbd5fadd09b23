//! JSON payload shapes carried on control-plane frames (§6).

use casparian_ids::FileVersionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Write mode for a sink destination (§3 TopicConfig, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    Append,
    Overwrite,
}

/// One resolved destination for a (plugin, topic) pair (§4.7, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkTarget {
    pub topic: String,
    pub uri: String,
    pub mode: SinkMode,
}

/// DISPATCH payload (§6): sent by the Sentinel to a worker to start a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub plugin_name: String,
    pub file_path: String,
    pub file_version_id: FileVersionId,
    pub sinks: Vec<SinkTarget>,
    pub env_hash: String,
    pub source_code: String,
    #[serde(default)]
    pub plugin_params: serde_json::Value,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// IDENTIFY payload (§6): sent by a worker on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub worker_id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub current_job_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeartbeatStatus {
    Idle,
    Busy,
}

/// HEARTBEAT payload (§6): sent by a worker periodically and on job progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub current_job_id: Option<u64>,
}

/// CONCLUDE payload (§6): sent by the Sandbox (relayed by the Worker) on clean exit.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConcludePayload {
    pub rows_per_topic: HashMap<String, u64>,
}

/// §7's error taxonomy, carried on ERROR frames and as `ProcessingJob.error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    ArtifactDrift,
    PluginError,
    TransientIo,
    Timeout,
    LeaseLost,
    Protocol,
    Commit,
}

impl ErrorKind {
    /// Whether this error kind is retryable by default policy (§7).
    pub fn retryable_by_default(self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::Timeout | ErrorKind::Commit)
    }
}

/// ERROR payload (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// RELOAD payload (§6): instructs the Sentinel to rehydrate its routing table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReloadPayload {}

/// CANCEL payload (§6): instructs a worker to abort a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    pub reason: String,
}
