//! The data model (§3): rows as they round-trip through the Metadata Store.

use casparian_ids::{FileHashId, FileLocationId, FileVersionId, JobId, PluginManifestId, RoutingRuleId, SourceRootId};
use casparian_protocol::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Managed,
    Other,
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceRoot {
    pub id: i64,
    pub path: String,
    pub kind: SourceKind,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRoot {
    pub fn id(&self) -> SourceRootId {
        SourceRootId::new(self.id)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileLocation {
    pub id: i64,
    pub root_id: i64,
    pub rel_path: String,
    pub filename: String,
    pub current_version_id: Option<i64>,
}

impl FileLocation {
    pub fn id(&self) -> FileLocationId {
        FileLocationId::new(self.id)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileVersion {
    pub id: i64,
    pub location_id: i64,
    pub hash_id: i64,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    pub tags: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl FileVersion {
    pub fn id(&self) -> FileVersionId {
        FileVersionId::new(self.id)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileHashRegistry {
    pub id: i64,
    /// Hex-encoded 32-byte content digest.
    pub hash_hex: String,
    pub first_seen_at: DateTime<Utc>,
}

impl FileHashRegistry {
    pub fn id(&self) -> FileHashId {
        FileHashId::new(self.id)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct RoutingRule {
    pub id: i64,
    pub pattern: String,
    pub tag: String,
    pub priority: i64,
}

impl RoutingRule {
    pub fn id(&self) -> RoutingRuleId {
        RoutingRuleId::new(self.id)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PluginConfig {
    pub id: i64,
    pub plugin_name: String,
    pub subscription_tags: Json<Vec<String>>,
    pub default_params: Json<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SinkWriteMode {
    Append,
    Overwrite,
}

#[derive(Debug, Clone, FromRow)]
pub struct TopicConfig {
    pub id: i64,
    pub plugin_name: String,
    pub topic_name: String,
    pub sink_uri: String,
    pub mode: SinkWriteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ManifestStatus {
    Pending,
    Rejected,
    Active,
    Retired,
}

#[derive(Debug, Clone, FromRow)]
pub struct PluginManifest {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub source_bytes: Vec<u8>,
    pub source_hash: String,
    pub env_signature: String,
    pub signature: String,
    pub status: ManifestStatus,
    pub created_at: DateTime<Utc>,
}

impl PluginManifest {
    pub fn id(&self) -> PluginManifestId {
        PluginManifestId::new(self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProcessingJob {
    pub id: i64,
    pub file_version_id: i64,
    pub plugin_name: String,
    pub plugin_params: Json<serde_json::Value>,
    pub priority: i64,
    pub status: JobStatus,
    pub worker_host: Option<String>,
    pub worker_pid: Option<i64>,
    pub claim_time: Option<DateTime<Utc>>,
    pub heartbeat_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub error_kind: Option<ErrorKindColumn>,
    pub error_message: Option<String>,
    pub summary: Option<Json<serde_json::Value>>,
}

impl ProcessingJob {
    pub fn job_id(&self) -> JobId {
        JobId::from_i64(self.id)
    }
}

/// `ErrorKind` stored as its serde `snake_case` string representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(transparent)]
pub struct ErrorKindColumn(String);

impl From<ErrorKind> for ErrorKindColumn {
    fn from(kind: ErrorKind) -> Self {
        let encoded = serde_json::to_value(kind).expect("ErrorKind always serializes");
        Self(encoded.as_str().expect("ErrorKind serializes to a string").to_owned())
    }
}

impl ErrorKindColumn {
    pub fn into_error_kind(self) -> Option<ErrorKind> {
        serde_json::from_value(serde_json::Value::String(self.0)).ok()
    }
}

/// One plugin to enqueue a job for, with its parameters and priority (§4.1 `enqueue_jobs`).
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub plugin_name: String,
    pub params: serde_json::Value,
    pub priority: i64,
}

pub const DEFAULT_MAX_RETRIES: i64 = 5;
