//! The Worker's job execution loop (§4.5). A `Worker` owns its store handle,
//! environment cache, and sandbox executable; `run` drives the claim loop,
//! and `run_claimed` takes one claimed job through the remaining nine steps,
//! from manifest verification to commit.
//!
//! Job acquisition here polls `claim_next_job` on an interval rather than
//! waiting on a Sentinel DISPATCH. This is the crash-recovery path the
//! Sentinel-pushed path (`casparian_sentinel`) falls back to for any job
//! whose lease goes stale, and is sufficient on its own to exercise every
//! ordering guarantee in §5: both paths converge on the same atomic
//! `claim_next_job`, so a job can never be claimed twice regardless of which
//! path claims it.

use crate::bridge::{self, SandboxConfig};
use crate::context::WorkerContext;
use crate::environment::EnvironmentManager;
use crate::error::{Result, WorkerError};
use crate::heartbeat;
use casparian_db::{CasparianDb, ProcessingJob};
use casparian_ids::{FileVersionId, JobId};
use casparian_protocol::SinkTarget;
use casparian_sinks::{FileSink, OutputSink, RelationalSink};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct WorkerConfig {
    pub host: String,
    pub pid: i64,
    pub capabilities: Vec<String>,
    pub sandbox_executable: PathBuf,
    pub environment_cache_root: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub job_timeout: Option<Duration>,
}

pub struct Worker {
    db: CasparianDb,
    config: WorkerConfig,
    environments: Arc<EnvironmentManager>,
}

impl Worker {
    pub fn new(db: CasparianDb, config: WorkerConfig) -> Self {
        let environments = Arc::new(EnvironmentManager::new(config.environment_cache_root.clone()));
        Self { db, config, environments }
    }

    /// Polls for work until `shutdown` resolves. One claimed job is executed
    /// to completion before the next poll; a worker processes jobs serially
    /// per §4.5 (concurrency comes from running multiple worker processes).
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.db.claim_next_job(&self.config.capabilities, &self.config.host, self.config.pid).await? {
                Some(job) => {
                    let job_id = job.job_id();
                    if let Err(e) = self.run_claimed(job).await {
                        error!(%job_id, error = %e, "job failed");
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Executes one already-claimed job through steps 2-9 of §4.5, running
    /// the heartbeat loop for the claim's lifetime and resolving the
    /// terminal outcome (COMPLETED or FAILED) against the store.
    async fn run_claimed(&self, job: ProcessingJob) -> Result<()> {
        let job_id = job.job_id();
        let file_version_id = FileVersionId::new(job.file_version_id);

        self.db.mark_running(job_id, &self.config.host).await?;
        let heartbeat_stop = heartbeat::spawn(self.db.clone(), job_id, self.config.host.clone(), self.config.heartbeat_interval);

        let outcome = self.execute(job_id, file_version_id, &job.plugin_name, &job.plugin_params).await;

        let _ = heartbeat_stop.send(true);

        match outcome {
            Ok(summary) => {
                self.db.complete_job(job_id, &summary).await?;
                info!(%job_id, "job completed");
                Ok(())
            }
            Err(e) => {
                let (kind, retryable) = e.classify();
                warn!(%job_id, ?kind, retryable, error = %e, "job failed, classified");
                self.db.fail_job(job_id, kind, &e.to_string(), retryable).await?;
                Err(e)
            }
        }
    }

    /// Executes one Sentinel-dispatched job. The Sentinel claims the job
    /// under this worker's host identity before sending DISPATCH, so by the
    /// time this runs the job is already CLAIMED in the store; this mirrors
    /// [`Self::run_claimed`] from there (mark RUNNING, heartbeat, execute,
    /// resolve to COMPLETED/FAILED).
    pub async fn run_dispatched(&self, job_id: JobId, payload: &casparian_protocol::DispatchPayload) -> Result<serde_json::Value> {
        self.db.mark_running(job_id, &self.config.host).await?;
        let heartbeat_stop = heartbeat::spawn(self.db.clone(), job_id, self.config.host.clone(), self.config.heartbeat_interval);

        let outcome = self.execute_dispatch(job_id, payload).await;

        let _ = heartbeat_stop.send(true);

        match outcome {
            Ok(summary) => {
                self.db.complete_job(job_id, &summary).await?;
                info!(%job_id, "dispatched job completed");
                Ok(summary)
            }
            Err(e) => {
                let (kind, retryable) = e.classify();
                warn!(%job_id, ?kind, retryable, error = %e, "dispatched job failed, classified");
                self.db.fail_job(job_id, kind, &e.to_string(), retryable).await?;
                Err(e)
            }
        }
    }

    /// Steps 2-8 on the poll/claim path: load the manifest, verify it
    /// against its recorded hash, resolve this plugin's configured sink
    /// targets from the store, then hand off to [`Self::run_sandbox_and_fan_out`].
    async fn execute(
        &self,
        job_id: JobId,
        file_version_id: FileVersionId,
        plugin_name: &str,
        plugin_params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let manifest = self.verified_manifest(plugin_name, None).await?;
        let file_path = self.db.file_path_for_version(file_version_id).await?;
        let topics = self.db.topics_for_plugin(plugin_name).await?;
        let sink_targets = topic_configs_to_targets(&topics);
        let source_code = manifest_source_code(&manifest)?;

        let (rows_per_topic, outputs_committed) = self
            .run_sandbox_and_fan_out(job_id, file_version_id, &manifest.env_signature, source_code, file_path, &sink_targets)
            .await?;

        Ok(serde_json::json!({
            "plugin_name": plugin_name,
            "plugin_params": plugin_params,
            "rows_per_topic": rows_per_topic,
            "outputs_committed": outputs_committed,
        }))
    }

    /// Steps 2-8 on the Sentinel-pushed path: the DISPATCH payload already
    /// carries the source, file path, and resolved sink targets the
    /// Sentinel's routing table chose; the worker still re-verifies the
    /// source against its own store before running it, so a Sentinel with a
    /// stale routing table can never cause a retired or rejected plugin
    /// version to execute.
    pub async fn execute_dispatch(&self, job_id: JobId, payload: &casparian_protocol::DispatchPayload) -> Result<serde_json::Value> {
        let manifest = self.verified_manifest(&payload.plugin_name, Some(payload.source_code.as_bytes())).await?;

        let (rows_per_topic, outputs_committed) = self
            .run_sandbox_and_fan_out(
                job_id,
                payload.file_version_id,
                &manifest.env_signature,
                payload.source_code.clone(),
                payload.file_path.clone(),
                &payload.sinks,
            )
            .await?;

        Ok(serde_json::json!({
            "plugin_name": payload.plugin_name,
            "plugin_params": payload.plugin_params,
            "rows_per_topic": rows_per_topic,
            "outputs_committed": outputs_committed,
        }))
    }

    /// Fetches the plugin's ACTIVE manifest and confirms its recorded
    /// `source_hash` still matches the bytes about to run (§4.5 step 3). On
    /// the pushed path `dispatched_source` is the source the Sentinel sent;
    /// on the poll path it's `None` and only the manifest's own internal
    /// consistency is checked.
    async fn verified_manifest(&self, plugin_name: &str, dispatched_source: Option<&[u8]>) -> Result<casparian_db::PluginManifest> {
        let manifest = self
            .db
            .active_manifest(plugin_name)
            .await?
            .ok_or_else(|| WorkerError::ArtifactDrift { expected: "an ACTIVE manifest".to_string(), found: "none".to_string() })?;

        let recomputed = casparian_security::source_hash(&manifest.source_bytes);
        if recomputed != manifest.source_hash {
            return Err(WorkerError::ArtifactDrift { expected: manifest.source_hash.clone(), found: recomputed });
        }

        if let Some(dispatched) = dispatched_source {
            let dispatched_hash = casparian_security::source_hash(dispatched);
            if dispatched_hash != manifest.source_hash {
                return Err(WorkerError::ArtifactDrift { expected: manifest.source_hash.clone(), found: dispatched_hash });
            }
        }

        Ok(manifest)
    }

    /// Steps 4-8, shared by both acquisition paths: prepare the plugin's
    /// environment, run the sandbox, publish its batches into a
    /// [`WorkerContext`], and fan out the result to every sink target.
    async fn run_sandbox_and_fan_out(
        &self,
        job_id: JobId,
        file_version_id: FileVersionId,
        env_signature: &str,
        source_code: String,
        file_path: String,
        sink_targets: &[SinkTarget],
    ) -> Result<(HashMap<String, u64>, usize)> {
        let interpreter_root = self
            .environments
            .ensure(env_signature)
            .await
            .map_err(|e| WorkerError::SandboxFailed(-1, format!("environment preparation failed: {e}")))?;

        let mut ctx = WorkerContext::new(job_id, file_version_id);
        ctx.register_sink_targets(sink_targets)?;
        let relational_pools = open_relational_pools(sink_targets).await?;

        let sandbox_config = SandboxConfig {
            executable: self.config.sandbox_executable.clone(),
            interpreter_root,
            source_code,
            file_path,
            job_id,
            file_version_id,
            timeout: self.config.job_timeout,
        };

        let cancel = crate::cancel::CancellationToken::new();
        let outcome = bridge::run_sandbox(sandbox_config, cancel).await?;

        for (topic, batches) in outcome.batches_by_topic {
            let handle = ctx.register_topic(&topic)?;
            for batch in batches {
                ctx.publish(handle, batch)?;
            }
        }

        let rows_per_topic = ctx.rows_per_topic();
        let (mut fan_out, batches_by_output) =
            ctx.into_fan_out(|target: &SinkTarget| make_sink(target, job_id, &relational_pools))?;
        fan_out.write_all(&batches_by_output).await?;
        let commits = fan_out.finish().await;

        if let Some(failed) = commits.iter().find(|c| !c.committed) {
            return Err(WorkerError::Commit(format!(
                "topic '{}' failed to commit: {}",
                failed.topic,
                failed.error.as_deref().unwrap_or("unknown")
            )));
        }

        Ok((rows_per_topic, commits.len()))
    }

    pub fn db(&self) -> &CasparianDb {
        &self.db
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn capabilities(&self) -> &[String] {
        &self.config.capabilities
    }
}

fn topic_configs_to_targets(topics: &[casparian_db::TopicConfig]) -> Vec<SinkTarget> {
    topics
        .iter()
        .map(|topic| SinkTarget {
            topic: topic.topic_name.clone(),
            uri: topic.sink_uri.clone(),
            mode: match topic.mode {
                casparian_db::SinkWriteMode::Append => casparian_protocol::SinkMode::Append,
                casparian_db::SinkWriteMode::Overwrite => casparian_protocol::SinkMode::Overwrite,
            },
        })
        .collect()
}

fn manifest_source_code(manifest: &casparian_db::PluginManifest) -> Result<String> {
    String::from_utf8(manifest.source_bytes.clone())
        .map_err(|e| WorkerError::SandboxFailed(-1, format!("plugin source is not valid UTF-8: {e}")))
}

/// Connects one `SqlitePool` per distinct `sqlite://` sink URI among
/// `targets`, so the fan-out closure can hand sinks out synchronously once
/// every pool it might need already exists.
async fn open_relational_pools(targets: &[SinkTarget]) -> Result<HashMap<String, SqlitePool>> {
    let mut pools = HashMap::new();
    for target in targets {
        if pools.contains_key(&target.uri) {
            continue;
        }
        if let Some(path) = target.uri.strip_prefix("sqlite://") {
            let pool = SqlitePool::connect(&format!("sqlite://{path}?mode=rwc")).await?;
            pools.insert(target.uri.clone(), pool);
        }
    }
    Ok(pools)
}

/// Resolves a [`SinkTarget`]'s URI into a live sink. `sqlite://<path>` uses
/// [`RelationalSink`] (table name = the topic's own name); anything else
/// (bare path, or `file://` prefixed) is a Parquet [`FileSink`] (§4.8).
fn make_sink(target: &SinkTarget, job_id: JobId, relational_pools: &HashMap<String, SqlitePool>) -> Box<dyn OutputSink> {
    if let Some(pool) = relational_pools.get(&target.uri) {
        return Box::new(RelationalSink::new(pool.clone(), target.topic.clone(), job_id.to_string(), target.mode));
    }
    let path = target.uri.strip_prefix("file://").unwrap_or(&target.uri);
    Box::new(FileSink::new(PathBuf::from(path), job_id.to_string(), target.mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_db::{DbConfig, EnqueueRequest, ManifestStatus, SourceKind};

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            host: "host-a".to_string(),
            pid: 1,
            capabilities: vec!["env1".to_string()],
            sandbox_executable: PathBuf::from("casparian-sandbox"),
            environment_cache_root: std::env::temp_dir().join("casparian_worker_test_envs"),
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(30),
            job_timeout: None,
        }
    }

    #[tokio::test]
    async fn execute_rejects_job_with_no_active_manifest() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let worker = Worker::new(db.clone(), test_config());

        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "h", 1, chrono::Utc::now(), vec![]).await.unwrap();

        let err = worker.execute(JobId::new(1), version, "missing_plugin", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::ArtifactDrift { .. }));
    }

    #[tokio::test]
    async fn execute_rejects_job_when_stored_source_hash_does_not_match_bytes() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let worker = Worker::new(db.clone(), test_config());

        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "h", 1, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("p", "1.0.0", b"real source", "not-the-real-hash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();

        let err = worker.execute(JobId::new(1), version, "p", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, WorkerError::ArtifactDrift { .. }));
    }

    #[tokio::test]
    async fn run_claimed_marks_job_failed_on_drift() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let worker = Worker::new(db.clone(), test_config());

        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "h", 1, chrono::Utc::now(), vec![]).await.unwrap();
        let req = EnqueueRequest { plugin_name: "missing_plugin".into(), params: serde_json::json!({}), priority: 0 };
        let ids = db.enqueue_jobs(version, &[req]).await.unwrap();

        let job = db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap().unwrap();
        assert!(worker.run_claimed(job).await.is_err());

        let job = db.get_job(ids[0]).await.unwrap();
        assert_eq!(job.status, casparian_db::JobStatus::Failed);
        assert_eq!(job.error_kind.unwrap().into_error_kind(), Some(casparian_protocol::ErrorKind::ArtifactDrift));
    }
}
