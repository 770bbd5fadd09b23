//! The dispatch matcher (§4.4): each tick, pairs idle workers against
//! claimable jobs and produces ready-to-send DISPATCH payloads.
//!
//! Bounded per tick at [`MAX_DISPATCH_PER_TICK`] (the in-memory "queue" the
//! spec describes): a cluster with far more idle workers than the matcher
//! can service in one pass defers the rest to the next tick rather than
//! claiming jobs faster than the router loop can hand them out.

use crate::error::Result;
use crate::routing::RoutingTable;
use crate::registry::WorkerRegistry;
use casparian_db::CasparianDb;
use casparian_ids::JobId;
use casparian_protocol::DispatchPayload;
use tracing::{info, warn};

pub const MAX_DISPATCH_PER_TICK: usize = 32;

pub struct PendingDispatch {
    pub worker_id: String,
    pub job_id: JobId,
    pub payload: DispatchPayload,
}

/// One matching pass: claims at most one job per idle worker, up to
/// [`MAX_DISPATCH_PER_TICK`] workers. Workers beyond that bound are logged
/// as DISPATCH_DEFERRED and retried on the next tick — they are never
/// claimed against, so no job is ever claimed without a dispatch in hand.
pub async fn tick(db: &CasparianDb, routing: &RoutingTable, registry: &WorkerRegistry) -> Result<Vec<PendingDispatch>> {
    let idle: Vec<(String, Vec<String>)> = registry.idle_workers().map(|(id, caps)| (id.to_string(), caps.to_vec())).collect();

    if idle.is_empty() {
        return Ok(Vec::new());
    }

    let (serviced, deferred) = idle.split_at(idle.len().min(MAX_DISPATCH_PER_TICK));
    if !deferred.is_empty() {
        warn!(deferred = deferred.len(), "DISPATCH_DEFERRED: more idle workers than this tick can service");
    }

    let snapshot = routing.snapshot();
    let mut ready = Vec::new();
    for (worker_id, capabilities) in serviced {
        let Some(job) = db.claim_next_job(capabilities, worker_id, 0).await? else { continue };
        let job_id = job.job_id();

        let payload = match snapshot.plugins.get(&job.plugin_name) {
            Some(entry) => DispatchPayload {
                plugin_name: job.plugin_name.clone(),
                file_path: db.file_path_for_version(casparian_ids::FileVersionId::new(job.file_version_id)).await?,
                file_version_id: casparian_ids::FileVersionId::new(job.file_version_id),
                sinks: entry.topics.clone(),
                env_hash: entry.env_signature.clone(),
                source_code: entry.source_code.clone(),
                plugin_params: job.plugin_params.0.clone(),
                timeout_secs: None,
            },
            None => {
                // Cache miss: the job's plugin was enqueued after our last
                // reload. Fall back to a direct store read rather than
                // stranding a job this worker just claimed.
                warn!(plugin = %job.plugin_name, "routing table cache miss, falling back to store read");
                match build_payload_from_store(db, &job).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%job_id, error = %e, "could not build dispatch payload, returning job to pending");
                        db.fail_job(job_id, casparian_protocol::ErrorKind::Config, &e.to_string(), true).await?;
                        continue;
                    }
                }
            }
        };

        ready.push(PendingDispatch { worker_id: worker_id.clone(), job_id, payload });
    }

    if !ready.is_empty() {
        info!(dispatched = ready.len(), "dispatch tick matched jobs to idle workers");
    }
    Ok(ready)
}

async fn build_payload_from_store(db: &CasparianDb, job: &casparian_db::ProcessingJob) -> Result<DispatchPayload> {
    let manifest = db.active_manifest(&job.plugin_name).await?.ok_or_else(|| crate::error::SentinelError::UnknownPlugin(job.plugin_name.clone()))?;
    let source_code = String::from_utf8(manifest.source_bytes.clone())
        .map_err(|_| crate::error::SentinelError::UnknownPlugin(job.plugin_name.clone()))?;
    let topics = db
        .topics_for_plugin(&job.plugin_name)
        .await?
        .into_iter()
        .map(|t| casparian_protocol::SinkTarget {
            topic: t.topic_name,
            uri: t.sink_uri,
            mode: match t.mode {
                casparian_db::SinkWriteMode::Append => casparian_protocol::SinkMode::Append,
                casparian_db::SinkWriteMode::Overwrite => casparian_protocol::SinkMode::Overwrite,
            },
        })
        .collect();
    let file_version_id = casparian_ids::FileVersionId::new(job.file_version_id);
    Ok(DispatchPayload {
        plugin_name: job.plugin_name.clone(),
        file_path: db.file_path_for_version(file_version_id).await?,
        file_version_id,
        sinks: topics,
        env_hash: manifest.env_signature,
        source_code,
        plugin_params: job.plugin_params.0.clone(),
        timeout_secs: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_db::{DbConfig, EnqueueRequest, ManifestStatus, SourceKind};

    async fn seed_job(db: &CasparianDb) -> JobId {
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "h", 1, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("p", "1.0.0", b"print(1)", "h1", "env1", "sig", ManifestStatus::Active).await.unwrap();
        let req = EnqueueRequest { plugin_name: "p".into(), params: serde_json::json!({}), priority: 0 };
        db.enqueue_jobs(version, &[req]).await.unwrap()[0]
    }

    #[tokio::test]
    async fn tick_dispatches_to_an_idle_matching_worker() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let job_id = seed_job(&db).await;

        let routing = RoutingTable::new();
        routing.reload(&db).await.unwrap();

        let mut registry = WorkerRegistry::new();
        registry.identify("w1".into(), b"id1".to_vec(), vec!["env1".to_string()]);

        let ready = tick(&db, &routing, &registry).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].job_id, job_id);
        assert_eq!(ready[0].worker_id, "w1");
    }

    #[tokio::test]
    async fn tick_skips_worker_without_matching_capability() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        seed_job(&db).await;

        let routing = RoutingTable::new();
        routing.reload(&db).await.unwrap();

        let mut registry = WorkerRegistry::new();
        registry.identify("w1".into(), b"id1".to_vec(), vec!["env-other".to_string()]);

        let ready = tick(&db, &routing, &registry).await.unwrap();
        assert!(ready.is_empty());
    }
}
