//! Worker → store heartbeat loop (§4.9 loop 1). Runs on a background timer
//! for the lifetime of a claim, refreshing the lease; stops as soon as the
//! claim is no longer held (lease lost, or the job reached a terminal
//! state and the loop is cancelled by the caller).

use casparian_db::CasparianDb;
use casparian_ids::JobId;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns a task that heartbeats `job_id` every `interval` until `stop` is
/// signalled. Returns a sender; dropping or sending on it stops the loop.
pub fn spawn(db: CasparianDb, job_id: JobId, host: String, interval: Duration) -> watch::Sender<bool> {
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = db.heartbeat(job_id, &host).await {
                        warn!(%job_id, error = %e, "heartbeat failed, lease likely lost");
                        break;
                    }
                    debug!(%job_id, "heartbeat sent");
                }
                _ = rx.changed() => {
                    break;
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_db::{DbConfig, EnqueueRequest, ManifestStatus, SourceKind};

    #[tokio::test]
    async fn heartbeat_loop_stops_cleanly_on_signal() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "h", 1, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("p", "1.0.0", b"s", "sh", "env1", "sig", ManifestStatus::Active).await.unwrap();
        let req = EnqueueRequest { plugin_name: "p".into(), params: serde_json::json!({}), priority: 0 };
        let ids = db.enqueue_jobs(version, &[req]).await.unwrap();
        db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();

        let tx = spawn(db.clone(), ids[0], "host-a".to_string(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;
        let _ = tx.send(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let job = db.get_job(ids[0]).await.unwrap();
        assert!(job.heartbeat_time.is_some());
    }
}
