//! The Metadata Store (§3, §4.1): SQLite-backed gateway for the data model
//! shared by the Scout, Worker, and Sentinel.

pub mod error;
pub mod pool;
mod schema;
mod store;
pub mod types;

pub use error::{DbError, Result};
pub use pool::DbConfig;
pub use store::CasparianDb;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_protocol::ErrorKind;

    async fn test_db() -> CasparianDb {
        CasparianDb::connect(DbConfig::memory()).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_source_root_is_idempotent_on_path() {
        let db = test_db().await;
        let a = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let b = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn record_version_is_a_no_op_for_unchanged_content() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();

        let now = chrono::Utc::now();
        let (v1, is_new1) = db.record_version(location, "deadbeef", 16, now, vec!["csv".into()]).await.unwrap();
        assert!(is_new1);

        let (v2, is_new2) = db.record_version(location, "deadbeef", 16, now, vec!["csv".into()]).await.unwrap();
        assert!(!is_new2);
        assert_eq!(v1, v2);

        let (v3, is_new3) = db.record_version(location, "cafebabe", 20, now, vec!["csv".into()]).await.unwrap();
        assert!(is_new3);
        assert_ne!(v1, v3);
    }

    #[tokio::test]
    async fn enqueue_jobs_dedupes_non_terminal_state() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();

        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        let first = db.enqueue_jobs(version, &[req.clone()]).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = db.enqueue_jobs(version, &[req]).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_next_job_is_exclusive_under_race() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        db.enqueue_jobs(version, &[req]).await.unwrap();

        let caps = vec!["env1".to_string()];
        let a = db.claim_next_job(&caps, "host-a", 1).await.unwrap();
        let b = db.claim_next_job(&caps, "host-b", 2).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn claim_requires_matching_env_signature() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env-required", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        db.enqueue_jobs(version, &[req]).await.unwrap();

        let wrong_caps = vec!["env-other".to_string()];
        let claimed = db.claim_next_job(&wrong_caps, "host-a", 1).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn fail_job_retryable_returns_to_pending_and_increments_retry_count() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        let ids = db.enqueue_jobs(version, &[req]).await.unwrap();
        let job_id = ids[0];

        db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();
        db.fail_job(job_id, ErrorKind::TransientIo, "disk full", true).await.unwrap();

        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
    }

    #[tokio::test]
    async fn fail_job_non_retryable_is_terminal() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        let ids = db.enqueue_jobs(version, &[req]).await.unwrap();
        let job_id = ids[0];

        db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();
        db.fail_job(job_id, ErrorKind::Validation, "reserved column", false).await.unwrap();

        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn reclaim_stalled_returns_expired_leases_to_pending() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        db.enqueue_jobs(version, &[req]).await.unwrap();
        db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();

        let reclaimed = db.reclaim_stalled(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(reclaimed, 1);
    }

    #[tokio::test]
    async fn upsert_plugin_config_round_trips_through_plugins_for_tags() {
        let db = test_db().await;
        db.upsert_plugin_config("csv_processor", &["csv".to_string(), "nightly".to_string()], &serde_json::json!({"delimiter": ","}))
            .await
            .unwrap();

        let matched = db.plugins_for_tags(&["csv".to_string()]).await.unwrap();
        assert_eq!(matched, vec!["csv_processor".to_string()]);

        // Re-publishing replaces the subscription set rather than appending to it.
        db.upsert_plugin_config("csv_processor", &["json".to_string()], &serde_json::json!({})).await.unwrap();
        assert!(db.plugins_for_tags(&["csv".to_string()]).await.unwrap().is_empty());
        assert_eq!(db.plugins_for_tags(&["json".to_string()]).await.unwrap(), vec!["csv_processor".to_string()]);
    }

    #[tokio::test]
    async fn upsert_topic_config_updates_existing_topic_in_place() {
        let db = test_db().await;
        db.upsert_topic_config("csv_processor", "clean_rows", "sqlite:///out.db", SinkWriteMode::Append).await.unwrap();
        db.upsert_topic_config("csv_processor", "clean_rows", "/data/out.parquet", SinkWriteMode::Overwrite).await.unwrap();

        let topics = db.topics_for_plugin("csv_processor").await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].sink_uri, "/data/out.parquet");
        assert_eq!(topics[0].mode, SinkWriteMode::Overwrite);
    }

    #[tokio::test]
    async fn heartbeat_fails_once_lease_is_no_longer_held() {
        let db = test_db().await;
        let root = db.upsert_source_root("/data", SourceKind::Local).await.unwrap();
        let location = db.upsert_location(root, "a.csv", "a.csv").await.unwrap();
        let (version, _) = db.record_version(location, "deadbeef", 16, chrono::Utc::now(), vec![]).await.unwrap();
        db.insert_manifest("csv_processor", "1.0.0", b"src", "srchash", "env1", "sig", ManifestStatus::Active)
            .await
            .unwrap();
        let req = EnqueueRequest { plugin_name: "csv_processor".into(), params: serde_json::json!({}), priority: 0 };
        let ids = db.enqueue_jobs(version, &[req]).await.unwrap();
        let job_id = ids[0];
        db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();

        assert!(db.heartbeat(job_id, "host-b").await.is_err());
        assert!(db.heartbeat(job_id, "host-a").await.is_ok());
    }
}
