//! End-to-end: a published, ACTIVE manifest's subscriptions drive Scout's
//! enqueue decision for a freshly discovered file (§4.2, §4.3).

use casparian::scout;
use casparian_db::{CasparianDb, DbConfig, ManifestStatus};
use casparian_security::{Gatekeeper, IdentityProvider, LocalProvider};
use std::fs;

const PLUGIN_SOURCE: &str = "class CsvPlugin(BasePlugin):\n    def process(self, ctx):\n        pass\n";

#[tokio::test]
async fn published_plugin_receives_jobs_for_matching_tags() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("nightly.csv"), b"a,b,c\n1,2,3\n").unwrap();

    let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
    db.upsert_routing_rule("*.csv", "csv", 10).await.unwrap();

    let source_bytes = PLUGIN_SOURCE.as_bytes();
    let lockfile_bytes = b"";
    let artifact_hash = casparian_security::compute_artifact_hash(source_bytes, lockfile_bytes);
    let identity = LocalProvider::new(b"test-secret".to_vec());
    let signature = identity.sign_artifact(&artifact_hash).unwrap();

    let report = Gatekeeper::new().validate(PLUGIN_SOURCE, &artifact_hash, &signature, &identity);
    assert!(report.safe, "expected a clean manifest, got violations: {:?}", report.violations);

    db.insert_manifest(
        "csv_processor",
        "1.0.0",
        source_bytes,
        &casparian_security::source_hash(source_bytes),
        &casparian_security::env_hash(lockfile_bytes),
        &signature,
        ManifestStatus::Active,
    )
    .await
    .unwrap();
    db.upsert_plugin_config("csv_processor", &["csv".to_string()], &serde_json::json!({})).await.unwrap();

    let summary = scout::run_once(&db, dir.path(), &[]).await.unwrap();
    assert_eq!(summary.new_versions, 1);
    assert_eq!(summary.jobs_enqueued, 1);

    let caps = vec![casparian_security::env_hash(lockfile_bytes)];
    let claimed = db.claim_next_job(&caps, "host-a", 1).await.unwrap();
    assert!(claimed.is_some());
    assert_eq!(claimed.unwrap().plugin_name, "csv_processor");
}

#[tokio::test]
async fn rejected_manifest_still_blocks_dispatch_via_claim_next_job() {
    let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();

    // A plugin importing `os` fails the Gatekeeper's banned-module check.
    let unsafe_source = "import os\nclass BadPlugin(BasePlugin):\n    pass\n";
    let artifact_hash = casparian_security::compute_artifact_hash(unsafe_source.as_bytes(), b"");
    let identity = LocalProvider::new(b"test-secret".to_vec());
    let signature = identity.sign_artifact(&artifact_hash).unwrap();
    let report = Gatekeeper::new().validate(unsafe_source, &artifact_hash, &signature, &identity);
    assert!(!report.safe);

    db.insert_manifest("bad_plugin", "1.0.0", unsafe_source.as_bytes(), "h", "env1", &signature, ManifestStatus::Rejected).await.unwrap();

    // No ACTIVE manifest exists for "env1", so nothing can ever claim against it.
    let claimed = db.claim_next_job(&["env1".to_string()], "host-a", 1).await.unwrap();
    assert!(claimed.is_none());
}
