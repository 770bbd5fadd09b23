//! Orchestrates one Scout pass (§4.2): walk, hash, tag, version, enqueue.

use super::error::Result;
use super::tagger::Tagger;
use super::walker::{self, ScannedFile};
use casparian_db::{CasparianDb, EnqueueRequest, SourceKind};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::warn;

const HASH_CHUNK_SIZE: usize = 64 * 1024;
const WALK_THREADS: usize = 4;

#[derive(Debug, Default, Serialize)]
pub struct ScanSummary {
    pub files_scanned: usize,
    pub new_versions: usize,
    pub jobs_enqueued: usize,
    pub untagged: usize,
    pub errors: Vec<String>,
}

/// A collision-resistant digest over the full byte stream, read in fixed
/// chunks so hashing a large file never pulls it entirely into memory
/// (§4.2 "Versioning").
fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Runs one full Scout pass over `root`, enqueuing jobs for every new
/// FileVersion against its tag-derived plugin set unioned with
/// `manual_plugins` (§4.2 "Enqueue").
pub async fn run_once(db: &CasparianDb, root: &Path, manual_plugins: &[String]) -> Result<ScanSummary> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let root_id = db.upsert_source_root(&root.to_string_lossy(), SourceKind::Local).await?;

    let rules = db.list_routing_rules().await?;
    let tagger = Tagger::new(&rules)?;

    let root_for_walk = root.clone();
    let files: Vec<ScannedFile> = tokio::task::spawn_blocking(move || walker::walk(&root_for_walk, WALK_THREADS))
        .await
        .expect("walk task panicked")?;

    let mut summary = ScanSummary::default();

    for file in files {
        summary.files_scanned += 1;

        let hash_path = file.abs_path.clone();
        let hash = match tokio::task::spawn_blocking(move || hash_file(&hash_path)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                // Reading errors (permission denied, vanished file) are
                // logged and the entry skipped; they do not fail the walk.
                warn!(path = %file.abs_path.display(), error = %e, "scout: could not hash file, skipping");
                summary.errors.push(format!("{}: {e}", file.rel_path));
                continue;
            }
            Err(e) => {
                warn!(path = %file.abs_path.display(), error = %e, "scout: hash task panicked, skipping");
                summary.errors.push(format!("{}: hash task panicked", file.rel_path));
                continue;
            }
        };

        let tags = tagger.tags_for(&file.rel_path);
        if tags.is_empty() {
            summary.untagged += 1;
        }

        let filename = Path::new(&file.rel_path).file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_else(|| file.rel_path.clone());
        let location_id = db.upsert_location(root_id, &file.rel_path, &filename).await?;
        let (version_id, is_new) = db.record_version(location_id, &hash, file.size as i64, file.mtime, tags.clone()).await?;

        if !is_new {
            continue;
        }
        summary.new_versions += 1;

        let mut plugins = db.plugins_for_tags(&tags).await?;
        for manual in manual_plugins {
            if !plugins.contains(manual) {
                plugins.push(manual.clone());
            }
        }
        if plugins.is_empty() {
            continue;
        }

        let requests: Vec<EnqueueRequest> =
            plugins.into_iter().map(|plugin_name| EnqueueRequest { plugin_name, params: serde_json::json!({}), priority: 0 }).collect();

        match db.enqueue_jobs(version_id, &requests).await {
            Ok(ids) => summary.jobs_enqueued += ids.len(),
            Err(e) => {
                // Any per-job error aborts only that job's insertion, not the walk.
                warn!(path = %file.rel_path, error = %e, "scout: failed to enqueue jobs for new version");
                summary.errors.push(format!("{}: enqueue failed: {e}", file.rel_path));
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_db::DbConfig;
    use std::fs;

    #[tokio::test]
    async fn scans_tags_versions_and_enqueues_in_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), b"1,2,3").unwrap();

        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        db.upsert_routing_rule("*.csv", "csv", 10).await.unwrap();
        db.upsert_plugin_config("csv_processor", &["csv".to_string()], &serde_json::json!({})).await.unwrap();

        let summary = run_once(&db, dir.path(), &[]).await.unwrap();
        assert_eq!(summary.files_scanned, 1);
        assert_eq!(summary.new_versions, 1);
        assert_eq!(summary.jobs_enqueued, 1);
        assert_eq!(summary.untagged, 0);
    }

    #[tokio::test]
    async fn rescanning_unchanged_files_enqueues_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), b"1,2,3").unwrap();

        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        db.upsert_routing_rule("*.csv", "csv", 10).await.unwrap();
        db.upsert_plugin_config("csv_processor", &["csv".to_string()], &serde_json::json!({})).await.unwrap();

        run_once(&db, dir.path(), &[]).await.unwrap();
        let second = run_once(&db, dir.path(), &[]).await.unwrap();
        assert_eq!(second.files_scanned, 1);
        assert_eq!(second.new_versions, 0);
        assert_eq!(second.jobs_enqueued, 0);
    }

    #[tokio::test]
    async fn manual_plugins_are_unioned_with_tag_derived_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"\x00\x01").unwrap();

        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        let summary = run_once(&db, dir.path(), &["forced_plugin".to_string()]).await.unwrap();
        assert_eq!(summary.untagged, 1);
        assert_eq!(summary.jobs_enqueued, 1);
    }
}
