//! The Metadata Store gateway (§4.1): the narrow typed surface every other
//! component uses to read and mutate persisted state. No caller issues raw
//! SQL against these tables outside this module.

use crate::error::{DbError, Result};
use crate::types::{
    EnqueueRequest, FileVersion, JobStatus, ManifestStatus, PluginManifest, ProcessingJob, SinkWriteMode, SourceKind, SourceRoot,
};
use casparian_ids::{FileLocationId, FileVersionId, JobId, SourceRootId};
use casparian_protocol::ErrorKind;
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

#[derive(Clone)]
pub struct CasparianDb {
    pub(crate) pool: SqlitePool,
}

impl CasparianDb {
    pub async fn connect(config: crate::pool::DbConfig) -> Result<Self> {
        let pool = crate::pool::create_pool(config).await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -- Scout: source roots, locations, versions -----------------------------

    /// Idempotent on `path`.
    pub async fn upsert_source_root(&self, path: &str, kind: SourceKind) -> Result<SourceRootId> {
        let now = Utc::now().to_rfc3339();
        let kind_str = match kind {
            SourceKind::Local => "local",
            SourceKind::Managed => "managed",
            SourceKind::Other => "other",
        };
        sqlx::query(
            r#"INSERT INTO source_roots (path, kind, active, created_at, updated_at)
               VALUES (?, ?, 1, ?, ?)
               ON CONFLICT(path) DO UPDATE SET updated_at = excluded.updated_at"#,
        )
        .bind(path)
        .bind(kind_str)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM source_roots WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(SourceRootId::new(id))
    }

    /// Idempotent on `(root_id, rel_path)`.
    pub async fn upsert_location(
        &self,
        root_id: SourceRootId,
        rel_path: &str,
        filename: &str,
    ) -> Result<FileLocationId> {
        sqlx::query(
            r#"INSERT INTO file_locations (root_id, rel_path, filename)
               VALUES (?, ?, ?)
               ON CONFLICT(root_id, rel_path) DO UPDATE SET filename = excluded.filename"#,
        )
        .bind(root_id.get())
        .bind(rel_path)
        .bind(filename)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM file_locations WHERE root_id = ? AND rel_path = ?")
            .bind(root_id.get())
            .bind(rel_path)
            .fetch_one(&self.pool)
            .await?;
        Ok(FileLocationId::new(id))
    }

    async fn get_or_create_hash(&self, tx: &mut sqlx::Transaction<'_, Sqlite>, hash_hex: &str) -> Result<i64> {
        if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM file_hash_registry WHERE hash_hex = ?")
            .bind(hash_hex)
            .fetch_optional(&mut **tx)
            .await?
        {
            return Ok(id);
        }
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query("INSERT INTO file_hash_registry (hash_hex, first_seen_at) VALUES (?, ?)")
            .bind(hash_hex)
            .bind(&now)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    /// If the latest version for `location_id` has the same hash, returns it
    /// unchanged (`is_new = false`); otherwise appends a new version and
    /// advances `current_version_id` (§3).
    pub async fn record_version(
        &self,
        location_id: FileLocationId,
        hash_hex: &str,
        size: i64,
        mtime: DateTime<Utc>,
        tags: Vec<String>,
    ) -> Result<(FileVersionId, bool)> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64, i64)> = sqlx::query_as(
            r#"SELECT fv.id, fv.hash_id FROM file_versions fv
               JOIN file_locations fl ON fl.current_version_id = fv.id
               WHERE fl.id = ?"#,
        )
        .bind(location_id.get())
        .fetch_optional(&mut *tx)
        .await?;

        let hash_id = self.get_or_create_hash(&mut tx, hash_hex).await?;

        if let Some((existing_version_id, existing_hash_id)) = current {
            if existing_hash_id == hash_id {
                tx.commit().await?;
                return Ok((FileVersionId::new(existing_version_id), false));
            }
        }

        let now = Utc::now().to_rfc3339();
        let tags_json = serde_json::to_string(&tags)?;
        let new_version_id = sqlx::query(
            r#"INSERT INTO file_versions (location_id, hash_id, size, mtime, tags, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(location_id.get())
        .bind(hash_id)
        .bind(size)
        .bind(mtime.to_rfc3339())
        .bind(&tags_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE file_locations SET current_version_id = ? WHERE id = ?")
            .bind(new_version_id)
            .bind(location_id.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((FileVersionId::new(new_version_id), true))
    }

    // -- Scout: enqueue ---------------------------------------------------

    /// Batch insert; within a single transaction, any `(plugin, version_id)`
    /// already in a non-terminal state is silently skipped (§3, §4.1).
    pub async fn enqueue_jobs(&self, version_id: FileVersionId, requests: &[EnqueueRequest]) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;
        let mut enqueued = Vec::with_capacity(requests.len());

        for req in requests {
            let existing: Option<i64> = sqlx::query_scalar(
                r#"SELECT id FROM processing_jobs
                   WHERE file_version_id = ? AND plugin_name = ?
                   AND status NOT IN ('COMPLETED', 'FAILED', 'SKIPPED')"#,
            )
            .bind(version_id.get())
            .bind(&req.plugin_name)
            .fetch_optional(&mut *tx)
            .await?;

            if existing.is_some() {
                continue;
            }

            let params_json = serde_json::to_string(&req.params)?;
            let job_id = sqlx::query(
                r#"INSERT INTO processing_jobs (file_version_id, plugin_name, plugin_params, priority, status, retry_count)
                   VALUES (?, ?, ?, ?, 'PENDING', 0)"#,
            )
            .bind(version_id.get())
            .bind(&req.plugin_name)
            .bind(&params_json)
            .bind(req.priority)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            enqueued.push(JobId::from_i64(job_id));
        }

        tx.commit().await?;
        Ok(enqueued)
    }

    // -- Worker: claim, heartbeat, terminal transitions --------------------

    /// Atomic: selects the highest-priority PENDING job whose plugin has an
    /// ACTIVE manifest with an `env_signature` in `capabilities`, claims it
    /// under a single transaction, and returns it. If multiple claimants
    /// race, exactly one succeeds (§8 single-claim property).
    pub async fn claim_next_job(&self, capabilities: &[String], host: &str, pid: i64) -> Result<Option<ProcessingJob>> {
        if capabilities.is_empty() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"SELECT pj.id FROM processing_jobs pj
               WHERE pj.status = 'PENDING'
               AND EXISTS (
                   SELECT 1 FROM plugin_manifests pm
                   WHERE pm.name = pj.plugin_name AND pm.status = 'ACTIVE' AND pm.env_signature IN ("#,
        );
        let mut separated = builder.separated(", ");
        for capability in capabilities {
            separated.push_bind(capability);
        }
        builder.push("))");
        builder.push(" ORDER BY pj.priority DESC, pj.id ASC LIMIT 1");

        let job_id: Option<i64> = builder.build_query_scalar().fetch_optional(&mut *tx).await?;
        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        let rows_affected = sqlx::query(
            r#"UPDATE processing_jobs
               SET status = 'CLAIMED', worker_host = ?, worker_pid = ?, claim_time = ?, heartbeat_time = ?
               WHERE id = ? AND status = 'PENDING'"#,
        )
        .bind(host)
        .bind(pid)
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Lost the race to another claimant.
            tx.commit().await?;
            return Ok(None);
        }

        let job: ProcessingJob = sqlx::query_as("SELECT * FROM processing_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(job))
    }

    /// Refreshes the lease. Fails if the claim is no longer held by `host`.
    pub async fn heartbeat(&self, job_id: JobId, host: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let rows_affected = sqlx::query(
            r#"UPDATE processing_jobs SET heartbeat_time = ?
               WHERE id = ? AND worker_host = ? AND status IN ('CLAIMED', 'RUNNING')"#,
        )
        .bind(&now)
        .bind(job_id.as_i64())
        .bind(host)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DbError::LeaseLost {
                host: host.to_string(),
                reason: format!("job {job_id} is no longer claimed by this host"),
            });
        }
        Ok(())
    }

    /// Transitions CLAIMED to RUNNING once the worker starts streaming data.
    pub async fn mark_running(&self, job_id: JobId, host: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE processing_jobs SET status = 'RUNNING' WHERE id = ? AND worker_host = ? AND status = 'CLAIMED'",
        )
        .bind(job_id.as_i64())
        .bind(host)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(DbError::invalid_state(format!("job {job_id} is not CLAIMED by {host}")));
        }
        Ok(())
    }

    pub async fn complete_job(&self, job_id: JobId, summary: &serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let summary_json = serde_json::to_string(summary)?;
        sqlx::query("UPDATE processing_jobs SET status = 'COMPLETED', end_time = ?, summary = ? WHERE id = ?")
            .bind(&now)
            .bind(&summary_json)
            .bind(job_id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `retryable=true` with `retry_count < limit` flips back to PENDING and
    /// increments `retry_count`; otherwise terminal FAILED (§4.1).
    pub async fn fail_job(&self, job_id: JobId, kind: ErrorKind, message: &str, retryable: bool) -> Result<()> {
        let kind_str = serde_json::to_value(kind)?
            .as_str()
            .expect("ErrorKind serializes to a string")
            .to_owned();

        if retryable {
            let rows_affected = sqlx::query(
                r#"UPDATE processing_jobs
                   SET status = 'PENDING', worker_host = NULL, worker_pid = NULL, claim_time = NULL,
                       heartbeat_time = NULL, retry_count = retry_count + 1, error_kind = ?, error_message = ?
                   WHERE id = ? AND retry_count < ?"#,
            )
            .bind(&kind_str)
            .bind(message)
            .bind(job_id.as_i64())
            .bind(crate::types::DEFAULT_MAX_RETRIES)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if rows_affected > 0 {
                return Ok(());
            }
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE processing_jobs SET status = 'FAILED', end_time = ?, error_kind = ?, error_message = ?
               WHERE id = ?"#,
        )
        .bind(&now)
        .bind(&kind_str)
        .bind(message)
        .bind(job_id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Any CLAIMED/RUNNING job whose heartbeat age exceeds `lease_timeout` is
    /// returned to PENDING; `retry_count` is unchanged (recovery, not retry).
    /// Returns the number of jobs reclaimed.
    pub async fn reclaim_stalled(&self, lease_timeout: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - lease_timeout).to_rfc3339();
        let rows_affected = sqlx::query(
            r#"UPDATE processing_jobs
               SET status = 'PENDING', worker_host = NULL, worker_pid = NULL, claim_time = NULL, heartbeat_time = NULL
               WHERE status IN ('CLAIMED', 'RUNNING') AND heartbeat_time < ?"#,
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<ProcessingJob> {
        sqlx::query_as("SELECT * FROM processing_jobs WHERE id = ?")
            .bind(job_id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {job_id}")))
    }

    /// Resolves a file version to its absolute path, joining its source
    /// root's path with its location's `rel_path` (§3, §4.5 step 1).
    pub async fn file_path_for_version(&self, file_version_id: FileVersionId) -> Result<String> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT sr.path, fl.rel_path FROM file_versions fv
               JOIN file_locations fl ON fl.id = fv.location_id
               JOIN source_roots sr ON sr.id = fl.root_id
               WHERE fv.id = ?"#,
        )
        .bind(file_version_id.get())
        .fetch_optional(&self.pool)
        .await?;

        let (root_path, rel_path) =
            row.ok_or_else(|| DbError::not_found(format!("file_version {file_version_id}")))?;
        Ok(format!("{root_path}/{rel_path}"))
    }

    // -- Routing & plugin configuration ------------------------------------

    /// RoutingRules evaluated priority-descending, rule id ascending on ties (§4.2).
    pub async fn list_routing_rules(&self) -> Result<Vec<crate::types::RoutingRule>> {
        let rows = sqlx::query_as("SELECT * FROM routing_rules ORDER BY priority DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_routing_rule(&self, pattern: &str, tag: &str, priority: i64) -> Result<()> {
        sqlx::query("INSERT INTO routing_rules (pattern, tag, priority) VALUES (?, ?, ?)")
            .bind(pattern)
            .bind(tag)
            .bind(priority)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Registers (or updates) a plugin's tag subscriptions and default
    /// params, read back by `plugins_for_tags` during Scout enqueue (§4.2).
    pub async fn upsert_plugin_config(&self, plugin_name: &str, subscription_tags: &[String], default_params: &serde_json::Value) -> Result<()> {
        let tags_json = serde_json::to_string(subscription_tags)?;
        let params_json = serde_json::to_string(default_params)?;
        sqlx::query(
            r#"INSERT INTO plugin_configs (plugin_name, subscription_tags, default_params)
               VALUES (?, ?, ?)
               ON CONFLICT(plugin_name) DO UPDATE SET
                   subscription_tags = excluded.subscription_tags,
                   default_params = excluded.default_params"#,
        )
        .bind(plugin_name)
        .bind(&tags_json)
        .bind(&params_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Registers a sink topic a plugin publishes to (§4.8). A plugin may
    /// register the same topic more than once across republishes; callers
    /// that want a clean slate should not call this for topics they no
    /// longer use — topics are additive, not a full replace.
    pub async fn upsert_topic_config(&self, plugin_name: &str, topic_name: &str, sink_uri: &str, mode: SinkWriteMode) -> Result<()> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM topic_configs WHERE plugin_name = ? AND topic_name = ?")
            .bind(plugin_name)
            .bind(topic_name)
            .fetch_optional(&self.pool)
            .await?;
        let mode_str = match mode {
            SinkWriteMode::Append => "append",
            SinkWriteMode::Overwrite => "overwrite",
        };
        if let Some(id) = existing {
            sqlx::query("UPDATE topic_configs SET sink_uri = ?, mode = ? WHERE id = ?")
                .bind(sink_uri)
                .bind(mode_str)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("INSERT INTO topic_configs (plugin_name, topic_name, sink_uri, mode) VALUES (?, ?, ?, ?)")
                .bind(plugin_name)
                .bind(topic_name)
                .bind(sink_uri)
                .bind(mode_str)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Resolves a tag set to the plugins subscribed to any of those tags (§4.2).
    pub async fn plugins_for_tags(&self, tags: &[String]) -> Result<Vec<String>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let configs: Vec<crate::types::PluginConfig> =
            sqlx::query_as("SELECT * FROM plugin_configs").fetch_all(&self.pool).await?;
        let matched = configs
            .into_iter()
            .filter(|config| config.subscription_tags.0.iter().any(|sub| tags.contains(sub)))
            .map(|config| config.plugin_name)
            .collect();
        Ok(matched)
    }

    pub async fn topics_for_plugin(&self, plugin_name: &str) -> Result<Vec<crate::types::TopicConfig>> {
        let rows = sqlx::query_as("SELECT * FROM topic_configs WHERE plugin_name = ?")
            .bind(plugin_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Every plugin with a currently ACTIVE manifest, the set the Sentinel's
    /// routing table is built from (§4.4).
    pub async fn list_active_plugin_names(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT name FROM plugin_manifests WHERE status = 'ACTIVE'").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    // -- Gatekeeper / plugin manifests -------------------------------------

    pub async fn insert_manifest(
        &self,
        name: &str,
        version: &str,
        source_bytes: &[u8],
        source_hash: &str,
        env_signature: &str,
        signature: &str,
        status: ManifestStatus,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let status_str = match status {
            ManifestStatus::Pending => "PENDING",
            ManifestStatus::Rejected => "REJECTED",
            ManifestStatus::Active => "ACTIVE",
            ManifestStatus::Retired => "RETIRED",
        };
        let id = sqlx::query(
            r#"INSERT INTO plugin_manifests (name, version, source_bytes, source_hash, env_signature, signature, status, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(name, version) DO UPDATE SET
                   source_bytes = excluded.source_bytes,
                   source_hash = excluded.source_hash,
                   env_signature = excluded.env_signature,
                   signature = excluded.signature,
                   status = excluded.status"#,
        )
        .bind(name)
        .bind(version)
        .bind(source_bytes)
        .bind(source_hash)
        .bind(env_signature)
        .bind(signature)
        .bind(status_str)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn active_manifest(&self, plugin_name: &str) -> Result<Option<PluginManifest>> {
        let row = sqlx::query_as("SELECT * FROM plugin_manifests WHERE name = ? AND status = 'ACTIVE' ORDER BY id DESC LIMIT 1")
            .bind(plugin_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // -- Scout: source root listing -----------------------------------------

    pub async fn list_active_source_roots(&self) -> Result<Vec<SourceRoot>> {
        let rows = sqlx::query_as("SELECT * FROM source_roots WHERE active = 1").fetch_all(&self.pool).await?;
        Ok(rows)
    }

    // -- Worker registry (§4.9) ---------------------------------------------

    pub async fn upsert_worker_heartbeat(&self, host: &str, env_signature: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO worker_nodes (host, env_signature, last_heartbeat, status)
               VALUES (?, ?, ?, 'ONLINE')
               ON CONFLICT(host) DO UPDATE SET env_signature = excluded.env_signature,
                   last_heartbeat = excluded.last_heartbeat, status = 'ONLINE'"#,
        )
        .bind(host)
        .bind(env_signature)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_stale_workers_offline(&self, timeout: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - timeout).to_rfc3339();
        let rows_affected =
            sqlx::query("UPDATE worker_nodes SET status = 'OFFLINE' WHERE last_heartbeat < ? AND status = 'ONLINE'")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(rows_affected)
    }
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped)
    }
}
