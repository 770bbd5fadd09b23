//! Table definitions for all Metadata Store entities. Single source of truth.

use crate::error::Result;
use crate::CasparianDb;
use tracing::info;

impl CasparianDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_scout_tables().await?;
        self.create_routing_and_plugin_tables().await?;
        self.create_manifest_tables().await?;
        self.create_queue_tables().await?;
        self.create_worker_tables().await?;
        info!("metadata store schema verified");
        Ok(())
    }

    async fn create_scout_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS source_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_hash_registry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash_hex TEXT NOT NULL UNIQUE,
                first_seen_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_id INTEGER NOT NULL REFERENCES source_roots(id),
                rel_path TEXT NOT NULL,
                filename TEXT NOT NULL,
                current_version_id INTEGER,
                UNIQUE(root_id, rel_path)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS file_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES file_locations(id),
                hash_id INTEGER NOT NULL REFERENCES file_hash_registry(id),
                size INTEGER NOT NULL,
                mtime TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_versions_location ON file_versions(location_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_routing_and_plugin_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS routing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                tag TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_routing_rules_priority ON routing_rules(priority DESC, id ASC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugin_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL UNIQUE,
                subscription_tags TEXT NOT NULL DEFAULT '[]',
                default_params TEXT NOT NULL DEFAULT '{}'
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS topic_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL,
                topic_name TEXT NOT NULL,
                sink_uri TEXT NOT NULL,
                mode TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_topic_configs_plugin_topic ON topic_configs(plugin_name, topic_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_manifest_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS plugin_manifests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                source_bytes BLOB NOT NULL,
                source_hash TEXT NOT NULL,
                env_signature TEXT NOT NULL,
                signature TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL,
                UNIQUE(name, version)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_plugin_manifests_name_status ON plugin_manifests(name, status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS processing_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_version_id INTEGER NOT NULL REFERENCES file_versions(id),
                plugin_name TEXT NOT NULL,
                plugin_params TEXT NOT NULL DEFAULT '{}',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                worker_host TEXT,
                worker_pid INTEGER,
                claim_time TEXT,
                heartbeat_time TEXT,
                end_time TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                error_message TEXT,
                summary TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON processing_jobs(status, priority DESC, id ASC)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_plugin_version_nonterminal ON processing_jobs(plugin_name, file_version_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_heartbeat ON processing_jobs(status, heartbeat_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_worker_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS worker_nodes (
                host TEXT PRIMARY KEY,
                env_signature TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ONLINE'
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
