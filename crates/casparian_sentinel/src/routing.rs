//! The routing table (§4.4): `plugin_name -> required_env_signature,
//! active_artifact_id`, cached in memory and atomically swapped on RELOAD so
//! a hot-reload never interrupts a dispatch already in flight.

use crate::error::Result;
use casparian_db::CasparianDb;
use casparian_protocol::{SinkMode, SinkTarget};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One plugin's dispatch-ready routing entry: everything needed to build a
/// DISPATCH payload without a store round-trip, snapshotted at reload time.
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub env_signature: String,
    pub source_code: String,
    pub source_hash: String,
    pub topics: Vec<SinkTarget>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub plugins: HashMap<String, RoutingEntry>,
}

/// An `Arc<RwLock<Arc<RoutingSnapshot>>>` swap: readers take a snapshot
/// reference under a brief read lock, then release it before using the data,
/// so a concurrent `reload` never blocks on an in-flight dispatch and never
/// hands one a half-built table.
pub struct RoutingTable {
    current: RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { current: RwLock::new(Arc::new(RoutingSnapshot::default())) }
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.read().expect("routing table lock poisoned").clone()
    }

    /// Rehydrates from the store: every plugin with an ACTIVE manifest, its
    /// source and env_signature, and its configured sink topics. Swaps the
    /// whole table in one assignment once built, so readers never see a
    /// partially-populated snapshot.
    pub async fn reload(&self, db: &CasparianDb) -> Result<usize> {
        let plugin_names = db.list_active_plugin_names().await?;
        let mut plugins = HashMap::with_capacity(plugin_names.len());

        for name in plugin_names {
            let Some(manifest) = db.active_manifest(&name).await? else { continue };
            let source_code = match String::from_utf8(manifest.source_bytes.clone()) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let topics = db
                .topics_for_plugin(&name)
                .await?
                .into_iter()
                .map(|t| SinkTarget {
                    topic: t.topic_name,
                    uri: t.sink_uri,
                    mode: match t.mode {
                        casparian_db::SinkWriteMode::Append => SinkMode::Append,
                        casparian_db::SinkWriteMode::Overwrite => SinkMode::Overwrite,
                    },
                })
                .collect();

            plugins.insert(
                name,
                RoutingEntry { env_signature: manifest.env_signature, source_code, source_hash: manifest.source_hash, topics },
            );
        }

        let count = plugins.len();
        *self.current.write().expect("routing table lock poisoned") = Arc::new(RoutingSnapshot { plugins });
        info!(plugins = count, "routing table reloaded");
        Ok(count)
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casparian_db::{DbConfig, ManifestStatus};

    #[tokio::test]
    async fn reload_picks_up_active_manifests_only() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        db.insert_manifest("p1", "1.0.0", b"print(1)", "hash1", "env-a", "sig", ManifestStatus::Active).await.unwrap();
        db.insert_manifest("p2", "1.0.0", b"print(2)", "hash2", "env-b", "sig", ManifestStatus::Pending).await.unwrap();

        let table = RoutingTable::new();
        let count = table.reload(&db).await.unwrap();
        assert_eq!(count, 1);

        let snapshot = table.snapshot();
        assert!(snapshot.plugins.contains_key("p1"));
        assert!(!snapshot.plugins.contains_key("p2"));
    }

    #[tokio::test]
    async fn reload_swaps_atomically_so_a_held_snapshot_stays_stable() {
        let db = CasparianDb::connect(DbConfig::memory()).await.unwrap();
        db.insert_manifest("p1", "1.0.0", b"print(1)", "hash1", "env-a", "sig", ManifestStatus::Active).await.unwrap();

        let table = RoutingTable::new();
        table.reload(&db).await.unwrap();
        let held = table.snapshot();

        db.insert_manifest("p2", "1.0.0", b"print(2)", "hash2", "env-b", "sig", ManifestStatus::Active).await.unwrap();
        table.reload(&db).await.unwrap();

        assert_eq!(held.plugins.len(), 1, "previously-taken snapshot must not see the reload");
        assert_eq!(table.snapshot().plugins.len(), 2);
    }
}
