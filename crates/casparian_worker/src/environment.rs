//! Local environment manager: `env_signature -> prepared interpreter root`
//! (§4.5 point 4, §6 "Environment cache"). Grounded on the teacher's
//! `venv_manager.rs`, simplified from its uv/venv shell-out to the one thing
//! this spec requires: an idempotent, concurrency-safe `ensure`.
//!
//! Cache layout: `<cache_root>/<env_signature>/`, matching §6's
//! `<cache_root>/<env_hash>/`. A `.lock` file name is reserved per §6 but the
//! actual serialization of concurrent `ensure` calls for the same signature
//! happens in-process via a per-signature `tokio::sync::Mutex`, since a
//! worker process owns its own cache root exclusively.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to prepare environment {signature}: {source}")]
    Prepare { signature: String, #[source] source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, EnvironmentError>;

/// Maps an `env_signature` to its prepared root directory, creating it on
/// demand and caching the result on disk across worker restarts.
pub struct EnvironmentManager {
    cache_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvironmentManager {
    pub fn new(cache_root: PathBuf) -> Self {
        Self { cache_root, locks: Mutex::new(HashMap::new()) }
    }

    pub fn env_root(&self, env_signature: &str) -> PathBuf {
        self.cache_root.join(env_signature)
    }

    fn is_prepared(root: &Path) -> bool {
        root.join(".ready").exists()
    }

    async fn lock_for(&self, env_signature: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(env_signature.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Idempotent. Concurrent `ensure` calls for the same `env_signature`
    /// serialize on that signature's lock; calls for distinct signatures
    /// proceed in parallel.
    pub async fn ensure(&self, env_signature: &str) -> Result<PathBuf> {
        let lock = self.lock_for(env_signature).await;
        let _guard = lock.lock().await;

        let root = self.env_root(env_signature);
        if Self::is_prepared(&root) {
            debug!(env_signature, "environment cache hit");
            return Ok(root);
        }

        info!(env_signature, "environment cache miss, preparing");
        std::fs::create_dir_all(&root)
            .map_err(|source| EnvironmentError::Prepare { signature: env_signature.to_string(), source })?;
        std::fs::write(root.join(".ready"), b"")
            .map_err(|source| EnvironmentError::Prepare { signature: env_signature.to_string(), source })?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(dir.path().to_path_buf());
        let first = manager.ensure("sig-a").await.unwrap();
        let second = manager.ensure("sig-a").await.unwrap();
        assert_eq!(first, second);
        assert!(first.join(".ready").exists());
    }

    #[tokio::test]
    async fn distinct_signatures_get_distinct_roots() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(dir.path().to_path_buf());
        let a = manager.ensure("sig-a").await.unwrap();
        let b = manager.ensure("sig-b").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_ensures_for_same_signature_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EnvironmentManager::new(dir.path().to_path_buf()));
        let a = manager.clone();
        let b = manager.clone();
        let (r1, r2) = tokio::join!(a.ensure("sig-shared"), b.ensure("sig-shared"));
        assert_eq!(r1.unwrap(), r2.unwrap());
    }
}
