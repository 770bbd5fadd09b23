//! Pool creation and SQLite pragma tuning.

use crate::error::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn file(path: impl AsRef<str>) -> Self {
        Self { url: format!("sqlite:{}?mode=rwc", path.as_ref()), max_connections: 5 }
    }

    pub fn memory() -> Self {
        Self { url: "sqlite::memory:".to_string(), max_connections: 1 }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

pub async fn create_pool(config: DbConfig) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new().max_connections(config.max_connections).connect(&config.url).await?;
    apply_pragmas(&pool).await?;
    info!(url = %config.url, "connected to metadata store");
    Ok(pool)
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_connects() {
        let pool = create_pool(DbConfig::memory()).await;
        assert!(pool.is_ok());
    }
}
