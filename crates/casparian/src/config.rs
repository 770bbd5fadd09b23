//! Layered configuration (§3.2 ambient stack, §6 "Environment variables"):
//! built-in defaults, then `$CASPARIAN_HOME/config.toml`, then environment
//! variables — each tier overriding the last.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported CASPARIAN_DB_BACKEND '{0}' (only 'sqlite' is implemented)")]
    UnsupportedBackend(String),

    #[error("invalid AUTH_MODE '{0}' (expected 'local' or 'enterprise')")]
    InvalidAuthMode(String),

    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("could not parse {path} as TOML: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Sqlite,
}

impl DbBackend {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "sqlite" => Ok(DbBackend::Sqlite),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Enterprise,
}

impl AuthMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "local" => Ok(AuthMode::Local),
            "enterprise" => Ok(AuthMode::Enterprise),
            other => Err(ConfigError::InvalidAuthMode(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    db_backend: Option<String>,
    auth_mode: Option<String>,
    secret: Option<String>,
}

pub struct Config {
    pub home: PathBuf,
    pub db_backend: DbBackend,
    pub auth_mode: AuthMode,
    /// The shared HMAC secret for `AUTH_MODE=local` signing/verification.
    pub secret: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let home = casparian_logging::casparian_home();
        let file_config = read_file_config(&home.join("config.toml"))?;

        let db_backend_raw = std::env::var("CASPARIAN_DB_BACKEND").ok().or(file_config.db_backend).unwrap_or_else(|| "sqlite".to_string());
        let auth_mode_raw = std::env::var("AUTH_MODE").ok().or(file_config.auth_mode).unwrap_or_else(|| "local".to_string());
        let secret = std::env::var("CASPARIAN_SECRET").ok().or(file_config.secret);

        Ok(Self { home, db_backend: DbBackend::parse(&db_backend_raw)?, auth_mode: AuthMode::parse(&auth_mode_raw)?, secret })
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("casparian.sqlite")
    }

    pub async fn connect_db(&self) -> anyhow::Result<casparian_db::CasparianDb> {
        match self.db_backend {
            DbBackend::Sqlite => {
                std::fs::create_dir_all(&self.home)?;
                let db = casparian_db::CasparianDb::connect(casparian_db::DbConfig::file(self.db_path().to_string_lossy().as_ref())).await?;
                Ok(db)
            }
        }
    }
}

/// Missing config file is not an error — built-in defaults and env vars
/// still apply; a malformed one is.
fn read_file_config(path: &PathBuf) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.clone(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_backend_rejects_unsupported_values() {
        assert!(matches!(DbBackend::parse("duckdb"), Err(ConfigError::UnsupportedBackend(_))));
        assert_eq!(DbBackend::parse("sqlite").unwrap(), DbBackend::Sqlite);
    }

    #[test]
    fn auth_mode_rejects_unknown_values() {
        assert!(matches!(AuthMode::parse("admin"), Err(ConfigError::InvalidAuthMode(_))));
        assert_eq!(AuthMode::parse("enterprise").unwrap(), AuthMode::Enterprise);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let missing = PathBuf::from("/nonexistent/casparian-config-test/config.toml");
        let config = read_file_config(&missing).unwrap();
        assert!(config.db_backend.is_none());
    }
}
