//! `casparian publish <plugin-dir>` (§6, SPEC_FULL §4 "CLI `publish`
//! manifest bundle"): registers a plugin manifest from a directory
//! containing `plugin.py`, `lock.txt`, and `manifest.toml`.

use crate::config::{AuthMode, Config};
use anyhow::Context;
use casparian_db::ManifestStatus;
use casparian_security::{Gatekeeper, IdentityProvider, LocalProvider};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct TopicSpec {
    name: String,
    uri: String,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_mode() -> String {
    "append".to_string()
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    name: String,
    version: String,
    #[serde(default)]
    subscriptions: Vec<String>,
    #[serde(default)]
    default_params: serde_json::Value,
    #[serde(default)]
    topics: Vec<TopicSpec>,
}

pub struct PublishArgs {
    pub plugin_dir: PathBuf,
}

/// Returns 0 if the manifest lands ACTIVE, 3 if the Gatekeeper rejects it
/// (publishing a rejected manifest is not itself an error — §4.3 "Failure
/// yields a REJECTED manifest ... it never raises to the caller").
pub async fn run(args: PublishArgs, config: &Config) -> anyhow::Result<i32> {
    let manifest_raw = std::fs::read_to_string(args.plugin_dir.join("manifest.toml"))
        .with_context(|| format!("reading manifest.toml in {}", args.plugin_dir.display()))?;
    let manifest: ManifestFile = toml::from_str(&manifest_raw).context("parsing manifest.toml")?;

    let source_bytes = std::fs::read(args.plugin_dir.join("plugin.py")).context("reading plugin.py")?;
    let lockfile_bytes = std::fs::read(args.plugin_dir.join("lock.txt")).unwrap_or_default();
    let source_code = String::from_utf8(source_bytes.clone()).context("plugin source is not valid UTF-8")?;

    let source_hash = casparian_security::source_hash(&source_bytes);
    let env_signature = casparian_security::env_hash(&lockfile_bytes);
    let artifact_hash = casparian_security::compute_artifact_hash(&source_bytes, &lockfile_bytes);

    let identity: LocalProvider = match config.auth_mode {
        AuthMode::Local => LocalProvider::new(config.secret.clone().unwrap_or_default().into_bytes()),
        AuthMode::Enterprise => {
            anyhow::bail!("publish under AUTH_MODE=enterprise requires a pre-computed signature; local signing is not available")
        }
    };
    let signature = identity.sign_artifact(&artifact_hash).context("failed to sign plugin artifact")?;

    let report = Gatekeeper::new().validate(&source_code, &artifact_hash, &signature, &identity);
    let status = if report.safe { ManifestStatus::Active } else { ManifestStatus::Rejected };

    let db = config.connect_db().await?;
    db.insert_manifest(&manifest.name, &manifest.version, &source_bytes, &source_hash, &env_signature, &signature, status).await?;

    if !report.safe {
        eprintln!("REJECTED: {}", report.violations.join("; "));
        return Ok(3);
    }

    db.upsert_plugin_config(&manifest.name, &manifest.subscriptions, &manifest.default_params).await?;
    for topic in &manifest.topics {
        let mode = match topic.mode.as_str() {
            "overwrite" => casparian_db::SinkWriteMode::Overwrite,
            _ => casparian_db::SinkWriteMode::Append,
        };
        db.upsert_topic_config(&manifest.name, &topic.name, &topic.uri, mode).await?;
    }

    println!("published {} v{} (ACTIVE, env {})", manifest.name, manifest.version, env_signature);
    Ok(0)
}
