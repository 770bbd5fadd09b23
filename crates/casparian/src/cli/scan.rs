//! `casparian scan <path> [--json]` (§6).

use crate::config::Config;
use crate::scout;
use std::path::PathBuf;

pub struct ScanArgs {
    pub path: PathBuf,
    pub plugin: Vec<String>,
    pub json: bool,
}

/// Runs one Scout pass and prints a summary. Returns the process exit code:
/// 0 on a clean pass, 3 if any per-file error was absorbed along the way
/// (§6 "partial failure with structured JSON on stdout").
pub async fn run(args: ScanArgs, config: &Config) -> anyhow::Result<i32> {
    if !args.path.is_dir() {
        anyhow::bail!("not a directory: {}", args.path.display());
    }

    let db = config.connect_db().await?;
    let summary = scout::run_once(&db, &args.path, &args.plugin).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "scanned {} files: {} new versions, {} jobs enqueued, {} untagged",
            summary.files_scanned, summary.new_versions, summary.jobs_enqueued, summary.untagged
        );
        for err in &summary.errors {
            eprintln!("warning: {err}");
        }
    }

    Ok(if summary.errors.is_empty() { 0 } else { 3 })
}
