//! `casparian worker` (§6): runs a Worker, reading its own config plus this
//! binary's layered `Config` for the store connection.

use crate::config::Config;
use casparian_worker::{Worker, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;

pub struct WorkerArgs {
    pub capabilities: Vec<String>,
    pub sandbox: PathBuf,
    pub host: Option<String>,
    pub sentinel: Option<String>,
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
}

pub async fn run(args: WorkerArgs, config: &Config) -> anyhow::Result<i32> {
    let db = config.connect_db().await?;
    let host = args.host.unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let capabilities = if args.capabilities.is_empty() { vec!["default".to_string()] } else { args.capabilities };

    let worker_config = WorkerConfig {
        host,
        pid: std::process::id() as i64,
        capabilities,
        sandbox_executable: args.sandbox,
        environment_cache_root: config.home.join("envs"),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        job_timeout: None,
    };

    let worker = Worker::new(db, worker_config);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // §9: push and pull job acquisition are mutually exclusive per process.
    match args.sentinel {
        Some(addr) => {
            let capabilities = worker.capabilities().to_vec();
            let worker_id = worker.host().to_string();
            casparian_worker::broker::run(&worker, &addr, worker_id, capabilities, shutdown_rx).await?;
        }
        None => worker.run(shutdown_rx).await?,
    }
    Ok(0)
}
