//! Casparian Flow Worker.
//!
//! Usage:
//!     casparian-worker --capability env-a --capability env-b --output ./output

use casparian_db::{CasparianDb, DbConfig};
use casparian_logging::{casparian_home, LogConfig};
use casparian_worker::{Worker, WorkerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "casparian-worker", about = "Worker for Casparian Flow")]
struct Args {
    /// Accepted environment signatures; a job only claims this worker if its
    /// plugin's env_signature is in this list.
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// Sandbox executable to spawn per job.
    #[arg(long, default_value = "casparian-sandbox")]
    sandbox: PathBuf,

    /// Worker host identifier; defaults to a random id so two workers on the
    /// same machine never collide in the store's worker_host column.
    #[arg(long)]
    host: Option<String>,

    /// Sentinel ZMQ ROUTER address to connect to for pushed DISPATCH. When
    /// omitted the worker only polls the store directly.
    #[arg(long)]
    sentinel: Option<String>,

    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = 30)]
    heartbeat_interval_secs: u64,

    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    casparian_logging::init_logging(LogConfig { app_name: "casparian-worker", verbose: args.verbose })?;

    let host = args.host.unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
    let capabilities = if args.capabilities.is_empty() { vec!["default".to_string()] } else { args.capabilities };

    let db_path = casparian_home().join("casparian.sqlite");
    let db = CasparianDb::connect(DbConfig::file(db_path.to_string_lossy().as_ref())).await?;

    tracing::info!(%host, ?capabilities, "starting worker");

    let config = WorkerConfig {
        host,
        pid: std::process::id() as i64,
        capabilities,
        sandbox_executable: args.sandbox,
        environment_cache_root: casparian_home().join("envs"),
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        job_timeout: None,
    };

    let worker = Worker::new(db, config);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // §9 design notes: push (Sentinel-dispatch) and pull (store polling) job
    // acquisition are mutually exclusive per worker process; `--sentinel`
    // is the per-process configuration choice between the two.
    match args.sentinel {
        Some(addr) => {
            let capabilities = worker.capabilities().to_vec();
            let worker_id = worker.host().to_string();
            casparian_worker::broker::run(&worker, &addr, worker_id, capabilities, shutdown_rx).await?;
        }
        None => worker.run(shutdown_rx).await?,
    }
    Ok(())
}
