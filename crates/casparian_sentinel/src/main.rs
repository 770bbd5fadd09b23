//! Casparian Flow Sentinel.
//!
//! Usage:
//!     casparian-sentinel --bind tcp://0.0.0.0:5555

use casparian_db::{CasparianDb, DbConfig};
use casparian_logging::{casparian_home, LogConfig};
use casparian_sentinel::{router, SentinelConfig};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "casparian-sentinel", about = "Broker for Casparian Flow")]
struct Args {
    #[arg(long, default_value = "tcp://0.0.0.0:5555")]
    bind: String,

    #[arg(long, default_value_t = 200)]
    dispatch_tick_ms: u64,

    #[arg(long, default_value_t = 5)]
    supervisor_tick_secs: u64,

    /// Drop a worker from the registry after this many seconds without a
    /// ZMQ heartbeat.
    #[arg(long, default_value_t = 90)]
    worker_timeout_secs: i64,

    /// Reclaim a job's store lease after this many seconds without a
    /// heartbeat write (§8 scenario 4: "after 3*I").
    #[arg(long, default_value_t = 90)]
    lease_timeout_secs: i64,

    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    casparian_logging::init_logging(LogConfig { app_name: "casparian-sentinel", verbose: args.verbose })?;

    let db_path = casparian_home().join("casparian.sqlite");
    let db = CasparianDb::connect(DbConfig::file(db_path.to_string_lossy().as_ref())).await?;

    tracing::info!(bind = %args.bind, "starting sentinel");

    let config = SentinelConfig {
        bind_addr: args.bind,
        dispatch_tick: Duration::from_millis(args.dispatch_tick_ms),
        supervisor_tick: Duration::from_secs(args.supervisor_tick_secs),
        worker_timeout: Duration::from_secs(args.worker_timeout_secs.max(0) as u64),
        lease_timeout: chrono::Duration::seconds(args.lease_timeout_secs),
    };

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    router::run(db, config, shutdown_rx).await?;
    Ok(())
}
