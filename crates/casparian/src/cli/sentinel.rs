//! `casparian sentinel` (§6): runs the Sentinel broker against this
//! binary's layered `Config` for the store connection.

use crate::config::Config;
use casparian_sentinel::SentinelConfig;
use std::time::Duration;

pub struct SentinelArgs {
    pub bind: String,
    pub dispatch_tick_ms: u64,
    pub supervisor_tick_secs: u64,
    pub worker_timeout_secs: i64,
    pub lease_timeout_secs: i64,
}

pub async fn run(args: SentinelArgs, config: &Config) -> anyhow::Result<i32> {
    let db = config.connect_db().await?;

    let sentinel_config = SentinelConfig {
        bind_addr: args.bind,
        dispatch_tick: Duration::from_millis(args.dispatch_tick_ms),
        supervisor_tick: Duration::from_secs(args.supervisor_tick_secs),
        worker_timeout: Duration::from_secs(args.worker_timeout_secs.max(0) as u64),
        lease_timeout: chrono::Duration::seconds(args.lease_timeout_secs),
    };

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    casparian_sentinel::run(db, sentinel_config, shutdown_rx).await?;
    Ok(0)
}
