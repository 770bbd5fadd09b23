//! Casparian Flow CLI.
//!
//! Usage:
//!     casparian scan <path> [--json]
//!     casparian publish <plugin-dir>
//!     casparian worker [--sentinel tcp://host:5555]
//!     casparian sentinel [--bind tcp://0.0.0.0:5555]

use casparian::cli::{publish, scan, sentinel, worker};
use casparian::config::Config;
use casparian_logging::LogConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "casparian", about = "Casparian Flow: file discovery, tagging, and distributed plugin execution")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run Scout once over a directory and print a summary.
    Scan {
        path: PathBuf,
        #[arg(long)]
        json: bool,
        /// Force-enqueue these plugins for every new file version, in
        /// addition to whatever RoutingRule tags resolve to.
        #[arg(long = "plugin")]
        plugin: Vec<String>,
    },
    /// Register a plugin manifest from a directory of plugin.py/lock.txt/manifest.toml.
    Publish { plugin_dir: PathBuf },
    /// Run a Worker.
    Worker {
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long, default_value = "casparian-sandbox")]
        sandbox: PathBuf,
        #[arg(long)]
        host: Option<String>,
        /// Sentinel ZMQ ROUTER address; omit to poll the store directly.
        #[arg(long)]
        sentinel: Option<String>,
        #[arg(long, default_value_t = 2)]
        poll_interval_secs: u64,
        #[arg(long, default_value_t = 30)]
        heartbeat_interval_secs: u64,
    },
    /// Run the Sentinel broker.
    Sentinel {
        #[arg(long, default_value = "tcp://0.0.0.0:5555")]
        bind: String,
        #[arg(long, default_value_t = 200)]
        dispatch_tick_ms: u64,
        #[arg(long, default_value_t = 5)]
        supervisor_tick_secs: u64,
        #[arg(long, default_value_t = 90)]
        worker_timeout_secs: i64,
        #[arg(long, default_value_t = 90)]
        lease_timeout_secs: i64,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(1);
        }
    };

    casparian_logging::init_logging(LogConfig { app_name: "casparian", verbose: cli.verbose })?;

    match cli.command {
        Command::Scan { path, json, plugin } => scan::run(scan::ScanArgs { path, plugin, json }, &config).await,
        Command::Publish { plugin_dir } => publish::run(publish::PublishArgs { plugin_dir }, &config).await,
        Command::Worker { capabilities, sandbox, host, sentinel, poll_interval_secs, heartbeat_interval_secs } => {
            worker::run(worker::WorkerArgs { capabilities, sandbox, host, sentinel, poll_interval_secs, heartbeat_interval_secs }, &config).await
        }
        Command::Sentinel { bind, dispatch_tick_ms, supervisor_tick_secs, worker_timeout_secs, lease_timeout_secs } => {
            sentinel::run(sentinel::SentinelArgs { bind, dispatch_tick_ms, supervisor_tick_secs, worker_timeout_secs, lease_timeout_secs }, &config).await
        }
    }
}
