//! The Worker (§4.5-§4.9): claims jobs, prepares plugin environments, runs
//! the Sandbox subprocess, and fans out its output to the configured sinks.

pub mod bridge;
pub mod broker;
pub mod cancel;
pub mod context;
pub mod environment;
pub mod error;
pub mod heartbeat;
pub mod worker;

pub use bridge::{SandboxConfig, SandboxOutcome};
pub use cancel::CancellationToken;
pub use context::WorkerContext;
pub use environment::EnvironmentManager;
pub use error::{Result, WorkerError};
pub use worker::{Worker, WorkerConfig};
