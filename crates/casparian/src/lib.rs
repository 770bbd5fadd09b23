//! The `casparian` CLI: Scout discovery/tagging/enqueue, plugin publishing,
//! and thin launchers for the Worker and Sentinel binaries' logic, unified
//! behind one layered configuration (§3.2, §6).

pub mod cli;
pub mod config;
pub mod scout;
