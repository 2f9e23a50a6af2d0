//! # tierplace
//!
//! A userspace control plane for tiered-memory page placement on NUMA
//! machines that pair fast volatile DRAM with slower persistent NVRAM.
//! Bound processes have their hot pages kept on the DRAM tier and their
//! cold pages pushed down, driven by two signals: per-tier occupancy
//! crossing configured thresholds, and persistent-memory write bandwidth
//! exceeding a saturation threshold (which means hot pages are trapped on
//! the slow tier).
//!
//! Page discovery is delegated to a kernel collaborator reached over a
//! netlink channel ([channel]); discovered candidates are migrated in
//! pid-grouped batches fanned out across a worker pool ([migration]); the
//! periodic decision maker lives in [placement]; `bind`/`unbind` and debug
//! commands arrive through [admin].

pub mod admin;
pub mod candidates;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod migration;
pub mod placement;
pub mod telemetry;
pub mod topology;

pub use crate::{
    config::ControllerConfiguration,
    controller::Controller,
    error::Error,
};

/// Initializes [env_logger](https://docs.rs/env_logger) for the process.
/// Safe to call more than once.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
