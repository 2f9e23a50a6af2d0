//! Crate-wide error type.
//!
//! Recoverable conditions are absorbed and logged by the layer that detects
//! them; only the variants surfacing from startup abort the process.

use thiserror::Error;

use crate::{channel::ChannelError, telemetry::TelemetryError, topology::TopologyError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("startup failed: {0}")]
    Startup(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}
