//! Error types for the adapter data plane

use std::io;

use thiserror::Error;

use crate::batch::BatchStatus;
use crate::lifecycle::AdapterState;

/// Exchange buffer framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Packet of {0} bytes exceeds the maximum IP packet size")]
    PacketTooLarge(usize),

    #[error("Record needs {needed} bytes, {available} available")]
    WontFit { needed: usize, available: usize },

    #[error("Truncated record at offset {offset}: needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Exchange buffer already holds the maximum number of packets")]
    TooManyPackets,

    #[error("Failed to allocate exchange buffer: {0}")]
    Alloc(#[from] std::collections::TryReserveError),
}

/// Adapter data plane and lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("No consumer attached")]
    NoConsumer,

    #[error("Adapter is paused")]
    Paused,

    #[error("Adapter is in a low power state")]
    LowPower,

    #[error("Adapter is closed ({0})")]
    ForcedClosed(AdapterState),

    #[error("Read request cancelled")]
    Cancelled,

    #[error("Adapter is not accepting consumers ({0})")]
    DeletePending(AdapterState),

    #[error("Invalid exchange buffer size {size} (expected {min}..={max})")]
    InvalidBuffer { size: usize, min: usize, max: usize },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: AdapterState,
        to: AdapterState,
    },

    #[error("Adapter name already in use: {0}")]
    NameInUse(String),

    #[error("Adapter not found: {0}")]
    NotFound(String),
}

impl AdapterError {
    /// Status reported to the network stack when a send is rejected.
    pub fn batch_status(&self) -> BatchStatus {
        match self {
            AdapterError::Paused => BatchStatus::Paused,
            AdapterError::LowPower => BatchStatus::LowPower,
            _ => BatchStatus::Aborted,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
