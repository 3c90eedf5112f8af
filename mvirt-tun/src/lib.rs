//! mvirt-tun: data plane of a virtual point-to-point network adapter
//!
//! Moves IP packets between a host network stack and user-space consumers
//! that read and write batched exchange buffers.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod decoder;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod queue;
pub mod read_queue;
pub mod registry;
pub mod stats;
pub mod tun;

pub use adapter::{
    Adapter, AdapterId, Consumer, InboundPacket, MediaConnectState, NetworkStack, PauseStatus,
};
pub use batch::{Batch, BatchStatus, CancelId, Packet};
pub use config::AdapterConfig;
pub use error::{AdapterError, ConfigError, FrameError, Result};
pub use lifecycle::{AdapterState, PowerState};
pub use registry::AdapterRegistry;
