//! Batch and packet model
//!
//! A [`Batch`] is the unit the network stack hands to the adapter for
//! transmission. While queued it is wrapped in a [`BatchRef`], a shared
//! handle whose last drop returns the batch to the network stack together
//! with its final [`BatchStatus`]. A [`PacketRef`] points at one packet of a
//! shared batch and keeps the batch alive while the packet is being copied.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::adapter::NetworkStack;
use crate::lifecycle::InFlight;

/// An IP packet
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet").field("len", &self.len()).finish()
    }
}

/// Token grouping sends that the network stack may cancel together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelId(pub u64);

/// Final status of a batch, reported when it is returned to the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum BatchStatus {
    Success = 0,
    /// Evicted, cancelled, or no consumer attached
    Aborted,
    /// Adapter paused
    Paused,
    /// Adapter in a low power state
    LowPower,
    /// Batch contained an oversized packet
    InvalidLength,
    /// A packet could not be copied to the consumer
    Resources,
}

impl BatchStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BatchStatus::Success,
            1 => BatchStatus::Aborted,
            2 => BatchStatus::Paused,
            3 => BatchStatus::LowPower,
            4 => BatchStatus::InvalidLength,
            _ => BatchStatus::Resources,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == BatchStatus::Success
    }
}

/// Ordered packets submitted by the network stack as one unit.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    tag: u64,
    cancel_id: Option<CancelId>,
    packets: Vec<Packet>,
}

impl Batch {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            tag: 0,
            cancel_id: None,
            packets,
        }
    }

    /// A batch holding a single packet
    pub fn single(packet: impl Into<Packet>) -> Self {
        Self::new(vec![packet.into()])
    }

    /// Attach an opaque tag the network stack can use to recognise the batch
    /// when it is released.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_cancel_id(mut self, cancel_id: CancelId) -> Self {
        self.cancel_id = Some(cancel_id);
        self
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn cancel_id(&self) -> Option<CancelId> {
        self.cancel_id
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

struct Shared {
    batch: Batch,
    status: AtomicU8,
    stack: Arc<dyn NetworkStack>,
    // Retired after the release callback returns.
    _in_flight: Option<InFlight>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        let status = BatchStatus::from_u8(*self.status.get_mut());
        self.stack.release(batch, status);
    }
}

/// Shared handle to a batch owned by the adapter.
///
/// The handle count is the batch reference count; the thread dropping the
/// last handle returns the batch to the network stack, exactly once.
#[derive(Clone)]
pub struct BatchRef(Arc<Shared>);

impl BatchRef {
    pub fn new(batch: Batch, stack: Arc<dyn NetworkStack>, in_flight: Option<InFlight>) -> Self {
        BatchRef(Arc::new(Shared {
            batch,
            status: AtomicU8::new(BatchStatus::Success as u8),
            stack,
            _in_flight: in_flight,
        }))
    }

    pub fn batch(&self) -> &Batch {
        &self.0.batch
    }

    pub fn packet_count(&self) -> usize {
        self.0.batch.len()
    }

    pub fn packet(&self, index: usize) -> Option<&Packet> {
        self.0.batch.packets.get(index)
    }

    pub fn cancel_id(&self) -> Option<CancelId> {
        self.0.batch.cancel_id
    }

    /// Status the batch will be released with (last write wins)
    pub fn set_status(&self, status: BatchStatus) {
        self.0.status.store(status as u8, Ordering::Release);
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_u8(self.0.status.load(Ordering::Acquire))
    }

    /// Current number of handles
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &BatchRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRef")
            .field("tag", &self.0.batch.tag)
            .field("packets", &self.packet_count())
            .field("status", &self.status())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Cursor to one packet of a shared batch.
#[derive(Debug, Clone)]
pub struct PacketRef {
    batch: BatchRef,
    index: usize,
}

impl PacketRef {
    pub(crate) fn new(batch: BatchRef, index: usize) -> Self {
        debug_assert!(index < batch.packet_count());
        Self { batch, index }
    }

    pub fn batch(&self) -> &BatchRef {
        &self.batch
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        self.batch
            .packet(self.index)
            .map(Packet::data)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub(crate) fn into_parts(self) -> (BatchRef, usize) {
        (self.batch, self.index)
    }
}
