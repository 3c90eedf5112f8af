//! Virtual point-to-point adapter
//!
//! An [`Adapter`] sits between a host network stack (anything implementing
//! [`NetworkStack`]) and user-space consumers attached through [`Consumer`]
//! handles. Outbound batches from the stack are queued until a consumer read
//! collects them; consumer writes are decoded and indicated to the stack
//! directly. Every data-plane call is gated by the adapter [`Lifecycle`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::batch::{Batch, BatchRef, BatchStatus, CancelId};
use crate::decoder::{self, DecodeReport};
use crate::error::{AdapterError, Result};
use crate::exchange::{EXCH_MAX_BUFFER_SIZE, EXCH_MIN_BUFFER_SIZE_READ, EXCH_MIN_BUFFER_SIZE_WRITE};
use crate::lifecycle::{AdapterState, Lifecycle, PowerState};
use crate::queue::PacketQueue;
use crate::read_queue::{HandleId, PendingRead, ReadQueue};
use crate::stats::{Statistics, StatisticsSnapshot};

pub use crate::decoder::InboundPacket;

/// Link state reported to the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaConnectState {
    Connected,
    Disconnected,
}

/// The host network stack side of an adapter.
///
/// Callbacks may run on any thread and may call back into the adapter's
/// data plane (`submit`, `cancel_send`). They must not call lifecycle
/// control operations.
pub trait NetworkStack: Send + Sync + 'static {
    /// Deliver packets written by a consumer.
    fn indicate(&self, packets: &mut [InboundPacket<'_>]);

    /// Return a submitted batch with its final status.
    fn release(&self, batch: Batch, status: BatchStatus);

    fn link_state(&self, _state: MediaConnectState) {}

    /// A pause that returned [`PauseStatus::Pending`] has completed.
    fn pause_complete(&self) {}
}

/// Unique adapter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterId(pub Uuid);

impl AdapterId {
    /// Create a new random AdapterId.
    pub fn new() -> Self {
        AdapterId(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AdapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of [`Adapter::pause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseStatus {
    /// The adapter is paused
    Complete,
    /// Operations are still in flight; the network stack is notified via
    /// [`NetworkStack::pause_complete`]
    Pending,
}

pub struct Adapter {
    id: AdapterId,
    name: String,
    lifecycle: Arc<Lifecycle>,
    queue: PacketQueue,
    reads: Arc<ReadQueue>,
    stack: Arc<dyn NetworkStack>,
    stats: Statistics,
    next_handle: AtomicU64,
}

impl Adapter {
    /// Create a halted adapter. Call [`initialize`](Self::initialize) before use.
    pub fn new(
        name: impl Into<String>,
        max_queued_batches: usize,
        stack: Arc<dyn NetworkStack>,
    ) -> Arc<Self> {
        let id = AdapterId::new();
        let pause_stack = Arc::clone(&stack);
        let lifecycle = Lifecycle::new(move || {
            info!(adapter = %id, "Pause completed");
            pause_stack.pause_complete();
        });

        Arc::new(Self {
            id,
            name: name.into(),
            lifecycle: Arc::new(lifecycle),
            queue: PacketQueue::new(max_queued_batches),
            reads: Arc::new(ReadQueue::new()),
            stack,
            stats: Statistics::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        self.lifecycle.state()
    }

    pub fn power(&self) -> PowerState {
        self.lifecycle.power()
    }

    /// Number of attached consumers
    pub fn consumers(&self) -> usize {
        self.lifecycle.handles()
    }

    pub fn queued_batches(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// `Halted -> Initializing -> Paused`, powered on, link down.
    pub fn initialize(&self) -> Result<()> {
        {
            let guard = self.lifecycle.exclusive();
            self.lifecycle
                .transition(&guard, AdapterState::Initializing)?;
            self.lifecycle.set_power(PowerState::D0);
            self.lifecycle.transition(&guard, AdapterState::Paused)?;
        }
        self.stack.link_state(MediaConnectState::Disconnected);
        info!(adapter = %self.id, name = %self.name, "Adapter initialized");
        Ok(())
    }

    /// Start sending and receiving: `Paused -> Restarting -> Running`.
    pub fn restart(&self) -> Result<()> {
        let guard = self.lifecycle.exclusive();
        self.lifecycle.restart(&guard)?;
        info!(adapter = %self.id, "Adapter running");
        Ok(())
    }

    /// Stop accepting sends and flush the queue with a paused status.
    pub fn pause(&self) -> Result<PauseStatus> {
        {
            let guard = self.lifecycle.exclusive();
            self.lifecycle.transition(&guard, AdapterState::Pausing)?;
        }
        self.clear(BatchStatus::Paused);

        if self.lifecycle.finish_pause() {
            info!(adapter = %self.id, "Adapter paused");
            Ok(PauseStatus::Complete)
        } else {
            debug!(
                adapter = %self.id,
                in_flight = self.lifecycle.in_flight(),
                "Pause pending on in-flight operations"
            );
            Ok(PauseStatus::Pending)
        }
    }

    /// Tear down the data plane and return to `Halted`.
    ///
    /// Queued batches are released as aborted and pending reads fail with
    /// [`AdapterError::ForcedClosed`]. Blocks until in-progress data-plane
    /// calls have left.
    pub fn halt(&self) -> Result<()> {
        {
            let guard = self.lifecycle.exclusive();
            self.lifecycle.transition(&guard, AdapterState::Halting)?;
        }
        self.flush_for_halt();

        // Wait for every data-plane call that entered before `Halting`.
        drop(self.lifecycle.exclusive());
        self.flush_for_halt();

        let guard = self.lifecycle.exclusive();
        self.lifecycle.reset_in_flight(&guard);
        self.lifecycle.set_power(PowerState::Unspecified);
        self.lifecycle.transition(&guard, AdapterState::Halted)?;
        info!(adapter = %self.id, "Adapter halted");
        Ok(())
    }

    fn flush_for_halt(&self) {
        self.clear(BatchStatus::Aborted);
        let failed = self
            .reads
            .complete_all(AdapterError::ForcedClosed(AdapterState::Halting));
        if failed > 0 {
            debug!(adapter = %self.id, reads = failed, "Forced pending reads closed");
        }
    }

    /// Enter the terminal `Shutdown` state.
    pub fn shutdown(&self) -> Result<()> {
        let guard = self.lifecycle.exclusive();
        self.lifecycle.transition(&guard, AdapterState::Shutdown)?;
        info!(adapter = %self.id, "Adapter shut down");
        Ok(())
    }

    /// Change the power state. Leaving `D0` for a low-power state flushes
    /// the queue with a low-power status.
    ///
    /// Takes the transition lock exclusively, so no send that passed its
    /// power check can queue behind the flush.
    pub fn set_power_state(&self, power: PowerState) {
        let flushed = {
            let _exclusive = self.lifecycle.exclusive();
            let previous = self.lifecycle.set_power(power);
            debug!(adapter = %self.id, from = ?previous, to = ?power, "Power state changed");
            if previous == PowerState::D0 && power.is_low_power() {
                self.queue.take_all(BatchStatus::LowPower)
            } else {
                Vec::new()
            }
        };
        if !flushed.is_empty() {
            debug!(adapter = %self.id, batches = flushed.len(), "Flushed queue for low power");
        }
    }

    /// Submit outbound batches.
    ///
    /// If the adapter cannot send (no consumer, not running, low power) every
    /// batch is released right away with the matching status. Otherwise the
    /// batches are queued and handed to pending reads.
    pub fn submit(&self, batches: impl IntoIterator<Item = Batch>) {
        let op = self.lifecycle.enter();
        if let Err(e) = op.check() {
            let status = e.batch_status();
            for batch in batches {
                trace!(adapter = %self.id, error = %e, "Rejecting send");
                self.stack.release(batch, status);
            }
            return;
        }

        for batch in batches {
            let batch = BatchRef::new(
                batch,
                Arc::clone(&self.stack),
                Some(self.lifecycle.in_flight_token()),
            );
            self.queue.append(batch, &self.stats);
        }
        self.queue.process(&self.reads, &self.stats);
    }

    /// Release every queued batch carrying `cancel_id` as aborted.
    pub fn cancel_send(&self, cancel_id: CancelId) -> usize {
        let _shared = self.lifecycle.shared();
        self.queue.cancel(cancel_id, &self.stats)
    }

    /// Release every queued batch with `status`.
    pub fn clear(&self, status: BatchStatus) -> usize {
        let _shared = self.lifecycle.shared();
        self.queue.clear(status, &self.stats)
    }

    /// Attach a consumer. The adapter must be at least paused.
    pub fn open(self: &Arc<Self>) -> Result<Consumer> {
        let handles = {
            let guard = self.lifecycle.exclusive();
            let state = self.lifecycle.state();
            if !state.accepts_io() {
                return Err(AdapterError::DeletePending(state));
            }
            self.lifecycle.open_handle(&guard)
        };
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.stack.link_state(MediaConnectState::Connected);
        info!(adapter = %self.id, handle = %id, handles, "Consumer attached");
        Ok(Consumer {
            adapter: Arc::clone(self),
            id,
        })
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle)
            .field("queued_batches", &self.queue.len())
            .field("pending_reads", &self.reads.len())
            .finish()
    }
}

fn validate_buffer(size: usize, min: usize) -> Result<()> {
    if size < min || size > EXCH_MAX_BUFFER_SIZE {
        warn!(size, min, max = EXCH_MAX_BUFFER_SIZE, "Rejecting exchange buffer");
        return Err(AdapterError::InvalidBuffer {
            size,
            min,
            max: EXCH_MAX_BUFFER_SIZE,
        });
    }
    Ok(())
}

/// A consumer's connection to an adapter.
///
/// Dropping it cancels its pending reads and detaches it. When the last
/// consumer detaches the link goes down and queued batches are aborted.
pub struct Consumer {
    adapter: Arc<Adapter>,
    id: HandleId,
}

impl Consumer {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Queue a read of up to `capacity` bytes.
    ///
    /// The returned future resolves with an exchange buffer holding one or
    /// more packet records. Reads pend while the adapter is paused.
    pub fn read(&self, capacity: usize) -> Result<PendingRead> {
        let adapter = &self.adapter;
        let _shared = adapter.lifecycle.shared();
        let state = adapter.lifecycle.state();
        if !state.accepts_io() {
            return Err(AdapterError::ForcedClosed(state));
        }
        validate_buffer(capacity, EXCH_MIN_BUFFER_SIZE_READ)?;

        let pending = adapter.reads.submit(self.id, capacity);
        adapter.queue.process(&adapter.reads, &adapter.stats);
        Ok(pending)
    }

    /// Decode an exchange buffer and indicate its packets to the network
    /// stack. The buffer is not referenced after this returns.
    pub fn write(&self, buf: &[u8]) -> Result<DecodeReport> {
        let adapter = &self.adapter;
        let op = adapter.lifecycle.enter();
        let state = adapter.lifecycle.state();
        if !state.accepts_io() {
            return Err(AdapterError::ForcedClosed(state));
        }
        op.check()?;
        validate_buffer(buf.len(), EXCH_MIN_BUFFER_SIZE_WRITE)?;

        Ok(decoder::decode(buf, adapter.stack.as_ref(), &adapter.stats))
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let adapter = &self.adapter;
        let cancelled = adapter.reads.cancel_owner(self.id);
        let (remaining, flushed) = {
            let guard = adapter.lifecycle.exclusive();
            let remaining = adapter.lifecycle.close_handle(&guard);
            let flushed = if remaining == 0 {
                adapter.queue.take_all(BatchStatus::Aborted)
            } else {
                Vec::new()
            };
            (remaining, flushed)
        };
        info!(
            adapter = %adapter.id,
            handle = %self.id,
            cancelled,
            remaining,
            "Consumer detached"
        );
        if remaining == 0 {
            adapter.stack.link_state(MediaConnectState::Disconnected);
        }
        // Released only now, outside the transition lock.
        drop(flushed);
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("adapter", &self.adapter.id)
            .field("id", &self.id)
            .finish()
    }
}
