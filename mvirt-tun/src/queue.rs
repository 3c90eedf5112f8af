//! Outbound packet queue
//!
//! Batches from the network stack wait here until a consumer read collects
//! their packets. The queue keeps a cursor into the head batch so a batch can
//! be spread across several reads, and it is bounded: once more than
//! `max_batches` are queued the oldest ones are dropped.
//!
//! Batches leaving the queue are never released while the queue lock is
//! held. [`QueueGuard`] collects them and drops them after unlocking, so the
//! network stack's release callback may call back into the adapter.

use std::collections::VecDeque;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::batch::{BatchRef, BatchStatus, CancelId, PacketRef};
use crate::exchange::MAX_IP_PACKET_SIZE;
use crate::read_queue::{ReadQueue, ReadRequest};
use crate::stats::Statistics;

/// Default bound on queued batches
pub const DEFAULT_MAX_QUEUED_BATCHES: usize = 1000;

#[derive(Debug, Default)]
struct QueueState {
    batches: VecDeque<BatchRef>,
    /// Next packet of the head batch; `None` means the head is untouched.
    next: Option<usize>,
}

/// Bounded FIFO of outbound batches.
#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    max_batches: usize,
}

impl PacketQueue {
    pub fn new(max_batches: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_batches,
        }
    }

    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    /// Lock the queue.
    pub fn lock<'a>(&'a self, stats: &'a Statistics) -> QueueGuard<'a> {
        QueueGuard {
            state: self.state.lock(),
            stats,
            released: Vec::new(),
        }
    }

    /// Queue a batch at the tail, evicting the oldest batches beyond the
    /// bound with an aborted status. Empty batches are released right away.
    pub fn append(&self, batch: BatchRef, stats: &Statistics) {
        if batch.packet_count() == 0 {
            trace!("Releasing empty batch");
            return;
        }

        let mut guard = self.lock(stats);
        guard.state.batches.push_back(batch);
        while guard.state.batches.len() > self.max_batches {
            let Some(evicted) = guard.state.batches.pop_front() else {
                break;
            };
            evicted.set_status(BatchStatus::Aborted);
            guard.state.next = None;
            debug!(packets = evicted.packet_count(), "Queue full, evicting oldest batch");
            guard.released.push(evicted);
        }
    }

    /// Release every queued batch with `status`.
    pub fn clear(&self, status: BatchStatus, stats: &Statistics) -> usize {
        let mut guard = self.lock(stats);
        let count = guard.state.batches.len();
        for batch in guard.state.batches.drain(..) {
            batch.set_status(status);
            guard.released.push(batch);
        }
        guard.state.next = None;
        if count > 0 {
            debug!(batches = count, status = ?status, "Cleared packet queue");
        }
        count
    }

    /// Unlink every queued batch, marked with `status`, without releasing it.
    ///
    /// The batches are released when the caller drops them, which must happen
    /// outside any lock a release callback may need.
    pub fn take_all(&self, status: BatchStatus) -> Vec<BatchRef> {
        let mut state = self.state.lock();
        state.next = None;
        let taken: Vec<BatchRef> = state.batches.drain(..).collect();
        for batch in &taken {
            batch.set_status(status);
        }
        taken
    }

    /// Unlink every batch sent with `cancel_id` and release it as aborted.
    pub fn cancel(&self, cancel_id: CancelId, stats: &Statistics) -> usize {
        let mut guard = self.lock(stats);
        let QueueGuard {
            state, released, ..
        } = &mut guard;

        let head_before = state.batches.front().cloned();
        let mut removed = Vec::new();
        state.batches.retain(|batch| {
            if batch.cancel_id() == Some(cancel_id) {
                batch.set_status(BatchStatus::Aborted);
                removed.push(batch.clone());
                false
            } else {
                true
            }
        });

        let head_changed = match (&head_before, state.batches.front()) {
            (Some(before), Some(after)) => !before.ptr_eq(after),
            (Some(_), None) => true,
            _ => false,
        };
        if head_changed {
            state.next = None;
        }

        let count = removed.len();
        released.extend(head_before);
        released.extend(removed);
        if count > 0 {
            debug!(cancel_id = cancel_id.0, batches = count, "Cancelled queued sends");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().batches.is_empty()
    }

    /// Drain queued packets into pending reads.
    ///
    /// The queue lock is held for the whole drain, so concurrent drains
    /// cannot interleave packets across reads. A packet that does not fit the
    /// current read is put back and the read is completed. If a copy fails the
    /// packet is dropped, its batch is marked `Resources` and the read goes
    /// back to the head of the read queue. Draining only stops once the queue
    /// or the read queue is empty.
    pub fn process(&self, reads: &ReadQueue, stats: &Statistics) {
        let mut guard = self.lock(stats);
        let mut current: Option<ReadRequest> = None;

        while let Some(packet) = guard.remove() {
            let mut request = match current.take().or_else(|| reads.remove_next(None)) {
                Some(request) => request,
                None => {
                    guard.prepend(packet);
                    break;
                }
            };

            if !request.fits(packet.len()) {
                guard.prepend(packet);
                request.complete();
                continue;
            }

            match request.copy_packet(packet.data()) {
                Ok(()) => {
                    stats.packet_delivered(packet.len());
                    current = Some(request);
                }
                Err(e) => {
                    warn!(error = %e, len = packet.len(), "Failed to copy packet to read buffer");
                    packet.batch().set_status(BatchStatus::Resources);
                    stats.delivery_failed();
                    reads.insert_head(request);
                }
            }
        }

        if let Some(request) = current {
            request.complete();
        }
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED_BATCHES)
    }
}

/// Locked queue.
///
/// Batches unlinked while locked are released after the lock is dropped.
pub struct QueueGuard<'a> {
    // Field order matters: the lock is released before `released` drops.
    state: MutexGuard<'a, QueueState>,
    stats: &'a Statistics,
    released: Vec<BatchRef>,
}

impl QueueGuard<'_> {
    /// Take the next undelivered packet.
    ///
    /// Oversized packets fail their whole batch with an invalid-length
    /// status; the batch is dropped and removal moves on to the next one.
    pub fn remove(&mut self) -> Option<PacketRef> {
        loop {
            let head = self.state.batches.front()?.clone();
            let index = self.state.next.unwrap_or(0);

            let len = match head.packet(index) {
                Some(packet) => packet.len(),
                None => {
                    drop(head);
                    self.pop_head();
                    continue;
                }
            };

            if len > MAX_IP_PACKET_SIZE {
                warn!(len, "Dropping batch with oversized packet");
                head.set_status(BatchStatus::InvalidLength);
                self.stats.packet_discarded();
                drop(head);
                self.pop_head();
                continue;
            }

            if index + 1 < head.packet_count() {
                self.state.next = Some(index + 1);
            } else {
                self.pop_head();
            }
            return Some(PacketRef::new(head, index));
        }
    }

    /// Undo a [`remove`](Self::remove) whose packet could not be consumed.
    pub fn prepend(&mut self, packet: PacketRef) {
        let (batch, index) = packet.into_parts();
        let is_head = self
            .state
            .batches
            .front()
            .is_some_and(|head| head.ptr_eq(&batch));
        if !is_head {
            self.state.batches.push_front(batch);
        }
        self.state.next = Some(index);
    }

    pub fn len(&self) -> usize {
        self.state.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.batches.is_empty()
    }

    fn pop_head(&mut self) {
        if let Some(batch) = self.state.batches.pop_front() {
            self.released.push(batch);
        }
        self.state.next = None;
    }
}
