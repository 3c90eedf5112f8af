//! Pending consumer reads
//!
//! A consumer read is queued as a [`ReadRequest`] until the drain loop has
//! packets for it. The consumer holds the matching [`PendingRead`] future,
//! which resolves with the filled exchange buffer. Dropping the future
//! cancels the request.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{AdapterError, FrameError, Result};
use crate::exchange::{EXCH_MAX_PACKETS, record_size, write_record};

/// Identifies the consumer connection that issued a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

type Completion = oneshot::Sender<Result<Vec<u8>>>;

/// A consumer read waiting for packets.
pub struct ReadRequest {
    id: RequestId,
    owner: HandleId,
    capacity: usize,
    buf: Vec<u8>,
    records: usize,
    completion: Completion,
    /// Copies left to fail before copying works again
    #[cfg(test)]
    fail_copies: usize,
}

impl ReadRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn owner(&self) -> HandleId {
        self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far
    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// Records written so far
    pub fn records(&self) -> usize {
        self.records
    }

    /// Whether a packet of `len` bytes still fits.
    pub fn fits(&self, len: usize) -> bool {
        self.records < EXCH_MAX_PACKETS && self.written() + record_size(len) <= self.capacity
    }

    /// Append one record. The buffer grows on demand; allocation failure is
    /// reported instead of aborting.
    pub fn copy_packet(&mut self, data: &[u8]) -> std::result::Result<(), FrameError> {
        let size = record_size(data.len());
        let start = self.buf.len();
        if let Some(err) = self.injected_failure(size) {
            return Err(err);
        }
        if start + size > self.capacity {
            return Err(FrameError::WontFit {
                needed: size,
                available: self.capacity - start,
            });
        }
        self.buf.try_reserve(size)?;
        self.buf.resize(start + size, 0);
        if let Err(e) = write_record(&mut self.buf[start..], data) {
            self.buf.truncate(start);
            return Err(e);
        }
        self.records += 1;
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&mut self, size: usize) -> Option<FrameError> {
        if self.fail_copies == 0 {
            return None;
        }
        self.fail_copies -= 1;
        Some(FrameError::WontFit {
            needed: size,
            available: 0,
        })
    }

    #[cfg(not(test))]
    #[inline]
    fn injected_failure(&mut self, _size: usize) -> Option<FrameError> {
        None
    }

    /// The consumer has gone away
    fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    /// Complete with the records written so far.
    pub fn complete(self) {
        trace!(
            request = self.id.0,
            records = self.records,
            bytes = self.buf.len(),
            "Read completed"
        );
        let _ = self.completion.send(Ok(self.buf));
    }

    /// Complete with an error; buffered records are dropped.
    pub fn fail(self, err: AdapterError) {
        trace!(request = self.id.0, error = %err, "Read failed");
        let _ = self.completion.send(Err(err));
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("capacity", &self.capacity)
            .field("written", &self.written())
            .field("records", &self.records)
            .finish()
    }
}

/// FIFO of pending reads with its own lock.
#[derive(Debug, Default)]
pub struct ReadQueue {
    requests: Mutex<VecDeque<ReadRequest>>,
    next_id: AtomicU64,
}

impl ReadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a read of up to `capacity` bytes at the tail.
    pub fn submit(self: &Arc<Self>, owner: HandleId, capacity: usize) -> PendingRead {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.insert_tail(ReadRequest {
            id,
            owner,
            capacity,
            buf: Vec::new(),
            records: 0,
            completion: tx,
            #[cfg(test)]
            fail_copies: 0,
        });
        PendingRead {
            id,
            rx,
            queue: Arc::clone(self),
            done: false,
        }
    }

    pub fn insert_tail(&self, request: ReadRequest) {
        self.requests.lock().push_back(request);
    }

    /// Put a partially served request back in front.
    pub fn insert_head(&self, request: ReadRequest) {
        self.requests.lock().push_front(request);
    }

    /// Take the oldest request, optionally only one issued by `owner`.
    ///
    /// Requests whose consumer has dropped the future are completed as
    /// cancelled on the way.
    pub fn remove_next(&self, owner: Option<HandleId>) -> Option<ReadRequest> {
        let mut abandoned = Vec::new();
        let next = {
            let mut requests = self.requests.lock();
            loop {
                let position = match owner {
                    Some(owner) => requests.iter().position(|r| r.owner == owner)?,
                    None => 0,
                };
                let request = requests.remove(position)?;
                if request.is_abandoned() {
                    abandoned.push(request);
                    continue;
                }
                break Some(request);
            }
        };
        for request in abandoned {
            request.fail(AdapterError::Cancelled);
        }
        next
    }

    /// Cancel one request. Returns false if it was already taken.
    pub fn cancel(&self, id: RequestId) -> bool {
        let request = {
            let mut requests = self.requests.lock();
            requests
                .iter()
                .position(|r| r.id == id)
                .and_then(|position| requests.remove(position))
        };
        match request {
            Some(request) => {
                request.fail(AdapterError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancel every request issued by `owner`.
    pub fn cancel_owner(&self, owner: HandleId) -> usize {
        let mut count = 0;
        while let Some(request) = self.remove_next(Some(owner)) {
            request.fail(AdapterError::Cancelled);
            count += 1;
        }
        count
    }

    /// Fail every pending request with `err`.
    pub fn complete_all(&self, err: AdapterError) -> usize {
        let drained: Vec<_> = self.requests.lock().drain(..).collect();
        let count = drained.len();
        for request in drained {
            request.fail(err.clone());
        }
        count
    }

    /// Make the next `count` copies into request `id` fail.
    #[cfg(test)]
    pub(crate) fn fail_copies(&self, id: RequestId, count: usize) {
        if let Some(request) = self.requests.lock().iter_mut().find(|r| r.id == id) {
            request.fail_copies = count;
        }
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

/// Future resolving to a filled exchange buffer.
///
/// Dropping it before completion cancels the read.
#[must_use = "dropping a PendingRead cancels the read"]
pub struct PendingRead {
    id: RequestId,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    queue: Arc<ReadQueue>,
    done: bool,
}

impl PendingRead {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Cancel the read; the future resolves to [`AdapterError::Cancelled`]
    /// unless it already completed.
    pub fn cancel(&self) -> bool {
        self.queue.cancel(self.id)
    }
}

impl Future for PendingRead {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or(Err(AdapterError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        if !self.done {
            self.queue.cancel(self.id);
        }
    }
}

impl fmt::Debug for PendingRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}
