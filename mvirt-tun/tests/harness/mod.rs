//! Test harness for adapter integration tests
//!
//! Provides a recording network stack, IP packet builders and helpers for
//! bringing an adapter up with one consumer attached.

#![allow(dead_code)]

pub mod packets;
pub mod stack;

use std::sync::Arc;

use mvirt_tun::{Adapter, Consumer};

pub use stack::RecordingStack;

/// Create an initialized, running adapter with one consumer attached.
pub fn running_adapter(max_queued_batches: usize) -> (Arc<Adapter>, Arc<RecordingStack>, Consumer) {
    let stack = Arc::new(RecordingStack::default());
    let adapter = Adapter::new("tun-test", max_queued_batches, stack.clone());
    adapter.initialize().expect("initialize");
    let consumer = adapter.open().expect("open consumer");
    adapter.restart().expect("restart");
    (adapter, stack, consumer)
}
