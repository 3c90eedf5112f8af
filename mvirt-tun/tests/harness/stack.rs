//! Network stack that records every callback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use mvirt_tun::{Batch, BatchStatus, InboundPacket, MediaConnectState, NetworkStack};
use parking_lot::Mutex;
use smoltcp::wire::IpVersion;

/// Holds the release of one batch until the test lets it proceed.
pub struct Gate {
    /// Signalled once the release callback has been entered
    pub entered: mpsc::Receiver<()>,
    /// Send to let the release callback return
    pub proceed: mpsc::Sender<()>,
}

struct GateInner {
    tag: u64,
    entered: mpsc::Sender<()>,
    proceed: mpsc::Receiver<()>,
}

#[derive(Default)]
pub struct RecordingStack {
    released: Mutex<Vec<(u64, BatchStatus, usize)>>,
    indicated: Mutex<Vec<(Vec<u8>, IpVersion)>>,
    links: Mutex<Vec<MediaConnectState>>,
    pause_completions: AtomicUsize,
    gate: Mutex<Option<GateInner>>,
}

impl RecordingStack {
    /// Block inside the release callback of the batch tagged `tag`.
    pub fn gate_release(&self, tag: u64) -> Gate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        *self.gate.lock() = Some(GateInner {
            tag,
            entered: entered_tx,
            proceed: proceed_rx,
        });
        Gate {
            entered: entered_rx,
            proceed: proceed_tx,
        }
    }

    /// Released batches as (tag, status)
    pub fn released(&self) -> Vec<(u64, BatchStatus)> {
        self.released
            .lock()
            .iter()
            .map(|&(tag, status, _)| (tag, status))
            .collect()
    }

    pub fn release_count(&self, tag: u64) -> usize {
        self.released
            .lock()
            .iter()
            .filter(|(t, _, _)| *t == tag)
            .count()
    }

    pub fn released_with(&self, status: BatchStatus) -> Vec<u64> {
        self.released
            .lock()
            .iter()
            .filter(|(_, s, _)| *s == status)
            .map(|(tag, _, _)| *tag)
            .collect()
    }

    pub fn indicated(&self) -> Vec<(Vec<u8>, IpVersion)> {
        self.indicated.lock().clone()
    }

    pub fn links(&self) -> Vec<MediaConnectState> {
        self.links.lock().clone()
    }

    pub fn pause_completions(&self) -> usize {
        self.pause_completions.load(Ordering::SeqCst)
    }
}

impl NetworkStack for RecordingStack {
    fn indicate(&self, packets: &mut [InboundPacket<'_>]) {
        let mut indicated = self.indicated.lock();
        for packet in packets.iter() {
            indicated.push((packet.data().to_vec(), packet.version()));
        }
    }

    fn release(&self, batch: Batch, status: BatchStatus) {
        let gate = {
            let mut gate = self.gate.lock();
            if gate.as_ref().is_some_and(|g| g.tag == batch.tag()) {
                gate.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.proceed.recv();
        }
        self.released
            .lock()
            .push((batch.tag(), status, batch.len()));
    }

    fn link_state(&self, state: MediaConnectState) {
        self.links.lock().push(state);
    }

    fn pause_complete(&self) {
        self.pause_completions.fetch_add(1, Ordering::SeqCst);
    }
}
