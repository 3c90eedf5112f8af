//! Adapter lifecycle state machine
//!
//! Every data-plane entry point runs under the shared side of the transition
//! lock and is counted in the in-flight counter. State transitions take the
//! exclusive side. Pausing is completed by whichever party drops the
//! in-flight counter to zero: either `finish_pause` itself, or the last
//! operation (or queued batch) to retire, which then runs the pause
//! completion callback.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{AdapterError, Result};

/// Adapter state.
///
/// The ordering is meaningful: states below `Paused` reject consumer I/O
/// with a forced-closed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AdapterState {
    /// Initial state; the adapter may be initialized
    Halted = 0,
    /// Terminal; set on system shutdown
    Shutdown,
    Initializing,
    Halting,
    /// No sends accepted, reads pend
    Paused,
    Restarting,
    /// Send and receive processing active
    Running,
    /// Waiting for in-flight operations to retire
    Pausing,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Halted => "halted",
            AdapterState::Shutdown => "shutdown",
            AdapterState::Initializing => "initializing",
            AdapterState::Halting => "halting",
            AdapterState::Paused => "paused",
            AdapterState::Restarting => "restarting",
            AdapterState::Running => "running",
            AdapterState::Pausing => "pausing",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => AdapterState::Halted,
            1 => AdapterState::Shutdown,
            2 => AdapterState::Initializing,
            3 => AdapterState::Halting,
            4 => AdapterState::Paused,
            5 => AdapterState::Restarting,
            6 => AdapterState::Running,
            _ => AdapterState::Pausing,
        }
    }

    /// Whether consumers may issue reads and writes
    pub fn accepts_io(&self) -> bool {
        *self >= AdapterState::Paused
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table.
pub fn attempt_transition(from: AdapterState, to: AdapterState) -> bool {
    use AdapterState::*;

    match (from, to) {
        // Shutdown is terminal
        (Shutdown, _) => false,
        (Halting, Halted) => true,
        (Halted, Halting) => false,
        (_, Halting) => true,
        (Halted, Initializing) => true,
        (Initializing, Paused) => true,
        // Failed initialization
        (Initializing, Halted) => true,
        (Paused, Restarting) => true,
        (Restarting, Running) => true,
        (Running, Pausing) => true,
        (Pausing, Paused) => true,
        (Halted | Paused, Shutdown) => true,
        _ => false,
    }
}

/// Device power state. Anything from `D1` down is a low-power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PowerState {
    Unspecified = 0,
    D0,
    D1,
    D2,
    D3,
}

impl PowerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PowerState::D0,
            2 => PowerState::D1,
            3 => PowerState::D2,
            4 => PowerState::D3,
            _ => PowerState::Unspecified,
        }
    }

    pub fn is_low_power(&self) -> bool {
        *self >= PowerState::D1
    }
}

type PauseCallback = Box<dyn Fn() + Send + Sync>;

/// Per-adapter lifecycle: state, transition lock, in-flight and handle counts.
pub struct Lifecycle {
    transition: RwLock<()>,
    state: AtomicU8,
    power: AtomicU8,
    in_flight: AtomicUsize,
    handles: AtomicUsize,
    on_pause_complete: PauseCallback,
}

impl Lifecycle {
    /// Create a lifecycle in the `Halted` state.
    ///
    /// `on_pause_complete` runs when a pending pause is completed by the
    /// last retiring operation.
    pub fn new(on_pause_complete: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            transition: RwLock::new(()),
            state: AtomicU8::new(AdapterState::Halted as u8),
            power: AtomicU8::new(PowerState::Unspecified as u8),
            in_flight: AtomicUsize::new(0),
            handles: AtomicUsize::new(0),
            on_pause_complete: Box::new(on_pause_complete),
        }
    }

    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn power(&self) -> PowerState {
        PowerState::from_u8(self.power.load(Ordering::Acquire))
    }

    /// Swap the power state, returning the previous one.
    pub fn set_power(&self, power: PowerState) -> PowerState {
        PowerState::from_u8(self.power.swap(power as u8, Ordering::AcqRel))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn handles(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Take the transition lock shared.
    ///
    /// Data-plane calls may nest (a release callback may submit again), so
    /// the shared side is taken recursively and never waits behind a queued
    /// writer while another shared guard is held on this thread.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.transition.read_recursive()
    }

    /// Take the transition lock exclusively.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.transition.write()
    }

    /// Move to `to` if the transition table allows it.
    ///
    /// Requires the exclusive transition lock; only the pause completion
    /// path changes state without it.
    pub fn transition(
        &self,
        _exclusive: &RwLockWriteGuard<'_, ()>,
        to: AdapterState,
    ) -> Result<AdapterState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = AdapterState::from_u8(current);
            if !attempt_transition(from, to) {
                return Err(AdapterError::InvalidTransition { from, to });
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(from = %from, to = %to, "Adapter state transition");
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Enter a data-plane operation.
    ///
    /// The operation is counted as in flight until the returned guard drops,
    /// whether or not its check passes.
    pub fn enter(&self) -> Operation<'_> {
        let shared = self.shared();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let check = self.check();
        Operation {
            lifecycle: self,
            check,
            _shared: shared,
        }
    }

    fn check(&self) -> Result<()> {
        if self.handles() == 0 {
            Err(AdapterError::NoConsumer)
        } else if self.state() != AdapterState::Running {
            Err(AdapterError::Paused)
        } else if self.power().is_low_power() {
            Err(AdapterError::LowPower)
        } else {
            Ok(())
        }
    }

    /// Count a queued batch as in flight until the token drops.
    pub fn in_flight_token(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            lifecycle: Arc::clone(self),
        }
    }

    /// Retire one in-flight unit.
    ///
    /// Returns true when this call observed zero and completed a pending
    /// pause. With `async_completion` the pause completion callback runs.
    fn retire(&self, async_completion: bool) -> bool {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "in-flight counter underflow");
        if previous == 1
            && self
                .state
                .compare_exchange(
                    AdapterState::Pausing as u8,
                    AdapterState::Paused as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            if async_completion {
                (self.on_pause_complete)();
            }
            return true;
        }
        false
    }

    /// Restart: `Paused -> Restarting -> Running`.
    ///
    /// While running, the counter carries one baseline unit that only
    /// `finish_pause` removes.
    pub fn restart(&self, exclusive: &RwLockWriteGuard<'_, ()>) -> Result<()> {
        self.transition(exclusive, AdapterState::Restarting)?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.transition(exclusive, AdapterState::Running)?;
        Ok(())
    }

    /// Drop the running baseline after entering `Pausing`.
    ///
    /// Returns true when the pause completed synchronously.
    pub fn finish_pause(&self) -> bool {
        self.retire(false)
    }

    /// Forget the running baseline once nothing can be in flight any more.
    pub fn reset_in_flight(&self, _exclusive: &RwLockWriteGuard<'_, ()>) {
        self.in_flight.store(0, Ordering::Release);
    }

    /// Register a consumer handle, returning the new count.
    pub fn open_handle(&self, _exclusive: &RwLockWriteGuard<'_, ()>) -> usize {
        self.handles.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister a consumer handle, returning the remaining count.
    pub fn close_handle(&self, _exclusive: &RwLockWriteGuard<'_, ()>) -> usize {
        let previous = self.handles.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "handle count underflow");
        previous.saturating_sub(1)
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("power", &self.power())
            .field("in_flight", &self.in_flight())
            .field("handles", &self.handles())
            .finish()
    }
}

/// A data-plane operation holding the shared transition lock.
pub struct Operation<'a> {
    lifecycle: &'a Lifecycle,
    check: Result<()>,
    _shared: RwLockReadGuard<'a, ()>,
}

impl Operation<'_> {
    /// Outcome of the entry check (consumer attached, running, powered).
    pub fn check(&self) -> Result<()> {
        self.check.clone()
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        // Retire before the shared lock is released.
        self.lifecycle.retire(true);
    }
}

/// In-flight unit owned by a queued batch.
pub struct InFlight {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.lifecycle.retire(true);
    }
}
