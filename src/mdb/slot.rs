//! Single-capacity rendezvous between the authorization coordinator and the
//! bus state machine.
//!
//! The coordinator arms the slot for exactly one vend and blocks; the state
//! machine observes the armed slot, takes exclusive hold of it when the
//! machine requests a vend, and settles it with the outcome. The hold spans
//! multiple inbound frames (the whole `vend` state), and while the slot is
//! held the coordinator's wait does not time out: a vend is in flight and its
//! outcome must be observed so the dispense is reported exactly once.
//!
//! ```text
//! Coordinator                       Bus state machine
//!   arm_and_wait ──► Armed
//!                                     is_armed?   (POLL → begin session)
//!                                     try_hold    (VEND_REQUEST → Held)
//!   (wait, no timeout while Held)
//!                                     settle      (VEND_SUCCESS/FAILURE)
//!   ◄── Done(item?) ── consume, back to Idle
//! ```

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotState {
    Idle,
    Armed,
    Held,
    Done(Option<Vec<u8>>),
}

/// The rendezvous cell. Exactly one exists per system; both sides share it
/// through an `Arc`.
#[derive(Debug)]
pub struct DispenseSlot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl Default for DispenseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DispenseSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            settled: Condvar::new(),
        }
    }

    /// Coordinator side: arm the slot for one vend and block until the state
    /// machine settles it or `timeout` expires. Returns `(dispensed, item)`.
    ///
    /// The timeout applies only while the slot is merely armed. Once the
    /// state machine holds the slot the wait becomes unbounded; the hold is
    /// released on every path out of the vend state, so the wait ends when
    /// the machine reports the outcome.
    pub fn arm_and_wait(&self, timeout: Duration) -> (bool, Option<Vec<u8>>) {
        let mut state = self.state.lock().expect("dispense slot mutex poisoned");
        if *state != SlotState::Idle {
            // A previous cycle left the slot unsettled; reclaim it.
            log::error!("arming non-idle dispense slot ({state:?})");
        }
        *state = SlotState::Armed;
        let deadline = Instant::now() + timeout;

        loop {
            match &*state {
                SlotState::Done(_) => break,
                SlotState::Armed => {
                    let now = Instant::now();
                    if now >= deadline {
                        *state = SlotState::Idle;
                        return (false, None);
                    }
                    let (guard, _) = self
                        .settled
                        .wait_timeout(state, deadline - now)
                        .expect("dispense slot mutex poisoned");
                    state = guard;
                }
                SlotState::Held => {
                    state = self
                        .settled
                        .wait(state)
                        .expect("dispense slot mutex poisoned");
                }
                SlotState::Idle => return (false, None),
            }
        }

        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Done(item @ Some(_)) => (true, item),
            SlotState::Done(None) => (false, None),
            _ => unreachable!("loop exits only on Done"),
        }
    }

    /// True while the coordinator has an arm outstanding and the machine has
    /// not yet taken hold of it.
    pub fn is_armed(&self) -> bool {
        *self.state.lock().expect("dispense slot mutex poisoned") == SlotState::Armed
    }

    /// State-machine side: take exclusive hold of an armed slot. Returns
    /// false if the arm was withdrawn (coordinator timed out) or never made.
    pub fn try_hold(&self) -> bool {
        let mut state = self.state.lock().expect("dispense slot mutex poisoned");
        if *state == SlotState::Armed {
            *state = SlotState::Held;
            true
        } else {
            false
        }
    }

    /// State-machine side: settle a held slot with the vend outcome and wake
    /// the coordinator. `Some(item)` means dispensed.
    pub fn settle(&self, item: Option<Vec<u8>>) {
        let mut state = self.state.lock().expect("dispense slot mutex poisoned");
        if *state != SlotState::Held {
            log::error!("settling dispense slot that is not held ({state:?})");
            return;
        }
        *state = SlotState::Done(item);
        self.settled.notify_one();
    }

    /// Settle as not-dispensed if (and only if) the slot is currently held.
    /// Used on the resync paths that may fire in any state.
    pub fn release_if_held(&self) {
        let mut state = self.state.lock().expect("dispense slot mutex poisoned");
        if *state == SlotState::Held {
            *state = SlotState::Done(None);
            self.settled.notify_one();
        }
    }
}
