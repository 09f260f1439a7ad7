//! The single wait primitive idle workers block on.
//!
//! Two independent sources can end a wait: the poll timer (the timeout passed
//! to [`Doorbell::wait`]) and a ring from the notification listener. Polling
//! guarantees progress; ringing only makes it faster. Closing the doorbell is
//! the shutdown signal and wins over both.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Why a [`Doorbell::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Someone rang since the ticket was taken: re-poll immediately.
    Rung,
    /// The poll interval elapsed without a ring.
    Elapsed,
    /// The doorbell was closed: stop.
    Closed,
}

/// Position in the ring sequence, taken before a claim attempt so a ring that
/// lands between "nothing to claim" and "start waiting" is not lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct State {
    rings: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Doorbell {
    state: Mutex<State>,
    cvar: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Ticket {
        Ticket(self.lock().rings)
    }

    /// Wake every waiter.
    pub fn ring(&self) {
        let mut state = self.lock();
        state.rings = state.rings.wrapping_add(1);
        self.cvar.notify_all();
    }

    /// Wake every waiter for good. Subsequent waits return immediately.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cvar.notify_all();
    }

    /// Reopen after a close, for restart.
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Block until a ring newer than `ticket`, a close, or `timeout`.
    pub fn wait(&self, ticket: Ticket, timeout: Duration) -> Wake {
        let state = self.lock();
        let (state, _) = self
            .cvar
            .wait_timeout_while(state, timeout, |s| !s.closed && s.rings == ticket.0)
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            Wake::Closed
        } else if state.rings != ticket.0 {
            Wake::Rung
        } else {
            Wake::Elapsed
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
