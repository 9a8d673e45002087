//! Pending calls
//!
//! Every call in flight is owned by the dispatch engine's [`CallTable`] from
//! the moment it is queued until it is replied, cancelled, or failed because
//! its server died. The caller blocks on the receiving half of a one-shot
//! channel; the engine completes the call by sending exactly one outcome.
//!
//! ```text
//!             next()                 reply()
//!   Queued ───────────► Delivered ───────────► Replied
//!     │                     │
//!     ├── caller gone ──────┴──► Cancelled
//!     └── server gone ──────┴──► ServerGone
//! ```

use std::collections::HashMap;

use crossbeam::channel::{self, Receiver, Sender};

use crate::endpoint::CallToken;
use crate::error::{invariant_violation, Result};
use crate::object::{LocalId, ObjectRef, ServerId};
use crate::process::Pid;
use crate::protocol::MethodUid;
use crate::value::Value;

/// Engine-wide identifier of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u64);

/// Outcome delivered to a suspended caller
pub type CallOutcome = Result<Vec<Value>>;

/// Lifecycle of a pending call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// In the server's queue
    Queued,
    /// Handed to the server under `token`
    Delivered { token: CallToken },
    /// Completed by the server
    Replied,
    /// Abandoned by the caller (teardown or timeout)
    Cancelled,
    /// Failed because the server died
    ServerGone,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Replied | CallState::Cancelled | CallState::ServerGone)
    }

    fn can_move_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Queued, Delivered { .. })
                | (Delivered { .. }, Replied)
                | (Queued | Delivered { .. }, Cancelled)
                | (Queued | Delivered { .. }, ServerGone)
        )
    }
}

/// One call in flight
pub struct PendingCall {
    pub id: CallId,
    pub caller: Pid,
    pub server: ServerId,
    pub method: MethodUid,
    pub local_id: LocalId,
    /// Keeps the target alive for the life of the call
    pub target: ObjectRef,
    /// Taken by `next` when the call is delivered
    pub args: Vec<Value>,
    state: CallState,
    reply_tx: Sender<CallOutcome>,
}

impl PendingCall {
    /// Build a queued call and the receiver its caller will block on
    pub fn new(
        id: CallId,
        caller: Pid,
        method: MethodUid,
        target: ObjectRef,
        server: ServerId,
        local_id: LocalId,
        args: Vec<Value>,
    ) -> (Self, Receiver<CallOutcome>) {
        let (reply_tx, reply_rx) = channel::bounded(1);
        let call = Self {
            id,
            caller,
            server,
            method,
            local_id,
            target,
            args,
            state: CallState::Queued,
            reply_tx,
        };
        (call, reply_rx)
    }

    #[inline]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Move to `next`; any move the lifecycle does not allow halts the kernel
    pub fn transition(&mut self, next: CallState) {
        if !self.state.can_move_to(next) {
            invariant_violation(format_args!(
                "call {:?} cannot move from {:?} to {:?}",
                self.id, self.state, next
            ));
        }
        self.state = next;
    }

    /// Deliver the outcome to the caller and consume the call
    ///
    /// Must already be in a terminal state. A caller that has stopped
    /// listening simply never sees the outcome; any references carried in
    /// it are released here.
    pub fn complete(self, outcome: CallOutcome) {
        if !self.state.is_terminal() {
            invariant_violation(format_args!(
                "call {:?} completed while {:?}",
                self.id, self.state
            ));
        }
        let _ = self.reply_tx.send(outcome);
    }
}

impl core::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("caller", &self.caller)
            .field("server", &self.server)
            .field("method", &self.method)
            .field("state", &self.state)
            .finish()
    }
}

/// Every call in flight, by id
#[derive(Debug, Default)]
pub struct CallTable {
    calls: HashMap<CallId, PendingCall>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: PendingCall) {
        if self.calls.insert(call.id, call).is_some() {
            invariant_violation(format_args!("call id reused"));
        }
    }

    pub fn get(&self, id: CallId) -> Option<&PendingCall> {
        self.calls.get(&id)
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut PendingCall> {
        self.calls.get_mut(&id)
    }

    pub fn remove(&mut self, id: CallId) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
