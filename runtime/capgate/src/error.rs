//! Error taxonomy for capability and dispatch operations
//!
//! Every variant is locally recoverable: it is reported synchronously to the
//! operation that caused it. The one fatal condition, an internal invariant
//! violation, does not appear here. It goes through [`invariant_violation`]
//! and halts the kernel.

use thiserror::Error;

use crate::object::{LocalId, ServerId};
use crate::protocol::{MethodUid, ProtocolUid};
use crate::table::Handle;

/// Error types for capability and IPC operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("Invalid handle {handle}")]
    InvalidHandle { handle: Handle },

    #[error("Handle does not grant protocol {protocol}")]
    UnsupportedProtocol { protocol: ProtocolUid },

    #[error("Unknown method {method}")]
    UnknownMethod { method: MethodUid },

    #[error("Malformed arguments for {method}: {reason}")]
    MalformedArguments { method: MethodUid, reason: String },

    #[error("Malformed reply for {method}: {reason}")]
    MalformedReply { method: MethodUid, reason: String },

    #[error("Object behind handle is gone")]
    HandleGone,

    #[error("Server {server} already forged local id {local_id}")]
    DuplicateLocalId { server: ServerId, local_id: LocalId },

    #[error("Unknown call token {token}")]
    UnknownToken { token: u64 },

    #[error("Handle {handle} already closed")]
    AlreadyClosed { handle: Handle },

    #[error("Server {server} is gone")]
    ServerGone { server: ServerId },

    #[error("Handle {handle} lacks the required rights")]
    InsufficientRights { handle: Handle },

    #[error("Object reference lacks the transfer right")]
    NotTransferable,

    #[error("Handle table full (capacity: {capacity})")]
    TableFull { capacity: usize },

    #[error("Named handle table is sealed")]
    TableSealed,

    #[error("Server {server} queue full (depth: {depth})")]
    QueueFull { server: ServerId, depth: usize },

    #[error("Call timed out")]
    TimedOut,

    #[error("Call cancelled")]
    Cancelled,

    #[error("No such process: {pid}")]
    NoSuchProcess { pid: u32 },

    #[error("Conflicting definition for {method}")]
    ConflictingDefinition { method: MethodUid },
}

pub type Result<T> = core::result::Result<T, IpcError>;

/// Halt on detection of kernel-core corruption.
///
/// A broken refcount or an illegal pending-call transition means the
/// capability bookkeeping can no longer be trusted, so execution stops here.
#[cold]
#[track_caller]
pub fn invariant_violation(what: core::fmt::Arguments<'_>) -> ! {
    log::error!("capgate invariant violated: {}", what);
    panic!("capgate invariant violated: {}", what);
}
