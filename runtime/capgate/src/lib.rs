//! capgate - Capability-based object/protocol IPC core
//!
//! # Purpose
//! Processes never address each other directly. A process holds small
//! integer handles naming kernel-owned objects; each object belongs to a
//! server process and answers to a fixed set of protocols. Invoking a
//! protocol method on a handle routes the call to the owning server and
//! suspends the caller until the server replies.
//!
//! # Integration Points
//! - Depends on: nothing outside this crate at runtime
//! - Provides to: process managers, servers, memory-mapping and other
//!   subsystems that need a capability check ([`Kernel::authorize`])
//! - IPC model: synchronous call/reply, FIFO per server
//! - Capabilities required: a handle with `INVOKE` to call, `TRANSFER` to
//!   pass it along, `DUPLICATE` to alias it
//!
//! # Architecture
//! - [`protocol`] / [`registry`]: statically declared protocols and the
//!   read-only catalogue of method signatures
//! - [`object`]: refcounted kernel handle objects in an arena
//! - [`table`]: per-process handle tables
//! - [`endpoint`]: per-server FIFO queue and call-token correlation
//! - [`pending`]: the pending-call state machine
//! - [`dispatch`]: the [`Kernel`] tying them together, and [`Server`]
//!
//! ```text
//! caller ── call(h, m, args) ──► Kernel ── queue ──► ServerEndpoint ── next() ──► server
//!   ▲                              │                                               │
//!   └──────── values, new handles ─┴──────────── reply(token, values) ◄────────────┘
//! ```
//!
//! # Testing Strategy
//! - Unit tests: each module, in place
//! - Integration tests: multi-threaded callers and servers in `tests/`
//! - Benchmarks: `benches/dispatch.rs` (criterion)
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use capgate::{define_protocol, Kernel, LocalId, ProtocolRegistry, Value};
//!
//! define_protocol! {
//!     pub protocol COUNTER("demo.counter", 0xC0_0111, mod counter) {
//!         0 => get() -> (U64);
//!     }
//! }
//!
//! let kernel = Kernel::new(ProtocolRegistry::with_protocols(&[&COUNTER]).unwrap());
//! let server_pid = kernel.spawn();
//! let server = kernel.register_server(server_pid).unwrap();
//!
//! let client = kernel.spawn();
//! let object = server.forge(LocalId(0), [COUNTER.uid]).unwrap();
//! let handle = kernel.install(client, object).unwrap();
//!
//! let worker = thread::spawn(move || {
//!     let incoming = server.next().unwrap();
//!     server.reply(incoming.token, vec![Value::Unsigned(7)]).unwrap();
//! });
//!
//! let reply = kernel.call(client, handle, counter::get, vec![]).unwrap();
//! assert_eq!(reply, vec![Value::Unsigned(7)]);
//! worker.join().unwrap();
//! ```

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod object;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod table;
pub mod value;

pub use config::{KernelConfig, DEFAULT_MAX_HANDLES, DEFAULT_QUEUE_DEPTH};
pub use dispatch::{Incoming, Kernel, KernelStats, Server};
pub use endpoint::CallToken;
pub use error::{invariant_violation, IpcError, Result};
pub use object::{LocalId, ObjectInfo, ObjectRef, ProtocolSet, ServerId};
pub use pending::{CallId, CallState};
pub use process::{Pid, ProcessBuilder};
pub use protocol::{MethodDef, MethodId, MethodUid, Param, ProtocolDef, ProtocolUid, Ty};
pub use registry::{ProtocolRegistry, RegistryBuilder};
pub use table::{names, Handle, HandleRights, MAX_HANDLES};
pub use value::Value;
