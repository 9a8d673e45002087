//! Dispatch Engine
//!
//! Routes a method invocation on a handle to the server that owns the
//! object behind it, suspends the caller, and resumes it with the server's
//! reply.
//!
//! ## Call/Reply Model
//!
//! ```text
//! Caller                    Kernel                         Server
//!   |                          |                              |
//!   | call(h, method, args)    |                              |
//!   |------------------------->| resolve h, check protocol,   |
//!   |                          | validate args, enqueue       |
//!   |  (blocks on reply)       |----------------------------->| next() -> token
//!   |                          |                              |
//!   |                          |<-----------------------------| reply(token, values)
//!   |<-------------------------| install returned handles     |
//!   v                          |                              v
//! ```
//!
//! ## Key Features
//!
//! - **Capability checked before forwarding**: a method whose protocol the
//!   object does not answer to never reaches the server
//! - **Per-server FIFO**: arrival order at the endpoint queue is the
//!   delivery order
//! - **Single-use tokens**: a token completes exactly one caller; replies to
//!   cancelled or finished calls fail `UnknownToken`
//! - **Explicit call state**: every pending call moves through
//!   [`CallState`] under the engine's control only
//!
//! ## Lock Order
//!
//! `process table → arena` and `endpoint → pending calls → process life`.
//! No lock is held while an [`ObjectRef`] is dropped or while a thread
//! blocks on a reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};

use crate::config::KernelConfig;
use crate::endpoint::{CallToken, ServerDirectory, ServerEndpoint};
use crate::error::{invariant_violation, IpcError, Result};
use crate::object::{LocalId, ObjectArena, ObjectInfo, ObjectRef, ProtocolSet, ServerId};
use crate::pending::{CallId, CallOutcome, CallState, CallTable, PendingCall};
use crate::process::{Pid, Process, ProcessBuilder};
use crate::protocol::{MethodUid, ProtocolUid};
use crate::registry::ProtocolRegistry;
use crate::table::{Handle, HandleRights};
use crate::value::Value;

/// Per-call tracing; promoted to `debug` by the `debug-dispatch` feature
macro_rules! dispatch_log {
    ($($arg:tt)+) => {
        if cfg!(feature = "debug-dispatch") {
            log::debug!($($arg)+)
        } else {
            log::trace!($($arg)+)
        }
    };
}

struct Shared {
    config: KernelConfig,
    registry: Arc<ProtocolRegistry>,
    servers: Arc<ServerDirectory>,
    arena: Arc<ObjectArena>,
    processes: RwLock<HashMap<Pid, Arc<Process>>>,
    calls: Mutex<CallTable>,
    next_pid: AtomicU32,
    next_call: AtomicU64,
}

/// Snapshot of kernel-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub processes: usize,
    pub servers: usize,
    pub objects: usize,
    pub pending_calls: usize,
}

/// The capability IPC kernel
///
/// Cheap to clone; every clone drives the same kernel state.
#[derive(Clone)]
pub struct Kernel {
    shared: Arc<Shared>,
}

impl Kernel {
    pub fn new(registry: ProtocolRegistry) -> Self {
        Self::with_config(registry, KernelConfig::default())
    }

    pub fn with_config(registry: ProtocolRegistry, config: KernelConfig) -> Self {
        let servers = Arc::new(ServerDirectory::new());
        let arena = ObjectArena::new(Arc::clone(&servers));
        log::debug!(
            "kernel up: {} protocols, {} methods, {:?}",
            registry.protocol_count(),
            registry.method_count(),
            config
        );
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(registry),
                servers,
                arena,
                processes: RwLock::new(HashMap::new()),
                calls: Mutex::new(CallTable::new()),
                next_pid: AtomicU32::new(1),
                next_call: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.shared.registry
    }

    // ---------------------------------------------------------------------
    // Processes
    // ---------------------------------------------------------------------

    /// Start a process with an empty handle table
    pub fn spawn(&self) -> Pid {
        self.process_builder().start()
    }

    /// Begin assembling a process's startup capabilities
    pub fn process_builder(&self) -> ProcessBuilder {
        let pid = Pid(self.shared.next_pid.fetch_add(1, Ordering::Relaxed));
        ProcessBuilder::new(self.clone(), pid, self.shared.config.max_handles_per_process)
    }

    pub(crate) fn publish(&self, process: Arc<Process>) -> Pid {
        let pid = process.pid();
        let handles = process.handle_count();
        self.shared.processes.write().insert(pid, process);
        log::debug!("started {} with {} handles", pid, handles);
        pid
    }

    pub(crate) fn resolve_for_transfer(
        &self,
        parent: Pid,
        handle: Handle,
        rights: HandleRights,
    ) -> Result<ObjectRef> {
        self.process(parent)?
            .resolve(handle, rights | HandleRights::TRANSFER)
    }

    fn process(&self, pid: Pid) -> Result<Arc<Process>> {
        self.shared
            .processes
            .read()
            .get(&pid)
            .cloned()
            .ok_or(IpcError::NoSuchProcess { pid: pid.0 })
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.shared.processes.read().contains_key(&pid)
    }

    /// Tear a process down
    ///
    /// Its outstanding calls are retracted (callers see `Cancelled`), the
    /// servers it owns shut down, and every entry of its handle table is
    /// released.
    pub fn destroy_process(&self, pid: Pid) -> Result<()> {
        let process = self
            .shared
            .processes
            .write()
            .remove(&pid)
            .ok_or(IpcError::NoSuchProcess { pid: pid.0 })?;

        let outstanding = process.mark_dead();
        if !outstanding.is_empty() {
            log::warn!("destroying {} with {} outstanding calls", pid, outstanding.len());
        }
        for (id, server) in outstanding {
            self.cancel_call(id, server, IpcError::Cancelled);
        }

        for endpoint in self.shared.servers.owned_by(pid) {
            self.shutdown_endpoint(&endpoint);
        }

        let released = process.drain_table();
        log::debug!("destroyed {} ({} handles released)", pid, released.len());
        drop(released);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Handle tables
    // ---------------------------------------------------------------------

    /// Install `object` with the rights it carries
    pub fn install(&self, pid: Pid, object: ObjectRef) -> Result<Handle> {
        let handle = self.process(pid)?.install(object)?;
        log::debug!("{} installed handle {}", pid, handle);
        Ok(handle)
    }

    /// Resolve a handle number; `None` for anything not installed
    ///
    /// The reference is capped at the entry's rights.
    pub fn lookup(&self, pid: Pid, handle: Handle) -> Result<Option<ObjectRef>> {
        Ok(self.process(pid)?.lookup(handle))
    }

    pub fn duplicate(&self, pid: Pid, handle: Handle) -> Result<Handle> {
        self.process(pid)?.duplicate(handle)
    }

    pub fn duplicate_restricted(&self, pid: Pid, handle: Handle, rights: HandleRights) -> Result<Handle> {
        self.process(pid)?.duplicate_restricted(handle, rights)
    }

    pub fn close(&self, pid: Pid, handle: Handle) -> Result<()> {
        let object = self.process(pid)?.close(handle)?;
        log::debug!("{} closed handle {}", pid, handle);
        drop(object);
        Ok(())
    }

    /// Name a handle in a running process's startup table
    ///
    /// Running processes are sealed, so this only ever reports why it
    /// cannot; use [`ProcessBuilder::install_named`] before `start`.
    pub fn install_named(&self, pid: Pid, name: &str, handle: Handle) -> Result<()> {
        self.process(pid)?.install_named(name, handle)
    }

    pub fn resolve_named(&self, pid: Pid, name: &str) -> Result<Option<Handle>> {
        Ok(self.process(pid)?.resolve_named(name))
    }

    /// Number of entries in `pid`'s table that reference `object`
    pub fn count_references(&self, pid: Pid, object: &ObjectRef) -> Result<usize> {
        Ok(self.process(pid)?.count_referencing(object.key()))
    }

    pub fn ref_count(&self, object: &ObjectRef) -> usize {
        object.ref_count()
    }

    pub fn describe(&self, object: &ObjectRef) -> Result<ObjectInfo> {
        object.info()
    }

    // ---------------------------------------------------------------------
    // Servers
    // ---------------------------------------------------------------------

    /// Create a server endpoint owned by `owner`
    pub fn register_server(&self, owner: Pid) -> Result<Server> {
        let process = self.process(owner)?;
        let endpoint = self.shared.servers.create(owner);
        if !process.is_alive() {
            // Lost a race with destroy_process
            self.shutdown_endpoint(&endpoint);
            return Err(IpcError::NoSuchProcess { pid: owner.0 });
        }
        log::debug!("{} registered {}", owner, endpoint.id());
        Ok(Server {
            kernel: self.clone(),
            endpoint,
        })
    }

    fn shutdown_endpoint(&self, endpoint: &ServerEndpoint) {
        let server = endpoint.id();
        let failed: Vec<PendingCall> = {
            let mut state = endpoint.lock();
            if state.is_closed() {
                return;
            }
            let ids = state.close();
            let mut calls = self.shared.calls.lock();
            ids.into_iter().filter_map(|id| calls.remove(id)).collect()
        };
        endpoint.wake_all();
        self.shared.servers.remove(server);
        let invalidated = self.shared.arena.invalidate_server(server);

        if !failed.is_empty() {
            log::warn!("{} shut down with {} pending calls", server, failed.len());
        }
        log::debug!("{} shut down, {} objects invalidated", server, invalidated);

        for mut call in failed {
            call.transition(CallState::ServerGone);
            call.complete(Err(IpcError::ServerGone { server }));
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Invoke `method` on the object behind `handle`
    ///
    /// Blocks until the server replies, the server dies, or the configured
    /// call timeout expires. Returned object references arrive as fresh
    /// handles in `pid`'s table.
    pub fn call(&self, pid: Pid, handle: Handle, method: MethodUid, args: Vec<Value>) -> Result<Vec<Value>> {
        self.dispatch(pid, handle, method, args, self.shared.config.call_timeout)
    }

    /// [`call`](Self::call) with an explicit timeout
    pub fn call_timeout(
        &self,
        pid: Pid,
        handle: Handle,
        method: MethodUid,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        self.dispatch(pid, handle, method, args, Some(timeout))
    }

    /// Check that `pid` holds, through `handle`, an object answering to
    /// `protocol`, without dispatching anything
    pub fn authorize(&self, pid: Pid, handle: Handle, protocol: ProtocolUid) -> Result<ObjectInfo> {
        let target = self.process(pid)?.resolve(handle, HandleRights::INVOKE)?;
        let info = target.info()?;
        if !info.supports(protocol) {
            return Err(IpcError::UnsupportedProtocol { protocol });
        }
        Ok(info)
    }

    fn dispatch(
        &self,
        pid: Pid,
        handle: Handle,
        method: MethodUid,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let process = self.process(pid)?;
        let target = process.resolve(handle, HandleRights::INVOKE)?;
        let info = target.info()?;

        let protocol = method.protocol();
        if !info.supports(protocol) {
            dispatch_log!("{} handle {}: protocol {} not granted", pid, handle, protocol);
            return Err(IpcError::UnsupportedProtocol { protocol });
        }
        self.shared.registry.validate_args(method, &args)?;
        let args = process.export_values(args)?;

        let server = info.server;
        let endpoint = self
            .shared
            .servers
            .get(server)
            .ok_or(IpcError::ServerGone { server })?;

        let id = CallId(self.shared.next_call.fetch_add(1, Ordering::Relaxed));
        process.begin_call(id, server)?;
        let (call, reply_rx) = PendingCall::new(id, pid, method, target, server, info.local_id, args);

        let rejected = {
            let mut state = endpoint.lock();
            let depth = self.shared.config.max_queue_depth;
            let reason = if state.is_closed() {
                Some(IpcError::ServerGone { server })
            } else if !process.is_alive() {
                Some(IpcError::NoSuchProcess { pid: pid.0 })
            } else if state.queue_len() >= depth {
                Some(IpcError::QueueFull { server, depth })
            } else {
                None
            };
            match reason {
                Some(err) => Some((err, call)),
                None => {
                    self.shared.calls.lock().insert(call);
                    state.enqueue(id);
                    None
                }
            }
        };
        if let Some((err, call)) = rejected {
            process.end_call(id);
            drop(call);
            dispatch_log!("{} call {:?} rejected: {}", pid, id, err);
            return Err(err);
        }
        endpoint.wake_one();
        dispatch_log!(
            "{} call {:?} {} -> {} local {}",
            pid,
            id,
            method,
            server,
            info.local_id
        );

        let outcome = self.await_reply(id, server, &reply_rx, timeout);
        process.end_call(id);
        let values = outcome?;
        process.import_values(values)
    }

    fn await_reply(
        &self,
        id: CallId,
        server: ServerId,
        reply_rx: &Receiver<CallOutcome>,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        let Some(timeout) = timeout else {
            return reply_rx.recv().unwrap_or(Err(IpcError::Cancelled));
        };
        match reply_rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                dispatch_log!("call {:?} timed out after {:?}", id, timeout);
                self.cancel_call(id, server, IpcError::TimedOut);
                // Either our cancellation or a reply that won the race
                reply_rx.recv().unwrap_or(Err(IpcError::TimedOut))
            }
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::Cancelled),
        }
    }

    /// Retract a pending call and fail it with `reason`
    ///
    /// Returns false if the call had already completed.
    fn cancel_call(&self, id: CallId, server: ServerId, reason: IpcError) -> bool {
        let Some(endpoint) = self.shared.servers.get(server) else {
            return false;
        };
        let call = {
            let mut state = endpoint.lock();
            let mut calls = self.shared.calls.lock();
            let Some(mut call) = calls.remove(id) else {
                return false;
            };
            let retracted = match call.state() {
                CallState::Queued => state.retract(id),
                CallState::Delivered { token } => state.redeem(token) == Some(id),
                _ => false,
            };
            if !retracted {
                invariant_violation(format_args!(
                    "pending call {:?} ({:?}) missing from {}",
                    id,
                    call.state(),
                    server
                ));
            }
            call.transition(CallState::Cancelled);
            call
        };
        dispatch_log!("call {:?} to {} cancelled: {}", id, server, reason);
        call.complete(Err(reason));
        true
    }

    /// Finish a delivered call with `outcome`
    fn complete_delivered(&self, endpoint: &ServerEndpoint, token: CallToken, outcome: CallOutcome) -> Result<()> {
        let call = {
            let mut state = endpoint.lock();
            let id = state
                .redeem(token)
                .ok_or(IpcError::UnknownToken { token: token.0 })?;
            let Some(mut call) = self.shared.calls.lock().remove(id) else {
                invariant_violation(format_args!("token {} maps to no pending call", token.0));
            };
            call.transition(CallState::Replied);
            call
        };
        call.complete(outcome);
        Ok(())
    }

    pub fn stats(&self) -> KernelStats {
        KernelStats {
            processes: self.shared.processes.read().len(),
            servers: self.shared.servers.len(),
            objects: self.shared.arena.len(),
            pending_calls: self.shared.calls.lock().len(),
        }
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A call delivered to a server
#[derive(Debug)]
pub struct Incoming {
    /// Redeem with [`Server::reply`] or [`Server::reply_error`]
    pub token: CallToken,
    pub method: MethodUid,
    /// Which of the server's objects the call targets
    pub local_id: LocalId,
    /// Handle arguments are already installed in the server's table
    pub args: Vec<Value>,
}

struct Delivery {
    id: CallId,
    token: CallToken,
    method: MethodUid,
    local_id: LocalId,
    args: Vec<Value>,
}

#[derive(Clone, Copy)]
enum Wait {
    Poll,
    Until(Instant),
    Forever,
}

/// A server process's capability to its endpoint
#[derive(Clone)]
pub struct Server {
    kernel: Kernel,
    endpoint: Arc<ServerEndpoint>,
}

impl Server {
    #[inline]
    pub fn id(&self) -> ServerId {
        self.endpoint.id()
    }

    #[inline]
    pub fn owner(&self) -> Pid {
        self.endpoint.owner()
    }

    /// Block until a call arrives and take the oldest one
    ///
    /// # Errors
    /// `ServerGone` once the endpoint is shut down.
    pub fn next(&self) -> Result<Incoming> {
        self.receive(Wait::Forever)?
            .ok_or(IpcError::ServerGone { server: self.id() })
    }

    /// Take the oldest call if one is queued
    pub fn try_next(&self) -> Result<Option<Incoming>> {
        self.receive(Wait::Poll)
    }

    /// Like [`next`](Self::next), giving up after `timeout`
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Incoming>> {
        self.receive(Wait::Until(Instant::now() + timeout))
    }

    fn receive(&self, wait: Wait) -> Result<Option<Incoming>> {
        loop {
            let Some(delivery) = self.take_next(wait)? else {
                return Ok(None);
            };
            let imported = self
                .kernel
                .process(self.owner())
                .and_then(|process| process.import_values(delivery.args));
            match imported {
                Ok(args) => {
                    dispatch_log!(
                        "{} took call {:?} as token {}",
                        self.id(),
                        delivery.id,
                        delivery.token.0
                    );
                    return Ok(Some(Incoming {
                        token: delivery.token,
                        method: delivery.method,
                        local_id: delivery.local_id,
                        args,
                    }));
                }
                Err(err) => {
                    log::warn!("{} could not accept call {:?}: {}", self.id(), delivery.id, err);
                    let err = match err {
                        IpcError::NoSuchProcess { .. } => IpcError::ServerGone { server: self.id() },
                        other => other,
                    };
                    // The caller may have been cancelled meanwhile
                    let _ = self.kernel.complete_delivered(&self.endpoint, delivery.token, Err(err));
                }
            }
        }
    }

    /// Dequeue under the endpoint lock and mark the call delivered
    fn take_next(&self, wait: Wait) -> Result<Option<Delivery>> {
        let mut state = self.endpoint.lock();
        let mut timed_out = false;
        let id = loop {
            if state.is_closed() {
                return Err(IpcError::ServerGone { server: self.id() });
            }
            if let Some(id) = state.dequeue() {
                break id;
            }
            if timed_out {
                return Ok(None);
            }
            match wait {
                Wait::Poll => return Ok(None),
                Wait::Forever => self.endpoint.wait(&mut state),
                Wait::Until(deadline) => timed_out = !self.endpoint.wait_until(&mut state, deadline),
            }
        };

        let token = state.issue_token(id);
        let mut calls = self.kernel.shared.calls.lock();
        let Some(call) = calls.get_mut(id) else {
            invariant_violation(format_args!("queued call {:?} has no pending entry", id));
        };
        call.transition(CallState::Delivered { token });
        Ok(Some(Delivery {
            id,
            token,
            method: call.method,
            local_id: call.local_id,
            args: core::mem::take(&mut call.args),
        }))
    }

    /// Complete a delivered call with return values
    ///
    /// `Value::Handle` entries name handles in the server's own table (they
    /// need `TRANSFER` and stay installed here); `Value::Object` references
    /// are moved to the caller.
    ///
    /// # Errors
    /// `MalformedReply` if the values do not match the method's return
    /// shape; the call stays outstanding. `UnknownToken` if the token is not
    /// outstanding.
    pub fn reply(&self, token: CallToken, values: Vec<Value>) -> Result<()> {
        let method = self.delivered_method(token)?;
        let values = self.kernel.process(self.owner())?.export_values(values)?;
        if let Err(err) = self.kernel.shared.registry.validate_returns(method, &values) {
            log::warn!("{} rejected reply: {}", self.id(), err);
            return Err(err);
        }
        self.kernel.complete_delivered(&self.endpoint, token, Ok(values))?;
        dispatch_log!("{} replied to token {}", self.id(), token.0);
        Ok(())
    }

    /// Complete a delivered call with an error for the caller
    pub fn reply_error(&self, token: CallToken, error: IpcError) -> Result<()> {
        dispatch_log!("{} failing token {}: {}", self.id(), token.0, error);
        self.kernel.complete_delivered(&self.endpoint, token, Err(error))
    }

    fn delivered_method(&self, token: CallToken) -> Result<MethodUid> {
        let state = self.endpoint.lock();
        let unknown = IpcError::UnknownToken { token: token.0 };
        let id = state.peek_token(token).ok_or(unknown.clone())?;
        let calls = self.kernel.shared.calls.lock();
        calls.get(id).map(|call| call.method).ok_or(unknown)
    }

    /// Mint a new object owned by this server
    ///
    /// Nobody can reach it until the reference is installed somewhere or
    /// returned in a reply.
    ///
    /// # Errors
    /// `DuplicateLocalId` while a live object already uses `local_id`,
    /// `ServerGone` after shutdown.
    pub fn forge(&self, local_id: LocalId, protocols: impl Into<ProtocolSet>) -> Result<ObjectRef> {
        let state = self.endpoint.lock();
        if state.is_closed() {
            return Err(IpcError::ServerGone { server: self.id() });
        }
        self.kernel
            .shared
            .arena
            .create(self.id(), local_id, protocols.into())
    }

    /// Local ids of forged objects whose last reference was released
    pub fn take_released(&self) -> Vec<LocalId> {
        self.endpoint.take_released()
    }

    pub fn queued(&self) -> usize {
        self.endpoint.queued()
    }

    /// Close the endpoint: every pending call fails `ServerGone` and every
    /// object this server forged is invalidated
    pub fn shutdown(&self) {
        self.kernel.shutdown_endpoint(&self.endpoint);
    }
}

impl core::fmt::Debug for Server {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server").field("endpoint", &self.endpoint).finish()
    }
}
