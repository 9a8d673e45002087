//! Server Endpoint Implementation
//!
//! The object-side half of every connection. Each server owns one endpoint:
//! an inbound FIFO of pending calls plus the table correlating the call
//! tokens it hands out back to those calls.
//!
//! ## Design
//!
//! - The queue holds pending-call ids only; the calls themselves belong to
//!   the dispatch engine
//! - Arrival order at the queue is the serialization point: `dequeue` always
//!   returns the oldest call
//! - Tokens are issued from a per-endpoint counter and are never reused, so a
//!   stale or forged token can only miss
//! - A blocked server waits on a condition variable; closing the endpoint
//!   wakes every waiter
//!
//! ## Queue Structure
//!
//! ```text
//! ServerEndpoint
//!   ├─ Queue:     [call 7] → [call 9] → [call 12]
//!   ├─ Delivered: token 3 → call 4, token 5 → call 6
//!   └─ Released:  [local 0x10]
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::object::{LocalId, ServerId};
use crate::pending::CallId;
use crate::process::Pid;

/// Opaque token naming one delivered call, scoped to its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallToken(pub u64);

/// Queue and correlation state of one endpoint
pub(crate) struct EndpointState {
    queue: VecDeque<CallId>,
    delivered: HashMap<CallToken, CallId>,
    released: Vec<LocalId>,
    next_token: u64,
    closed: bool,
}

impl EndpointState {
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub(crate) fn delivered_len(&self) -> usize {
        self.delivered.len()
    }

    /// Append a call at the back of the queue
    pub(crate) fn enqueue(&mut self, call: CallId) {
        debug_assert!(!self.closed, "enqueue on closed endpoint");
        self.queue.push_back(call);
    }

    /// Take the oldest queued call
    pub(crate) fn dequeue(&mut self) -> Option<CallId> {
        self.queue.pop_front()
    }

    /// Issue a fresh token for a call being delivered
    pub(crate) fn issue_token(&mut self, call: CallId) -> CallToken {
        let token = CallToken(self.next_token);
        self.next_token += 1;
        self.delivered.insert(token, call);
        token
    }

    /// Call behind a token, without consuming it
    pub(crate) fn peek_token(&self, token: CallToken) -> Option<CallId> {
        self.delivered.get(&token).copied()
    }

    /// Consume a token
    pub(crate) fn redeem(&mut self, token: CallToken) -> Option<CallId> {
        self.delivered.remove(&token)
    }

    /// Remove a specific queued call
    ///
    /// Used for cancellation and timeout. Returns true if the call was
    /// found.
    pub(crate) fn retract(&mut self, call: CallId) -> bool {
        match self.queue.iter().position(|&c| c == call) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Close the endpoint, returning every queued and delivered call
    pub(crate) fn close(&mut self) -> Vec<CallId> {
        self.closed = true;
        let mut calls: Vec<CallId> = self.queue.drain(..).collect();
        calls.extend(self.delivered.drain().map(|(_, call)| call));
        calls
    }
}

/// Server endpoint: queue, correlation table and wakeup
pub struct ServerEndpoint {
    id: ServerId,
    owner: Pid,
    state: Mutex<EndpointState>,
    arrivals: Condvar,
}

impl ServerEndpoint {
    pub(crate) fn new(id: ServerId, owner: Pid) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            state: Mutex::new(EndpointState {
                queue: VecDeque::new(),
                delivered: HashMap::new(),
                released: Vec::new(),
                next_token: 1,
                closed: false,
            }),
            arrivals: Condvar::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Process that owns this endpoint
    #[inline]
    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    /// Block until woken (arrival or close)
    pub(crate) fn wait(&self, state: &mut MutexGuard<'_, EndpointState>) {
        self.arrivals.wait(state);
    }

    /// Block until woken or `deadline`; returns false on timeout
    pub(crate) fn wait_until(&self, state: &mut MutexGuard<'_, EndpointState>, deadline: Instant) -> bool {
        !self.arrivals.wait_until(state, deadline).timed_out()
    }

    pub(crate) fn wake_one(&self) {
        self.arrivals.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        self.arrivals.notify_all();
    }

    /// Record that an object this server forged lost its last reference
    pub(crate) fn notify_released(&self, local_id: LocalId) {
        let mut state = self.state.lock();
        if !state.closed {
            state.released.push(local_id);
        }
    }

    /// Drain release notifications, oldest first
    pub fn take_released(&self) -> Vec<LocalId> {
        core::mem::take(&mut self.state.lock().released)
    }

    /// Number of calls waiting to be picked up by `next`
    pub fn queued(&self) -> usize {
        self.state.lock().queue_len()
    }

    /// Number of calls handed out by `next` and not yet replied
    pub fn in_flight(&self) -> usize {
        self.state.lock().delivered_len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }
}

impl core::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerEndpoint")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("queued", &state.queue.len())
            .field("in_flight", &state.delivered.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Directory of live endpoints by server id
pub struct ServerDirectory {
    endpoints: RwLock<HashMap<ServerId, Arc<ServerEndpoint>>>,
    next_id: AtomicU32,
}

impl ServerDirectory {
    pub(crate) fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Create and register an endpoint owned by `owner`
    pub(crate) fn create(&self, owner: Pid) -> Arc<ServerEndpoint> {
        let id = ServerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = ServerEndpoint::new(id, owner);
        self.insert(Arc::clone(&endpoint));
        endpoint
    }

    pub(crate) fn insert(&self, endpoint: Arc<ServerEndpoint>) {
        self.endpoints.write().insert(endpoint.id(), endpoint);
    }

    pub fn get(&self, id: ServerId) -> Option<Arc<ServerEndpoint>> {
        self.endpoints.read().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: ServerId) -> Option<Arc<ServerEndpoint>> {
        self.endpoints.write().remove(&id)
    }

    /// Endpoints owned by `owner`
    pub(crate) fn owned_by(&self, owner: Pid) -> Vec<Arc<ServerEndpoint>> {
        self.endpoints
            .read()
            .values()
            .filter(|e| e.owner() == owner)
            .cloned()
            .collect()
    }

    /// Forward a zero-refcount notification to the owning endpoint, if it
    /// still exists
    pub(crate) fn notify_released(&self, server: ServerId, local_id: LocalId) {
        if let Some(endpoint) = self.get(server) {
            endpoint.notify_released(local_id);
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
