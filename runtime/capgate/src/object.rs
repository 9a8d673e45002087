//! Kernel Handle Objects
//!
//! A kernel handle object identifies one server-owned object: the owning
//! server, the server's opaque local id for it, and the set of protocols it
//! answers to. Objects are shared by every holder and live as long as the
//! longest holder.
//!
//! ## Design
//!
//! - Objects live in an arena ([`ObjectArena`]) indexed by a stable small key
//!   ([`ObjectKey`]: slab index plus generation)
//! - The reference count is explicit: [`ObjectArena::retain`] and
//!   [`ObjectArena::release`] under the arena lock
//! - [`ObjectRef`] owns exactly one count: cloning retains, dropping releases
//! - Every [`ObjectRef`] carries a rights ceiling. Forged references hold all
//!   rights; references read back out of a handle table hold that entry's
//!   rights, and installing one never grants more
//! - The count reaching zero removes the object and notifies the owning
//!   server exactly once
//! - `(server, local_id)` pairs come only from `forge` and are unique among
//!   live objects
//!
//! ## Lifecycle
//!
//! ```text
//! forge ──► Live(refs ≥ 1) ──release to 0──► Destroyed (server notified)
//!               │
//!               └─server dies──► Invalidated ──release to 0──► Destroyed (silent)
//! ```

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use crate::endpoint::ServerDirectory;
use crate::error::{invariant_violation, IpcError, Result};
use crate::protocol::ProtocolUid;
use crate::table::HandleRights;

/// Identifies a server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{}", self.0)
    }
}

/// Opaque object id, meaningful only to the server that forged it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Set of protocols an object answers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProtocolSet(Vec<ProtocolUid>);

impl ProtocolSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, protocol: ProtocolUid) -> bool {
        self.0.binary_search(&protocol).is_ok()
    }

    pub fn insert(&mut self, protocol: ProtocolUid) {
        if let Err(pos) = self.0.binary_search(&protocol) {
            self.0.insert(pos, protocol);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ProtocolUid> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ProtocolUid> for ProtocolSet {
    fn from_iter<I: IntoIterator<Item = ProtocolUid>>(iter: I) -> Self {
        let mut set = Self::new();
        for protocol in iter {
            set.insert(protocol);
        }
        set
    }
}

impl From<&[ProtocolUid]> for ProtocolSet {
    fn from(protocols: &[ProtocolUid]) -> Self {
        protocols.iter().copied().collect()
    }
}

impl<const N: usize> From<[ProtocolUid; N]> for ProtocolSet {
    fn from(protocols: [ProtocolUid; N]) -> Self {
        protocols.into_iter().collect()
    }
}

/// Stable arena key of a kernel handle object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    index: usize,
    generation: u32,
}

/// Snapshot of an object's identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub server: ServerId,
    pub local_id: LocalId,
    pub protocols: ProtocolSet,
}

impl ObjectInfo {
    pub fn supports(&self, protocol: ProtocolUid) -> bool {
        self.protocols.contains(protocol)
    }
}

struct ObjectSlot {
    generation: u32,
    server: ServerId,
    local_id: LocalId,
    protocols: ProtocolSet,
    refs: usize,
    /// Cleared when the owning server dies
    valid: bool,
}

struct ArenaInner {
    slots: Slab<ObjectSlot>,
    /// Live `(server, local_id)` pairs of valid objects
    by_local: HashMap<(ServerId, LocalId), ObjectKey>,
    next_generation: u32,
}

impl ArenaInner {
    fn slot(&self, key: ObjectKey) -> Option<&ObjectSlot> {
        self.slots.get(key.index).filter(|s| s.generation == key.generation)
    }

    fn slot_mut(&mut self, key: ObjectKey) -> Option<&mut ObjectSlot> {
        self.slots.get_mut(key.index).filter(|s| s.generation == key.generation)
    }
}

/// Arena of kernel handle objects
pub struct ObjectArena {
    inner: Mutex<ArenaInner>,
    servers: Arc<ServerDirectory>,
}

impl ObjectArena {
    pub(crate) fn new(servers: Arc<ServerDirectory>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ArenaInner {
                slots: Slab::new(),
                by_local: HashMap::new(),
                next_generation: 0,
            }),
            servers,
        })
    }

    /// Create an object for `(server, local_id)`
    ///
    /// Only reachable through `forge`. The returned reference holds the
    /// object's first count.
    ///
    /// # Errors
    /// `DuplicateLocalId` if a live object already has this pair.
    pub(crate) fn create(
        self: &Arc<Self>,
        server: ServerId,
        local_id: LocalId,
        protocols: ProtocolSet,
    ) -> Result<ObjectRef> {
        let mut inner = self.inner.lock();
        if inner.by_local.contains_key(&(server, local_id)) {
            return Err(IpcError::DuplicateLocalId { server, local_id });
        }

        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let index = inner.slots.insert(ObjectSlot {
            generation,
            server,
            local_id,
            protocols,
            refs: 1,
            valid: true,
        });
        let key = ObjectKey { index, generation };
        inner.by_local.insert((server, local_id), key);
        drop(inner);

        log::debug!("forged object {:?} for {} local {}", key, server, local_id);
        Ok(ObjectRef {
            key,
            arena: Arc::clone(self),
            rights: HandleRights::all(),
        })
    }

    /// Add one count to a live object
    pub fn retain(&self, key: ObjectKey) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slot_mut(key) else {
            invariant_violation(format_args!("retain of freed object {:?}", key));
        };
        slot.refs = match slot.refs.checked_add(1) {
            Some(refs) => refs,
            None => invariant_violation(format_args!("refcount overflow on {:?}", key)),
        };
    }

    /// Drop one count; the last count destroys the object and notifies its
    /// server
    pub fn release(&self, key: ObjectKey) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slot_mut(key) else {
            invariant_violation(format_args!("release of freed object {:?}", key));
        };
        if slot.refs == 0 {
            invariant_violation(format_args!("refcount underflow on {:?}", key));
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }

        let slot = inner.slots.remove(key.index);
        if slot.valid {
            inner.by_local.remove(&(slot.server, slot.local_id));
        }
        drop(inner);

        log::debug!(
            "object {:?} ({} local {}) released",
            key,
            slot.server,
            slot.local_id
        );
        if slot.valid {
            self.servers.notify_released(slot.server, slot.local_id);
        }
    }

    /// Current count of a live object (0 if it no longer exists)
    pub fn ref_count(&self, key: ObjectKey) -> usize {
        self.inner.lock().slot(key).map_or(0, |s| s.refs)
    }

    /// Identity of a live object
    ///
    /// # Errors
    /// `HandleGone` if the object was invalidated or destroyed.
    pub fn describe(&self, key: ObjectKey) -> Result<ObjectInfo> {
        let inner = self.inner.lock();
        match inner.slot(key) {
            Some(slot) if slot.valid => Ok(ObjectInfo {
                server: slot.server,
                local_id: slot.local_id,
                protocols: slot.protocols.clone(),
            }),
            _ => Err(IpcError::HandleGone),
        }
    }

    /// Whether a live object answers to `protocol`
    pub fn supports(&self, key: ObjectKey, protocol: ProtocolUid) -> bool {
        let inner = self.inner.lock();
        inner
            .slot(key)
            .map_or(false, |s| s.valid && s.protocols.contains(protocol))
    }

    /// Invalidate every object forged by `server`
    ///
    /// Holders keep their counts; dispatch through them fails `HandleGone`.
    /// Returns the number of objects invalidated.
    pub(crate) fn invalidate_server(&self, server: ServerId) -> usize {
        let mut inner = self.inner.lock();
        let ArenaInner { slots, by_local, .. } = &mut *inner;
        let mut count = 0;
        for (_, slot) in slots.iter_mut() {
            if slot.server == server && slot.valid {
                slot.valid = false;
                by_local.remove(&(slot.server, slot.local_id));
                count += 1;
            }
        }
        count
    }

    /// Number of objects still in the arena (valid or invalidated)
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned reference to a kernel handle object
///
/// Holds exactly one count on the object. Cloning retains, dropping
/// releases. Clones keep the rights ceiling.
pub struct ObjectRef {
    key: ObjectKey,
    arena: Arc<ObjectArena>,
    rights: HandleRights,
}

impl ObjectRef {
    #[inline]
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// Whether the object answers to `protocol`
    pub fn supports(&self, protocol: ProtocolUid) -> bool {
        self.arena.supports(self.key, protocol)
    }

    /// Identity of the object
    ///
    /// # Errors
    /// `HandleGone` if the owning server has died.
    pub fn info(&self) -> Result<ObjectInfo> {
        self.arena.describe(self.key)
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        self.arena.ref_count(self.key)
    }

    /// Most rights any handle installed from this reference can carry
    #[inline]
    pub fn rights(&self) -> HandleRights {
        self.rights
    }

    /// Drop every right outside `rights`
    pub fn restrict(mut self, rights: HandleRights) -> Self {
        self.rights &= rights;
        self
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.arena.retain(self.key);
        Self {
            key: self.key,
            arena: Arc::clone(&self.arena),
            rights: self.rights,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.arena.release(self.key);
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("index", &self.key.index)
            .field("generation", &self.key.generation)
            .field("rights", &self.rights)
            .finish()
    }
}
