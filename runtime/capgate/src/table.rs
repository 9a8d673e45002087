//! Process Handle Table
//!
//! Per-process mapping from small dense integers (handle numbers) to kernel
//! handle object references. Possessing an entry is possessing the
//! capability.
//!
//! ## Design
//!
//! - Handle numbers are scoped to one table and mean nothing elsewhere
//! - `install` always hands out the lowest free number
//! - Several entries (here or in other tables) may alias one object; each
//!   entry holds one count on it
//! - Each entry carries [`HandleRights`]; derived entries may only drop rights
//! - A named table maps startup names to handle numbers; it is sealed when
//!   the process starts, and closing a handle drops every name bound to it
//!
//! ```text
//! HandleTable
//!   ├─[0] → ObjectRef(server 1, local 5)  INVOKE|DUPLICATE|TRANSFER
//!   ├─[1] → (free)
//!   └─[2] → ObjectRef(server 1, local 5)  INVOKE
//! named: "stdout" → 0
//! ```

use core::cmp::Reverse;
use core::fmt;
use std::collections::{BinaryHeap, HashMap};

use bitflags::bitflags;

use crate::error::{IpcError, Result};
use crate::object::{ObjectKey, ObjectRef};

/// Largest table capacity; handle numbers are `u32`
pub const MAX_HANDLES: usize = u32::MAX as usize;

/// Conventional startup names
pub mod names {
    pub const STDIN: &str = "stdin";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    /// The new process's own thread-of-control object
    pub const THREAD: &str = "thread";
}

/// Process-local handle number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Rights attached to one handle table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandleRights: u8 {
        /// Invoke protocol methods through the handle
        const INVOKE = 1 << 0;
        /// Duplicate the entry within the table
        const DUPLICATE = 1 << 1;
        /// Pass the handle to another process inside call/reply values
        const TRANSFER = 1 << 2;
    }
}

impl Default for HandleRights {
    fn default() -> Self {
        Self::all()
    }
}

struct Entry {
    object: ObjectRef,
    rights: HandleRights,
}

/// Per-process handle table
pub struct HandleTable {
    entries: Vec<Option<Entry>>,
    /// Freed numbers, lowest first
    free: BinaryHeap<Reverse<u32>>,
    capacity: usize,
    named: HashMap<String, Handle>,
    sealed: bool,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: BinaryHeap::new(),
            capacity: capacity.min(MAX_HANDLES),
            named: HashMap::new(),
            sealed: false,
        }
    }

    /// Bind `object` to the lowest free handle number
    ///
    /// The entry gets the rights the reference carries.
    ///
    /// # Errors
    /// `TableFull` when every number up to the capacity is in use. The
    /// reference is dropped in that case.
    pub fn install(&mut self, object: ObjectRef) -> Result<Handle> {
        let rights = object.rights();
        self.install_with_rights(object, rights)
    }

    /// Like [`install`](Self::install), narrowed to `rights`
    ///
    /// Rights the reference does not carry are never granted.
    pub fn install_with_rights(&mut self, object: ObjectRef, rights: HandleRights) -> Result<Handle> {
        let object = object.restrict(rights);
        let rights = object.rights();
        let entry = Some(Entry { object, rights });
        if let Some(Reverse(raw)) = self.free.pop() {
            self.entries[raw as usize] = entry;
            return Ok(Handle(raw));
        }

        let full = IpcError::TableFull { capacity: self.capacity };
        if self.entries.len() >= self.capacity {
            return Err(full);
        }
        let raw = u32::try_from(self.entries.len()).map_err(|_| full)?;
        self.entries.push(entry);
        Ok(Handle(raw))
    }

    fn entry(&self, handle: Handle) -> Option<&Entry> {
        self.entries.get(handle.index()).and_then(Option::as_ref)
    }

    /// Resolve a handle number; absent for anything not currently installed
    pub fn lookup(&self, handle: Handle) -> Option<ObjectRef> {
        self.entry(handle).map(|e| e.object.clone())
    }

    /// Rights of an installed handle
    pub fn rights(&self, handle: Handle) -> Option<HandleRights> {
        self.entry(handle).map(|e| e.rights)
    }

    /// Resolve a handle that must carry `required` rights
    ///
    /// # Errors
    /// `InvalidHandle` if not installed, `InsufficientRights` if rights are
    /// missing.
    pub fn resolve(&self, handle: Handle, required: HandleRights) -> Result<ObjectRef> {
        let entry = self.entry(handle).ok_or(IpcError::InvalidHandle { handle })?;
        if !entry.rights.contains(required) {
            return Err(IpcError::InsufficientRights { handle });
        }
        Ok(entry.object.clone())
    }

    /// Install a second entry for the same object with the same rights
    pub fn duplicate(&mut self, handle: Handle) -> Result<Handle> {
        let rights = self.rights(handle).ok_or(IpcError::InvalidHandle { handle })?;
        self.duplicate_restricted(handle, rights)
    }

    /// Install a second entry for the same object with a subset of the rights
    ///
    /// # Errors
    /// `InsufficientRights` if the entry lacks `DUPLICATE` or `rights` asks
    /// for more than the entry holds.
    pub fn duplicate_restricted(&mut self, handle: Handle, rights: HandleRights) -> Result<Handle> {
        let entry = self.entry(handle).ok_or(IpcError::InvalidHandle { handle })?;
        if !entry.rights.contains(HandleRights::DUPLICATE) || !entry.rights.contains(rights) {
            return Err(IpcError::InsufficientRights { handle });
        }
        let object = entry.object.clone();
        self.install_with_rights(object, rights)
    }

    /// Remove an entry, returning its reference
    ///
    /// Startup names bound to `handle` go with it, so a later install
    /// that reuses the number is never reachable by name.
    ///
    /// The caller drops the returned reference, which releases the object,
    /// after it stops holding any lock around this table.
    ///
    /// # Errors
    /// `AlreadyClosed` for a number that was issued and freed,
    /// `InvalidHandle` for a number never issued.
    pub fn close(&mut self, handle: Handle) -> Result<ObjectRef> {
        match self.entries.get_mut(handle.index()) {
            Some(slot) => match slot.take() {
                Some(entry) => {
                    self.free.push(Reverse(handle.0));
                    self.named.retain(|_, bound| *bound != handle);
                    Ok(entry.object)
                }
                None => Err(IpcError::AlreadyClosed { handle }),
            },
            None => Err(IpcError::InvalidHandle { handle }),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live entries referencing `key`
    pub fn count_referencing(&self, key: ObjectKey) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|e| e.object.key() == key)
            .count()
    }

    /// Bind a startup name to an installed handle
    ///
    /// # Errors
    /// `TableSealed` once the owning process has started, `InvalidHandle` if
    /// `handle` is not installed.
    pub fn install_named(&mut self, name: &str, handle: Handle) -> Result<()> {
        if self.sealed {
            return Err(IpcError::TableSealed);
        }
        if self.entry(handle).is_none() {
            return Err(IpcError::InvalidHandle { handle });
        }
        self.named.insert(name.to_owned(), handle);
        Ok(())
    }

    /// Look up a startup name
    pub fn resolve_named(&self, name: &str) -> Option<Handle> {
        self.named.get(name).copied()
    }

    /// Freeze the named table
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Empty the table, returning every reference it held
    pub(crate) fn drain(&mut self) -> Vec<ObjectRef> {
        self.free.clear();
        self.named.clear();
        self.entries.drain(..).flatten().map(|e| e.object).collect()
    }
}
