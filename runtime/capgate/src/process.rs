//! Process descriptors
//!
//! A process owns exactly one handle table and the bookkeeping of the calls
//! it has outstanding. Teardown is explicit: the kernel marks the process
//! dead, cancels its calls, then drains its table.
//!
//! New processes are assembled with a [`ProcessBuilder`]. The builder owns
//! the child's table exclusively while the creator installs startup
//! capabilities, so nothing else can observe a half-populated table;
//! `start()` seals the named table and publishes the process in one step.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::Kernel;
use crate::error::{IpcError, Result};
use crate::object::{ObjectKey, ObjectRef, ServerId};
use crate::pending::CallId;
use crate::table::{Handle, HandleRights, HandleTable};
use crate::value::Value;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

struct Lifecycle {
    alive: bool,
    /// Calls this process is blocked on, and the server each was sent to
    outstanding: HashMap<CallId, ServerId>,
}

/// A live process: its handle table and outstanding calls
///
/// Lock order: `table` before `life`.
pub struct Process {
    pid: Pid,
    table: Mutex<HandleTable>,
    life: Mutex<Lifecycle>,
}

impl Process {
    pub(crate) fn new(pid: Pid, table: HandleTable) -> Arc<Self> {
        Arc::new(Self {
            pid,
            table: Mutex::new(table),
            life: Mutex::new(Lifecycle {
                alive: true,
                outstanding: HashMap::new(),
            }),
        })
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.life.lock().alive
    }

    fn gone(&self) -> IpcError {
        IpcError::NoSuchProcess { pid: self.pid.0 }
    }

    /// Record a call about to be queued
    ///
    /// # Errors
    /// `NoSuchProcess` once teardown has begun.
    pub(crate) fn begin_call(&self, call: CallId, server: ServerId) -> Result<()> {
        let mut life = self.life.lock();
        if !life.alive {
            return Err(self.gone());
        }
        life.outstanding.insert(call, server);
        Ok(())
    }

    pub(crate) fn end_call(&self, call: CallId) {
        self.life.lock().outstanding.remove(&call);
    }

    /// Begin teardown, returning the calls still outstanding
    pub(crate) fn mark_dead(&self) -> Vec<(CallId, ServerId)> {
        let mut life = self.life.lock();
        life.alive = false;
        life.outstanding.drain().collect()
    }

    /// Run `f` against the table of a live process
    fn with_table<T>(&self, f: impl FnOnce(&mut HandleTable) -> Result<T>) -> Result<T> {
        let mut table = self.table.lock();
        if !self.is_alive() {
            return Err(self.gone());
        }
        f(&mut table)
    }

    pub(crate) fn install(&self, object: ObjectRef) -> Result<Handle> {
        self.with_table(|t| t.install(object))
    }

    pub(crate) fn lookup(&self, handle: Handle) -> Option<ObjectRef> {
        self.table.lock().lookup(handle)
    }

    pub(crate) fn resolve(&self, handle: Handle, required: HandleRights) -> Result<ObjectRef> {
        self.table.lock().resolve(handle, required)
    }

    pub(crate) fn duplicate(&self, handle: Handle) -> Result<Handle> {
        self.with_table(|t| t.duplicate(handle))
    }

    pub(crate) fn duplicate_restricted(&self, handle: Handle, rights: HandleRights) -> Result<Handle> {
        self.with_table(|t| t.duplicate_restricted(handle, rights))
    }

    /// Remove an entry; the caller drops the returned reference
    pub(crate) fn close(&self, handle: Handle) -> Result<ObjectRef> {
        self.table.lock().close(handle)
    }

    pub(crate) fn install_named(&self, name: &str, handle: Handle) -> Result<()> {
        self.table.lock().install_named(name, handle)
    }

    pub(crate) fn resolve_named(&self, name: &str) -> Option<Handle> {
        self.table.lock().resolve_named(name)
    }

    pub(crate) fn count_referencing(&self, key: ObjectKey) -> usize {
        self.table.lock().count_referencing(key)
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Empty the table; the caller drops the returned references
    pub(crate) fn drain_table(&self) -> Vec<ObjectRef> {
        self.table.lock().drain()
    }

    /// Convert outgoing handle values into owned references
    ///
    /// Every `Value::Handle` must name an entry with the `TRANSFER` right,
    /// and every `Value::Object` must carry it. The handles stay installed
    /// here; the references are new counts.
    pub(crate) fn export_values(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        let mut exported = Vec::with_capacity(values.len());
        let outcome = {
            let table = self.table.lock();
            values.into_iter().try_for_each(|value| {
                let value = match value {
                    Value::Handle(handle) => Value::Object(table.resolve(handle, HandleRights::TRANSFER)?),
                    Value::Object(object) if !object.rights().contains(HandleRights::TRANSFER) => {
                        exported.push(Value::Object(object));
                        return Err(IpcError::NotTransferable);
                    }
                    other => other,
                };
                exported.push(value);
                Ok::<(), IpcError>(())
            })
        };
        // On failure `exported` is dropped here, outside the table lock
        outcome.map(|()| exported)
    }

    /// Install incoming references, replacing each with its new handle
    ///
    /// All or nothing: on failure every handle installed so far is closed
    /// again.
    pub(crate) fn import_values(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        let mut imported = Vec::with_capacity(values.len());
        let mut installed = Vec::new();
        let mut leftovers = Vec::new();
        let mut failure = None;
        {
            let mut table = self.table.lock();
            if !self.is_alive() {
                failure = Some(self.gone());
            }
            for value in values {
                if failure.is_some() {
                    leftovers.push(value);
                    continue;
                }
                match value {
                    Value::Object(object) => match table.install(object) {
                        Ok(handle) => {
                            installed.push(handle);
                            imported.push(Value::Handle(handle));
                        }
                        Err(err) => failure = Some(err),
                    },
                    other => imported.push(other),
                }
            }
            if failure.is_some() {
                for handle in installed {
                    if let Ok(object) = table.close(handle) {
                        leftovers.push(Value::Object(object));
                    }
                }
            }
        }
        drop(leftovers);

        match failure {
            Some(err) => Err(err),
            None => Ok(imported),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("handles", &self.handle_count())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Assembles a process's startup capabilities before it runs
pub struct ProcessBuilder {
    kernel: Kernel,
    pid: Pid,
    table: HandleTable,
}

impl ProcessBuilder {
    pub(crate) fn new(kernel: Kernel, pid: Pid, capacity: usize) -> Self {
        Self {
            kernel,
            pid,
            table: HandleTable::new(capacity),
        }
    }

    /// Pid the process will run as
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn install(&mut self, object: ObjectRef) -> Result<Handle> {
        self.table.install(object)
    }

    pub fn install_with_rights(&mut self, object: ObjectRef, rights: HandleRights) -> Result<Handle> {
        self.table.install_with_rights(object, rights)
    }

    /// Pass one of the creator's handles down to the child
    ///
    /// The creator's entry must carry `TRANSFER` and at least `rights`.
    pub fn inherit(&mut self, parent: Pid, handle: Handle, rights: HandleRights) -> Result<Handle> {
        let object = self.kernel.resolve_for_transfer(parent, handle, rights)?;
        self.table.install_with_rights(object, rights)
    }

    pub fn duplicate(&mut self, handle: Handle) -> Result<Handle> {
        self.table.duplicate(handle)
    }

    pub fn install_named(&mut self, name: &str, handle: Handle) -> Result<()> {
        self.table.install_named(name, handle)
    }

    /// Seal the named table and publish the process
    pub fn start(mut self) -> Pid {
        self.table.seal();
        let process = Process::new(self.pid, self.table);
        self.kernel.publish(process)
    }
}

impl fmt::Debug for ProcessBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBuilder")
            .field("pid", &self.pid)
            .field("handles", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServerDirectory;
    use crate::object::{LocalId, ObjectArena, ProtocolSet};

    fn setup() -> (Arc<ObjectArena>, Arc<Process>) {
        let arena = ObjectArena::new(Arc::new(ServerDirectory::new()));
        (arena, Process::new(Pid(1), HandleTable::new(4)))
    }

    fn forge(arena: &Arc<ObjectArena>, local: u64) -> ObjectRef {
        arena
            .create(ServerId(1), LocalId(local), ProtocolSet::new())
            .unwrap()
    }

    #[test]
    fn test_outstanding_calls() {
        let (_, process) = setup();
        process.begin_call(CallId(1), ServerId(1)).unwrap();
        process.begin_call(CallId(2), ServerId(2)).unwrap();
        process.end_call(CallId(1));

        let outstanding = process.mark_dead();
        assert_eq!(outstanding, vec![(CallId(2), ServerId(2))]);
        assert!(!process.is_alive());
        assert_eq!(
            process.begin_call(CallId(3), ServerId(1)),
            Err(IpcError::NoSuchProcess { pid: 1 })
        );
    }

    #[test]
    fn test_dead_process_rejects_installs() {
        let (arena, process) = setup();
        process.install(forge(&arena, 0)).unwrap();
        process.mark_dead();

        assert!(matches!(
            process.install(forge(&arena, 1)),
            Err(IpcError::NoSuchProcess { .. })
        ));
        drop(process.drain_table());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_export_requires_transfer() {
        let (arena, process) = setup();
        let h = process.install(forge(&arena, 0)).unwrap();
        let restricted = process.duplicate_restricted(h, HandleRights::INVOKE).unwrap();

        let exported = process
            .export_values(vec![Value::Unsigned(1), Value::Handle(h)])
            .unwrap();
        assert!(matches!(exported[1], Value::Object(_)));
        // Exporting retains; the entry stays installed
        assert_eq!(process.lookup(h).unwrap().ref_count(), 4);
        drop(exported);

        assert!(matches!(
            process.export_values(vec![Value::Handle(h), Value::Handle(restricted)]),
            Err(IpcError::InsufficientRights { .. })
        ));
        assert!(matches!(
            process.export_values(vec![Value::Handle(Handle::new(3))]),
            Err(IpcError::InvalidHandle { .. })
        ));
        // Failed exports left no extra counts behind
        let object = process.lookup(h).unwrap();
        assert_eq!(object.ref_count(), 3);
    }

    #[test]
    fn test_export_rejects_reference_without_transfer() {
        let (arena, process) = setup();
        let h = process.install(forge(&arena, 0)).unwrap();
        let pinned = process.duplicate_restricted(h, HandleRights::INVOKE).unwrap();

        let smuggled = process.lookup(pinned).unwrap();
        assert_eq!(
            process.export_values(vec![Value::Object(smuggled)]),
            Err(IpcError::NotTransferable)
        );
        // Only the two table entries remain
        assert_eq!(process.lookup(h).unwrap().ref_count(), 3);

        let carried = process.lookup(h).unwrap();
        assert!(process.export_values(vec![Value::Object(carried)]).is_ok());
    }

    #[test]
    fn test_import_is_all_or_nothing() {
        let (arena, process) = setup();
        process.install(forge(&arena, 0)).unwrap();
        process.install(forge(&arena, 1)).unwrap();

        let values = vec![
            Value::Object(forge(&arena, 2)),
            Value::Bool(true),
            Value::Object(forge(&arena, 3)),
        ];
        let imported = process.import_values(values).unwrap();
        assert_eq!(imported[0], Value::Handle(Handle::new(2)));
        assert_eq!(imported[1], Value::Bool(true));
        assert_eq!(imported[2], Value::Handle(Handle::new(3)));

        // Table is now full: nothing of a failed import may stick
        drop(process.close(Handle::new(3)).unwrap());
        let values = vec![Value::Object(forge(&arena, 4)), Value::Object(forge(&arena, 5))];
        assert!(matches!(
            process.import_values(values),
            Err(IpcError::TableFull { capacity: 4 })
        ));
        assert_eq!(process.handle_count(), 3);
        assert_eq!(arena.len(), 3);
    }
}
