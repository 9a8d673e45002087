//! Integration tests for the complete capability IPC core
//!
//! These tests drive the public kernel surface end to end with real threads:
//! - Handle tables and object lifetime
//! - Protocol checks before forwarding
//! - FIFO delivery and token correlation
//! - Caller and server teardown
//! - Capability transfer through arguments and replies

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use capgate::*;

define_protocol! {
    /// Byte file
    pub protocol FILE("test.file", 0xF11E, mod file) {
        0 => read(len: U32) -> (Bytes);
        1 => open_child(name: Bytes) -> (Handle);
    }
}

define_protocol! {
    /// Directory of named objects
    pub protocol DIR("test.dir", 0xD12, mod dir) {
        0 => list() -> (U32);
        1 => adopt(file: Handle) -> (Bool);
    }
}

const BOUND: Duration = Duration::from_secs(5);

struct World {
    kernel: Kernel,
    server: Server,
}

fn world() -> World {
    world_with(KernelConfig::default())
}

fn world_with(config: KernelConfig) -> World {
    let registry = ProtocolRegistry::with_protocols(&[&FILE, &DIR]).unwrap();
    let kernel = Kernel::with_config(registry, config);
    let server_pid = kernel.spawn();
    let server = kernel.register_server(server_pid).unwrap();
    World { kernel, server }
}

impl World {
    /// Forge `local` with `protocols` and install it into `pid`
    fn grant<const N: usize>(&self, pid: Pid, local: u64, protocols: [ProtocolUid; N]) -> Handle {
        let object = self.server.forge(LocalId(local), protocols).unwrap();
        self.kernel.install(pid, object).unwrap()
    }

    fn spawn_call(&self, pid: Pid, handle: Handle, method: MethodUid, args: Vec<Value>) -> mpsc::Receiver<Result<Vec<Value>>> {
        let (tx, rx) = mpsc::channel();
        let kernel = self.kernel.clone();
        thread::spawn(move || {
            let _ = tx.send(kernel.call(pid, handle, method, args));
        });
        rx
    }

    fn wait_queued(&self, n: usize) {
        while self.server.queued() < n {
            thread::yield_now();
        }
    }
}

#[test]
fn test_lookup_of_uninstalled_handle_is_absent() {
    let w = world();
    let pid = w.kernel.spawn();
    assert!(w.kernel.lookup(pid, Handle::new(0)).unwrap().is_none());

    let h = w.grant(pid, 1, [FILE.uid]);
    w.kernel.close(pid, h).unwrap();
    assert!(w.kernel.lookup(pid, h).unwrap().is_none());
    assert_eq!(w.kernel.close(pid, h), Err(IpcError::AlreadyClosed { handle: h }));
}

#[test]
fn test_table_entries_match_refcount() {
    let w = world();
    let a = w.kernel.spawn();
    let b = w.kernel.spawn();

    let object = w.server.forge(LocalId(5), [FILE.uid]).unwrap();
    let probe = object.clone();
    let ha = w.kernel.install(a, object).unwrap();
    let ha2 = w.kernel.duplicate(a, ha).unwrap();
    w.kernel.install(b, probe.clone()).unwrap();

    let entries = |kernel: &Kernel| {
        kernel.count_references(a, &probe).unwrap() + kernel.count_references(b, &probe).unwrap()
    };
    // `probe` itself holds one count
    assert_eq!(entries(&w.kernel), 3);
    assert_eq!(w.kernel.ref_count(&probe), 4);

    w.kernel.close(a, ha2).unwrap();
    assert_eq!(entries(&w.kernel), 2);
    assert_eq!(w.kernel.ref_count(&probe), 3);

    w.kernel.destroy_process(b).unwrap();
    assert_eq!(w.kernel.count_references(a, &probe).unwrap(), 1);
    assert_eq!(w.kernel.ref_count(&probe), 2);
}

#[test]
fn test_duplicate_then_close_either() {
    let w = world();
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 9, [FILE.uid]);
    let dup = w.kernel.duplicate(pid, h).unwrap();

    w.kernel.close(pid, h).unwrap();
    let survivor = w.kernel.lookup(pid, dup).unwrap().unwrap();
    assert_eq!(w.kernel.describe(&survivor).unwrap().local_id, LocalId(9));

    let caller = w.spawn_call(pid, dup, file::read, vec![Value::Unsigned(3)]);
    let incoming = w.server.next().unwrap();
    assert_eq!(incoming.local_id, LocalId(9));
    w.server.reply(incoming.token, vec![Value::Bytes(b"abc".to_vec())]).unwrap();
    assert_eq!(
        caller.recv_timeout(BOUND).unwrap(),
        Ok(vec![Value::Bytes(b"abc".to_vec())])
    );
}

#[test]
fn test_unsupported_protocol_never_reaches_server() {
    let w = world();
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 1, [FILE.uid]);

    assert_eq!(
        w.kernel.call(pid, h, dir::list, vec![]),
        Err(IpcError::UnsupportedProtocol { protocol: DIR.uid })
    );
    assert!(w.server.try_next().unwrap().is_none());
    assert_eq!(w.kernel.stats().pending_calls, 0);
}

#[test]
fn test_fifo_across_callers() {
    let w = world();
    let x = w.kernel.spawn();
    let y = w.kernel.spawn();
    let hx = w.grant(x, 1, [FILE.uid]);
    let hy = w.grant(y, 2, [FILE.uid]);

    let c1 = w.spawn_call(x, hx, file::read, vec![Value::Unsigned(1)]);
    w.wait_queued(1);
    let c2 = w.spawn_call(y, hy, file::read, vec![Value::Unsigned(2)]);
    w.wait_queued(2);

    let first = w.server.next().unwrap();
    let second = w.server.next().unwrap();
    assert_eq!(first.local_id, LocalId(1));
    assert_eq!(first.args, vec![Value::Unsigned(1)]);
    assert_eq!(second.local_id, LocalId(2));
    assert_eq!(second.args, vec![Value::Unsigned(2)]);

    // Replies may go out of order; each reaches its own caller
    w.server.reply(second.token, vec![Value::Bytes(vec![2])]).unwrap();
    w.server.reply(first.token, vec![Value::Bytes(vec![1])]).unwrap();
    assert_eq!(c1.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Bytes(vec![1])]));
    assert_eq!(c2.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Bytes(vec![2])]));
}

#[test]
fn test_destroyed_caller_token_is_unknown() {
    let w = world();
    let doomed = w.kernel.spawn();
    let other = w.kernel.spawn();
    let hd = w.grant(doomed, 1, [FILE.uid]);
    let ho = w.grant(other, 2, [FILE.uid]);

    let doomed_call = w.spawn_call(doomed, hd, file::read, vec![Value::Unsigned(1)]);
    w.wait_queued(1);
    let other_call = w.spawn_call(other, ho, file::read, vec![Value::Unsigned(2)]);
    w.wait_queued(2);

    let delivered = w.server.next().unwrap();
    assert_eq!(delivered.local_id, LocalId(1));

    w.kernel.destroy_process(doomed).unwrap();
    assert_eq!(doomed_call.recv_timeout(BOUND).unwrap(), Err(IpcError::Cancelled));

    assert_eq!(
        w.server.reply(delivered.token, vec![Value::Bytes(vec![])]),
        Err(IpcError::UnknownToken { token: delivered.token.0 })
    );

    // The other correlation is untouched
    let next = w.server.next().unwrap();
    assert_eq!(next.local_id, LocalId(2));
    w.server.reply(next.token, vec![Value::Bytes(vec![7])]).unwrap();
    assert_eq!(other_call.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Bytes(vec![7])]));
}

#[test]
fn test_destroyed_caller_with_queued_call_is_retracted() {
    let w = world();
    let doomed = w.kernel.spawn();
    let h = w.grant(doomed, 1, [FILE.uid]);

    let call = w.spawn_call(doomed, h, file::read, vec![Value::Unsigned(1)]);
    w.wait_queued(1);
    w.kernel.destroy_process(doomed).unwrap();

    assert_eq!(call.recv_timeout(BOUND).unwrap(), Err(IpcError::Cancelled));
    assert_eq!(w.server.queued(), 0);
    assert!(w.server.try_next().unwrap().is_none());
}

#[test]
fn test_server_death_resumes_every_caller() {
    const N: usize = 8;
    let w = world();
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 1, [FILE.uid]);

    let calls: Vec<_> = (0..N)
        .map(|i| w.spawn_call(pid, h, file::read, vec![Value::Unsigned(i as u64)]))
        .collect();
    w.wait_queued(N);
    // One of them already delivered
    let _delivered = w.server.next().unwrap();

    let server_id = w.server.id();
    w.kernel.destroy_process(w.server.owner()).unwrap();

    for call in calls {
        assert_eq!(
            call.recv_timeout(BOUND).unwrap(),
            Err(IpcError::ServerGone { server: server_id })
        );
    }

    // The server's objects are stale now
    assert_eq!(
        w.kernel.call(pid, h, file::read, vec![Value::Unsigned(0)]),
        Err(IpcError::HandleGone)
    );
    assert_eq!(w.kernel.stats().pending_calls, 0);
}

#[test]
fn test_shared_object_in_two_processes() {
    let w = world();
    let a = w.kernel.spawn();
    let b = w.kernel.spawn();

    let object = w.server.forge(LocalId(5), [FILE.uid]).unwrap();
    let ha = w.kernel.install(a, object.clone()).unwrap();
    let hb = w.kernel.install(b, object).unwrap();

    let oa = w.kernel.lookup(a, ha).unwrap().unwrap();
    let ob = w.kernel.lookup(b, hb).unwrap().unwrap();
    assert!(oa.supports(FILE.uid));
    assert!(ob.supports(FILE.uid));
    assert_eq!(oa, ob);
    // Two table entries plus the two probes
    assert_eq!(w.kernel.ref_count(&oa), 4);
    drop((oa, ob));

    let call = w.spawn_call(b, hb, file::read, vec![Value::Unsigned(1)]);
    let incoming = w.server.next().unwrap();
    assert_eq!(incoming.local_id, LocalId(5));
    w.server.reply(incoming.token, vec![Value::Bytes(vec![])]).unwrap();
    call.recv_timeout(BOUND).unwrap().unwrap();
    assert!(w.server.try_next().unwrap().is_none());
}

#[test]
fn test_release_notifies_once_and_local_id_is_reusable() {
    let w = world();
    let a = w.kernel.spawn();
    let b = w.kernel.spawn();
    let object = w.server.forge(LocalId(3), [FILE.uid]).unwrap();
    let ha = w.kernel.install(a, object.clone()).unwrap();
    let hb = w.kernel.install(b, object).unwrap();

    assert!(matches!(
        w.server.forge(LocalId(3), [FILE.uid]),
        Err(IpcError::DuplicateLocalId { local_id: LocalId(3), .. })
    ));

    w.kernel.close(a, ha).unwrap();
    assert!(w.server.take_released().is_empty());
    w.kernel.close(b, hb).unwrap();
    assert_eq!(w.server.take_released(), vec![LocalId(3)]);
    assert!(w.server.take_released().is_empty());

    assert!(w.server.forge(LocalId(3), [FILE.uid]).is_ok());
}

#[test]
fn test_reply_handle_installed_in_caller() {
    let w = world();
    let client = w.kernel.spawn();
    let h = w.grant(client, 1, [FILE.uid]);

    // Pad the server's own table so its numbering differs from the client's
    let server_pid = w.server.owner();
    for local in 100..103 {
        w.grant(server_pid, local, [DIR.uid]);
    }

    let call = w.spawn_call(client, h, file::open_child, vec![Value::Bytes(b"log".to_vec())]);
    let incoming = w.server.next().unwrap();

    // Reply with a handle from the server's own table
    let child = w.server.forge(LocalId(2), [FILE.uid]).unwrap();
    let server_handle = w.kernel.install(server_pid, child).unwrap();
    assert_eq!(server_handle, Handle::new(3));
    w.server
        .reply(incoming.token, vec![Value::Handle(server_handle)])
        .unwrap();

    let reply = call.recv_timeout(BOUND).unwrap().unwrap();
    let client_handle = reply[0].as_handle().unwrap();
    assert_eq!(client_handle, Handle::new(1));

    let installed = w.kernel.lookup(client, client_handle).unwrap().unwrap();
    assert_eq!(w.kernel.describe(&installed).unwrap().local_id, LocalId(2));
    // Server keeps its own entry
    assert!(w.kernel.lookup(server_pid, server_handle).unwrap().is_some());
}

#[test]
fn test_argument_handle_transferred_to_server() {
    let w = world();
    let client = w.kernel.spawn();
    let dir_handle = w.grant(client, 1, [DIR.uid]);
    let file_handle = w.grant(client, 2, [FILE.uid]);

    let call = w.spawn_call(client, dir_handle, dir::adopt, vec![Value::Handle(file_handle)]);
    let incoming = w.server.next().unwrap();
    let received = incoming.args[0].as_handle().unwrap();

    let object = w.kernel.lookup(w.server.owner(), received).unwrap().unwrap();
    assert_eq!(object.info().unwrap().local_id, LocalId(2));
    w.server.reply(incoming.token, vec![Value::Bool(true)]).unwrap();
    assert_eq!(call.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Bool(true)]));

    // Without TRANSFER the handle cannot travel
    let pinned = w
        .kernel
        .duplicate_restricted(client, file_handle, HandleRights::INVOKE)
        .unwrap();
    assert_eq!(
        w.kernel.call(client, dir_handle, dir::adopt, vec![Value::Handle(pinned)]),
        Err(IpcError::InsufficientRights { handle: pinned })
    );
}

#[test]
fn test_looked_up_reference_cannot_regain_rights() {
    let w = world();
    let client = w.kernel.spawn();
    let dir_handle = w.grant(client, 1, [DIR.uid]);
    let h = w.grant(client, 2, [FILE.uid]);
    let weak = w
        .kernel
        .duplicate_restricted(client, h, HandleRights::INVOKE)
        .unwrap();
    w.kernel.close(client, h).unwrap();

    // Re-installing what lookup returned keeps INVOKE only
    let object = w.kernel.lookup(client, weak).unwrap().unwrap();
    let again = w.kernel.install(client, object).unwrap();
    assert_eq!(
        w.kernel.duplicate(client, again),
        Err(IpcError::InsufficientRights { handle: again })
    );

    // Nor can the reference travel as a raw object value
    let object = w.kernel.lookup(client, weak).unwrap().unwrap();
    assert_eq!(
        w.kernel.call(client, dir_handle, dir::adopt, vec![Value::Object(object)]),
        Err(IpcError::NotTransferable)
    );
    assert!(w.server.try_next().unwrap().is_none());

    // Still callable through the narrowed handle
    let call = w.spawn_call(client, again, file::read, vec![Value::Unsigned(1)]);
    let incoming = w.server.next().unwrap();
    w.server.reply(incoming.token, vec![Value::Bytes(vec![])]).unwrap();
    assert_eq!(call.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Bytes(vec![])]));
}

#[test]
fn test_closed_named_handle_does_not_resolve_to_reused_number() {
    let w = world();
    let parent = w.kernel.spawn();
    let console = w.grant(parent, 1, [FILE.uid]);

    let mut builder = w.kernel.process_builder();
    let stdout = builder.inherit(parent, console, HandleRights::all()).unwrap();
    builder.install_named(names::STDOUT, stdout).unwrap();
    let child = builder.start();

    w.kernel.close(child, stdout).unwrap();
    let other = w.grant(child, 2, [FILE.uid]);
    assert_eq!(other, stdout);
    assert_eq!(w.kernel.resolve_named(child, names::STDOUT).unwrap(), None);
}

#[test]
fn test_malformed_reply_then_retry() {
    let w = world();
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 1, [DIR.uid]);

    let call = w.spawn_call(pid, h, dir::list, vec![]);
    let incoming = w.server.next().unwrap();
    assert!(matches!(
        w.server.reply(incoming.token, vec![Value::Signed(-1)]),
        Err(IpcError::MalformedReply { .. })
    ));
    assert!(call.try_recv().is_err());

    w.server.reply(incoming.token, vec![Value::Unsigned(4)]).unwrap();
    assert_eq!(call.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Unsigned(4)]));
}

#[test]
fn test_configured_timeout_retracts() {
    let w = world_with(KernelConfig::default().with_call_timeout(Duration::from_millis(30)));
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 1, [DIR.uid]);

    assert_eq!(w.kernel.call(pid, h, dir::list, vec![]), Err(IpcError::TimedOut));
    assert_eq!(w.server.queued(), 0);
    assert!(w.server.try_next().unwrap().is_none());
}

#[test]
fn test_process_builder_named_table() {
    let w = world();
    let parent = w.kernel.spawn();
    let console = w.grant(parent, 1, [FILE.uid]);

    let mut builder = w.kernel.process_builder();
    let stdout = builder
        .inherit(parent, console, HandleRights::INVOKE | HandleRights::TRANSFER)
        .unwrap();
    builder.install_named(names::STDOUT, stdout).unwrap();
    let thread_obj = w.server.forge(LocalId(50), [DIR.uid]).unwrap();
    let thread = builder.install(thread_obj).unwrap();
    builder.install_named(names::THREAD, thread).unwrap();
    let child = builder.start();

    assert_eq!(w.kernel.resolve_named(child, names::STDOUT).unwrap(), Some(stdout));
    assert_eq!(w.kernel.resolve_named(child, names::THREAD).unwrap(), Some(thread));
    assert_eq!(w.kernel.resolve_named(child, names::STDIN).unwrap(), None);
    assert_eq!(
        w.kernel.install_named(child, names::STDIN, stdout),
        Err(IpcError::TableSealed)
    );

    // Inherited rights are what was asked for, never more
    assert_eq!(
        w.kernel.duplicate(child, stdout),
        Err(IpcError::InsufficientRights { handle: stdout })
    );
    let info = w.kernel.authorize(child, stdout, FILE.uid).unwrap();
    assert_eq!(info.local_id, LocalId(1));
}

#[test]
fn test_many_concurrent_callers() {
    const CALLERS: u64 = 16;
    let w = world();
    let pid = w.kernel.spawn();
    let h = w.grant(pid, 1, [DIR.uid]);

    let worker = {
        let server = w.server.clone();
        thread::spawn(move || {
            for _ in 0..CALLERS {
                let incoming = server.next().unwrap();
                server.reply(incoming.token, vec![Value::Unsigned(1)]).unwrap();
            }
        })
    };

    let callers: Vec<_> = (0..CALLERS)
        .map(|_| w.spawn_call(pid, h, dir::list, vec![]))
        .collect();
    for call in callers {
        assert_eq!(call.recv_timeout(BOUND).unwrap(), Ok(vec![Value::Unsigned(1)]));
    }
    worker.join().unwrap();
    assert_eq!(w.kernel.stats().pending_calls, 0);
}
