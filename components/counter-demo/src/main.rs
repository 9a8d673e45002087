//! capgate counter demo
//!
//! One counter server, several client processes. Every client inherits a
//! handle to a shared counter from an init process, hammers it from its own
//! thread, then forks a private counter that the server forgets again once
//! the client is destroyed.
//!
//! Usage:
//!   counter-demo --clients 8 --calls 1000 [--queue-depth 64] [--timeout-ms 500]
//!
//! Set `RUST_LOG=capgate=debug` to watch handle and object lifecycle.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use capgate::{
    define_protocol, HandleRights, IpcError, Kernel, KernelConfig, LocalId, MethodUid, Pid,
    ProtocolRegistry, Server, Value, DEFAULT_QUEUE_DEPTH,
};
use clap::Parser;

define_protocol! {
    /// Signed 64-bit counter
    pub protocol COUNTER("capgate.demo.counter", 0xC0_0A7E, mod counter) {
        0 => add(delta: I64) -> (I64);
        1 => get() -> (I64);
        /// New counter starting at this one's value
        2 => fork() -> (Handle);
    }
}

/// Startup name under which clients find the shared counter
const SHARED_COUNTER: &str = "counter";

#[derive(Parser, Debug)]
#[command(name = "counter-demo")]
#[command(about = "Concurrent clients calling a counter server through capgate handles")]
struct Args {
    /// Number of client processes
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// `add` calls made by each client
    #[arg(long, default_value_t = 100)]
    calls: u64,

    /// Server queue depth
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Per-call timeout in milliseconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,
}

fn overflow(method: MethodUid, current: i64, delta: i64) -> IpcError {
    IpcError::MalformedArguments {
        method,
        reason: format!("{} + {} overflows", current, delta),
    }
}

fn serve(server: Server) -> Result<()> {
    let mut counters: HashMap<LocalId, i64> = HashMap::new();
    let mut next_local = 1;

    loop {
        let incoming = match server.next() {
            Ok(incoming) => incoming,
            Err(IpcError::ServerGone { .. }) => break,
            Err(err) => return Err(err.into()),
        };
        for local in server.take_released() {
            counters.remove(&local);
            log::info!("counter {} released", local);
        }

        let current = *counters.entry(incoming.local_id).or_insert(0);
        let method = incoming.method;
        let replied = if method == counter::add {
            let delta = incoming.args[0].as_signed().unwrap_or(0);
            match current.checked_add(delta) {
                Some(sum) => {
                    counters.insert(incoming.local_id, sum);
                    server.reply(incoming.token, vec![Value::Signed(sum)])
                }
                None => server.reply_error(incoming.token, overflow(method, current, delta)),
            }
        } else if method == counter::get {
            server.reply(incoming.token, vec![Value::Signed(current)])
        } else if method == counter::fork {
            let local = LocalId(next_local);
            next_local += 1;
            let object = server.forge(local, [COUNTER.uid])?;
            counters.insert(local, current);
            server.reply(incoming.token, vec![Value::Object(object)])
        } else {
            server.reply_error(incoming.token, IpcError::UnknownMethod { method })
        };

        match replied {
            Ok(()) => {}
            // Caller timed out or was destroyed while we worked
            Err(IpcError::UnknownToken { token }) => log::warn!("reply to stale token {}", token),
            Err(err) => return Err(err.into()),
        }
    }

    log::info!("server drained, {} counters still live", counters.len());
    Ok(())
}

fn client(kernel: Kernel, pid: Pid, calls: u64) -> Result<i64> {
    let shared = kernel
        .resolve_named(pid, SHARED_COUNTER)?
        .context("shared counter was not inherited")?;

    for _ in 0..calls {
        kernel.call(pid, shared, counter::add, vec![Value::Signed(1)])?;
    }

    let reply = kernel.call(pid, shared, counter::fork, vec![])?;
    let private = reply[0].as_handle().context("fork returned no handle")?;
    let reply = kernel.call(pid, private, counter::add, vec![Value::Signed(pid.0 as i64)])?;
    reply[0].as_signed().context("add returned no value")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = KernelConfig::default().with_queue_depth(args.queue_depth);
    if args.timeout_ms > 0 {
        config = config.with_call_timeout(Duration::from_millis(args.timeout_ms));
    }
    let registry = ProtocolRegistry::with_protocols(&[&COUNTER]).context("building protocol registry")?;
    let kernel = Kernel::with_config(registry, config);

    log::info!("Configuration:");
    log::info!("  Clients:     {}", args.clients);
    log::info!("  Calls each:  {}", args.calls);
    log::info!("  Queue depth: {}", args.queue_depth);
    log::info!("  Timeout:     {} ms", args.timeout_ms);

    // Server and the init process that owns the shared counter
    let server_pid = kernel.spawn();
    let server = kernel.register_server(server_pid)?;
    let init = kernel.spawn();
    let shared = kernel.install(init, server.forge(LocalId(0), [COUNTER.uid])?)?;

    let server_thread = {
        let server = server.clone();
        thread::spawn(move || serve(server))
    };

    let mut clients = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let mut builder = kernel.process_builder();
        let h = builder.inherit(init, shared, HandleRights::INVOKE | HandleRights::TRANSFER)?;
        builder.install_named(SHARED_COUNTER, h)?;
        clients.push(builder.start());
    }

    let started = Instant::now();
    let workers: Vec<_> = clients
        .iter()
        .map(|&pid| {
            let kernel = kernel.clone();
            let calls = args.calls;
            thread::spawn(move || client(kernel, pid, calls))
        })
        .collect();
    for (pid, worker) in clients.iter().zip(workers) {
        let private = worker
            .join()
            .map_err(|_| anyhow!("client {} panicked", pid))??;
        log::info!("{} private counter at {}", pid, private);
    }
    let elapsed = started.elapsed();

    let total = kernel.call(init, shared, counter::get, vec![])?;
    let expected = args.clients as i64 * args.calls as i64;
    log::info!("shared counter: {:?} (expected {})", total, expected);
    if total != vec![Value::Signed(expected)] {
        bail!("shared counter lost updates");
    }

    let round_trips = args.clients as u64 * (args.calls + 2);
    log::info!(
        "{} round trips in {:?} ({:.0}/s)",
        round_trips,
        elapsed,
        round_trips as f64 / elapsed.as_secs_f64()
    );

    // Dropping the clients releases their private counters
    for pid in clients {
        kernel.destroy_process(pid)?;
    }
    kernel.call(init, shared, counter::get, vec![])?;
    log::info!("{:?}", kernel.stats());

    kernel.destroy_process(server_pid)?;
    server_thread
        .join()
        .map_err(|_| anyhow!("server thread panicked"))??;
    kernel.destroy_process(init)?;
    log::info!("{:?}", kernel.stats());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_overflow_is_reported_not_applied() {
        let kernel = Kernel::new(ProtocolRegistry::with_protocols(&[&COUNTER]).unwrap());
        let server_pid = kernel.spawn();
        let server = kernel.register_server(server_pid).unwrap();
        let client = kernel.spawn();
        let handle = kernel
            .install(client, server.forge(LocalId(0), [COUNTER.uid]).unwrap())
            .unwrap();
        let worker = thread::spawn(move || serve(server));

        let max = vec![Value::Signed(i64::MAX)];
        assert_eq!(kernel.call(client, handle, counter::add, max.clone()).unwrap(), max);
        assert!(matches!(
            kernel.call(client, handle, counter::add, vec![Value::Signed(1)]),
            Err(IpcError::MalformedArguments { .. })
        ));
        assert_eq!(kernel.call(client, handle, counter::get, vec![]).unwrap(), max);

        kernel.destroy_process(server_pid).unwrap();
        worker.join().unwrap().unwrap();
    }
}
