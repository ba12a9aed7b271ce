//! # Reactor
//!
//! The `mio`-backed event loop that owns every [`Connection`](crate::connection::Connection)
//! and drives its four entry points. Two concurrency contracts are
//! supported, chosen by [`ReactorMode`]:
//!
//! - **Single-threaded**: one poll thread owns every connection outright; a
//!   connection's handlers are trivially serialized because nothing else ever
//!   touches it.
//! - **Multithreaded**: the poll thread only accepts and demultiplexes;
//!   readiness events are dispatched onto [`hkv_pool::ThreadPool`] as tasks,
//!   and each connection is wrapped in its own `parking_lot::Mutex` so two
//!   readiness events for the *same* connection can never run concurrently,
//!   while different connections run fully in parallel.
//!
//! ## Design Principles
//! 1. **Accept stays on the poll thread**: accepting and registering new
//!    sockets is cheap and must not race with the event loop's own
//!    `poll()` call, so it is never handed to the pool.
//! 2. **Interest is re-published after every handler call**: the connection's
//!    `interest()` is the single source of truth for what the reactor
//!    reregisters, matching its backpressure rules.
//! 3. **Shutdown is cooperative**: `Ctrl+C` flips an `AtomicBool`; the poll
//!    loop notices it within one bounded `poll()` timeout and unwinds,
//!    joining the pool (if any) before returning.
//! 4. **One registry clone, not one per event**: the multithreaded reactor
//!    duplicates the underlying `mio::Registry` exactly once, at startup,
//!    and wraps it in an `Arc`; every dispatched task clones the `Arc`
//!    (a refcount bump) instead of re-duplicating the epoll fd, so a
//!    transient fd-table failure under load can't panic the reactor thread.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use hkv_common::Storage;
use hkv_pool::{PoolConfig, ThreadPool};

use crate::config::{ReactorMode, ServerConfig};
use crate::connection::Connection;
use crate::metrics::Metrics;

const SERVER_TOKEN: Token = Token(0);
/// How long a single `poll()` call may block before the loop re-checks the
/// shutdown flag. Bounds shutdown latency without busy-waiting.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// A running (or not-yet-started) reactor instance.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    config: ServerConfig,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listening socket and registers it for readability. No
    /// connections are accepted until [`Server::run`] is called.
    pub fn bind(config: ServerConfig, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let addr = config.bind_addr.parse()?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SERVER_TOKEN, Interest::READABLE)?;

        Ok(Server {
            poll,
            listener,
            storage,
            config,
            metrics: Arc::new(Metrics::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A shared flag the caller (or a signal handler) can set to stop the
    /// reactor after its current `poll()` call returns.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the reactor until the shutdown flag is set. Blocks the calling
    /// thread.
    pub fn run(self) -> anyhow::Result<()> {
        match self.config.reactor_mode {
            ReactorMode::SingleThreaded => self.run_single_threaded(),
            ReactorMode::Multithreaded => self.run_multithreaded(),
        }
    }

    fn run_single_threaded(mut self) -> anyhow::Result<()> {
        let mut conns: HashMap<Token, Connection> = HashMap::new();
        let mut next_token = 1usize;
        let mut events = Events::with_capacity(1024);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in events.iter() {
                if event.token() == SERVER_TOKEN {
                    accept_loop(
                        &mut self.listener,
                        &self.poll,
                        &mut conns,
                        &mut next_token,
                        self.config.output_high_watermark,
                        self.config.output_low_watermark,
                        ReactorMode::SingleThreaded,
                    );
                    continue;
                }

                let token = event.token();
                let Some(conn) = conns.get_mut(&token) else {
                    continue;
                };

                drive_connection(conn, event.is_error(), event.is_readable(), event.is_writable(), self.storage.as_ref(), &self.metrics);

                if conn.is_alive() {
                    reregister(&self.poll, conn, token);
                } else {
                    let _ = self.poll.registry().deregister(conn.stream_mut());
                    conns.remove(&token);
                }
            }
        }

        Ok(())
    }

    fn run_multithreaded(mut self) -> anyhow::Result<()> {
        let pool = Arc::new(ThreadPool::new(PoolConfig {
            name: "hkv-conn".to_string(),
            max_queue_size: self.config.pool_max_queue_size,
            low_watermark: self.config.pool_low_watermark,
            high_watermark: self.config.pool_high_watermark,
            idle_time_ms: self.config.pool_idle_time_ms,
        })?);

        let registry = Arc::new(self.poll.registry().try_clone()?);
        let conns: Arc<Mutex<HashMap<Token, Arc<Mutex<Connection>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_token = Arc::new(AtomicUsize::new(1));
        let mut events = Events::with_capacity(1024);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in events.iter() {
                if event.token() == SERVER_TOKEN {
                    accept_loop_shared(
                        &mut self.listener,
                        &registry,
                        &conns,
                        &next_token,
                        self.config.output_high_watermark,
                        self.config.output_low_watermark,
                        ReactorMode::Multithreaded,
                    );
                    continue;
                }

                let token = event.token();
                let Some(handle) = conns.lock().get(&token).cloned() else {
                    continue;
                };

                let storage = Arc::clone(&self.storage);
                let metrics = Arc::clone(&self.metrics);
                let registry = Arc::clone(&registry);
                let conns = Arc::clone(&conns);
                let error = event.is_error();
                let readable = event.is_readable();
                let writable = event.is_writable();

                let submitted = pool.submit(move || {
                    let mut conn = handle.lock();
                    drive_connection(&mut conn, error, readable, writable, storage.as_ref(), &metrics);

                    if conn.is_alive() {
                        reregister(&RegistryPoll(&registry), &mut conn, token);
                    } else {
                        let _ = registry.deregister(conn.stream_mut());
                        conns.lock().remove(&token);
                    }
                });

                if !submitted {
                    tracing::warn!(?token, "connection task dropped: pool queue full");
                }
            }
        }

        pool.stop(true);
        Ok(())
    }
}

/// A poll-or-registry handle `reregister` can work against; lets the same
/// helper serve both the owned `Poll` (single-threaded) and a cloned
/// `Registry` (multithreaded, from a pool worker thread).
trait RegistrySource {
    fn registry(&self) -> &mio::Registry;
}

impl RegistrySource for Poll {
    fn registry(&self) -> &mio::Registry {
        Poll::registry(self)
    }
}

struct RegistryPoll<'a>(&'a mio::Registry);

impl RegistrySource for RegistryPoll<'_> {
    fn registry(&self) -> &mio::Registry {
        self.0
    }
}

fn reregister(source: &impl RegistrySource, conn: &mut Connection, token: Token) {
    if let Some(interest) = conn.interest() {
        let _ = source.registry().reregister(conn.stream_mut(), token, interest);
    }
}

fn accept_loop(
    listener: &mut TcpListener,
    poll: &Poll,
    conns: &mut HashMap<Token, Connection>,
    next_token: &mut usize,
    hi: usize,
    lo: usize,
    mode: ReactorMode,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                if poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE)
                    .is_err()
                {
                    continue;
                }
                let conn = Connection::new(stream, hi, lo, mode);
                conns.insert(token, conn);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                break;
            }
        }
    }
}

fn accept_loop_shared(
    listener: &mut TcpListener,
    registry: &mio::Registry,
    conns: &Arc<Mutex<HashMap<Token, Arc<Mutex<Connection>>>>>,
    next_token: &Arc<AtomicUsize>,
    hi: usize,
    lo: usize,
    mode: ReactorMode,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = Token(next_token.fetch_add(1, Ordering::Relaxed));
                if registry.register(&mut stream, token, Interest::READABLE).is_err() {
                    continue;
                }
                let conn = Connection::new(stream, hi, lo, mode);
                conns.lock().insert(token, Arc::new(Mutex::new(conn)));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                break;
            }
        }
    }
}

/// Invokes whichever of `readable`/`writable`/`hangup` the event reports,
/// marking the connection dead on any fatal error. Readable and writable may
/// both fire for the same event (edge-triggered readiness can report
/// read-and-write readiness together); a kernel-reported error is handled
/// before either, since it means no read/write will ever succeed. The
/// readiness bits are extracted by the caller (not passed as a borrowed
/// `mio::event::Event`) so the multithreaded reactor can move them into a
/// pool task that may run after the originating `Events` buffer is reused.
fn drive_connection(conn: &mut Connection, error: bool, readable: bool, writable: bool, storage: &dyn Storage, metrics: &Metrics) {
    if error {
        conn.hangup();
        return;
    }
    if readable {
        metrics.record_request_start();
        if conn.readable(storage).is_err() {
            metrics.record_error();
        }
    }
    if writable {
        if conn.writable().is_err() {
            metrics.record_error();
        }
    }
}

/// Builds storage, binds, and runs the reactor to completion. Installs a
/// `Ctrl+C` handler that flips the shutdown flag so `run` returns once the
/// in-flight `poll()` call times out.
pub fn run(config: ServerConfig, storage: Arc<dyn Storage>) -> anyhow::Result<()> {
    let server = Server::bind(config, storage)?;
    let shutdown = server.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    server.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;

    use hkv_engine::StripedCache;

    fn test_config(addr: &str, mode: ReactorMode) -> ServerConfig {
        ServerConfig {
            bind_addr: addr.to_string(),
            shard_count: 1,
            cache_bytes: hkv_engine::PER_SHARD_FLOOR,
            reactor_mode: mode,
            pool_low_watermark: 1,
            pool_high_watermark: 4,
            pool_idle_time_ms: 200,
            pool_max_queue_size: 64,
            output_high_watermark: 100,
            output_low_watermark: 20,
            log_filter: "off".to_string(),
        }
    }

    fn run_roundtrip(mode: ReactorMode) {
        let storage: Arc<dyn Storage> = Arc::new(StripedCache::new(1, hkv_engine::PER_SHARD_FLOOR).unwrap());
        let server = Server::bind(test_config("127.0.0.1:0", mode), storage).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_flag();

        let handle = thread::spawn(move || server.run());

        thread::sleep(Duration::from_millis(50));
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.write_all(b"set a 1\r\nx\r\n").unwrap();
        stream.write_all(b"get a\r\n").unwrap();

        let mut buf = [0u8; 256];
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut collected = Vec::new();
        while collected.len() < b"STORED\r\nVALUE a 0 1\r\nx\r\nEND\r\n".len() {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }

        assert_eq!(collected, b"STORED\r\nVALUE a 0 1\r\nx\r\nEND\r\n");

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn single_threaded_roundtrip() {
        run_roundtrip(ReactorMode::SingleThreaded);
    }

    #[test]
    fn multithreaded_roundtrip() {
        run_roundtrip(ReactorMode::Multithreaded);
    }
}
