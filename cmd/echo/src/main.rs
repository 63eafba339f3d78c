//! plexio Echo Server
//!
//! Single reactor thread, edge-triggered epoll (Linux) or kqueue (macOS/BSD).
//! Everything a reactor built on plexio needs shows up here once: listener
//! and accept loop, per-connection tokens, partial writes parked behind
//! write interest, and a control thread that talks to the reactor through
//! a `Channel` plus the wake pipe.
//!
//! Usage:
//!     cargo build --release -p plexio-echo
//!     ./target/release/plexio-echo [port] [max_conns]
//!
//! Control (stdin): `stats` prints counters, `quit` shuts down. SIGINT and
//! SIGTERM shut down too.
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done
//!
//! Environment: `PLEXIO_MAX_EVENTS`, `PLEXIO_WAIT_TIMEOUT_MS`,
//! `PLEXIO_BACKLOG`, `PLEXIO_READ_CHUNK`, `PLEXIO_TRACK_FDS`, `RUST_LOG`.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use plexio::{
    channel, EventRecord, Events, FdCounter, Interest, Multiplex, NetError, Pipe,
    ReactorConfig, Receiver, SocketHandle, Token,
};
use tracing_subscriber::EnvFilter;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Connection slot `i` is registered as `Token(FIRST_CONN + i)`.
const FIRST_CONN: u32 = 2;

/// Stop reading from a connection once this much echo data is unsent.
const MAX_PENDING: usize = 1 << 20;
const STATS_INTERVAL: Duration = Duration::from_secs(5);
/// Wait bound while connections sit in the backlog after a failed accept.
const ACCEPT_RETRY_MS: i64 = 100;

fn conn_token(idx: usize) -> Token {
    Token(FIRST_CONN + idx as u32)
}

// ── Per-connection state ──

struct Conn {
    sock: SocketHandle,
    /// Echo bytes not yet accepted by the kernel
    out: Vec<u8>,
    /// Write interest is currently registered
    writing: bool,
    /// Reading paused because `out` hit `MAX_PENDING`
    read_paused: bool,
}

struct ConnSlab {
    slots: Vec<Option<Conn>>,
    free: Vec<usize>,
}

impl ConnSlab {
    fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            free: (0..max).rev().collect(),
        }
    }

    /// Hands the socket back when the table is full.
    fn alloc(&mut self, sock: SocketHandle) -> Result<usize, SocketHandle> {
        let Some(idx) = self.free.pop() else {
            return Err(sock);
        };
        self.slots[idx] = Some(Conn { sock, out: Vec::new(), writing: false, read_paused: false });
        Ok(idx)
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut Conn> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn remove(&mut self, idx: usize) -> Option<Conn> {
        let conn = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(conn)
    }

    fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn drain(&mut self) -> impl Iterator<Item = Conn> + '_ {
        self.free.clear();
        self.slots.iter_mut().filter_map(Option::take)
    }
}

// ── Stats ──

#[derive(Default)]
struct Stats {
    accepts: u64,
    rejects: u64,
    closes: u64,
    bytes_in: u64,
    bytes_out: u64,
    errors: u64,
}

impl Stats {
    fn log(&self, conns: &ConnSlab, elapsed: Duration) {
        tracing::info!(
            elapsed_s = elapsed.as_secs_f64(),
            conns = conns.active(),
            accepts = self.accepts,
            rejects = self.rejects,
            closes = self.closes,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            errors = self.errors,
            "stats"
        );
    }
}

// ── Control plane ──

#[derive(Debug)]
enum Control {
    Stats,
    Shutdown,
}

/// Reads stdin commands and forwards them to the reactor.
fn spawn_control(tx: plexio::Sender<Control>, waker: Arc<Pipe>) {
    let spawned = std::thread::Builder::new()
        .name("echo-control".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let cmd = match line.trim() {
                    "stats" => Control::Stats,
                    "quit" | "exit" => Control::Shutdown,
                    "" => continue,
                    other => {
                        tracing::warn!(command = other, "unknown command (try `stats` or `quit`)");
                        continue;
                    }
                };
                let last = matches!(cmd, Control::Shutdown);
                tx.send(cmd);
                if let Err(e) = waker.wake() {
                    tracing::warn!(error = %e, "wake failed");
                }
                if last {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "control thread not started; stdin commands disabled");
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// ── Reactor ──

enum Next {
    Keep,
    Close,
}

struct Reactor {
    config: ReactorConfig,
    mplex: Multiplex,
    listener: SocketHandle,
    waker: Arc<Pipe>,
    control: Receiver<Control>,
    conns: ConnSlab,
    stats: Stats,
    scratch: Vec<u8>,
    /// The listener edge was spent on a failed accept; connections may still
    /// be queued with no further edge coming.
    accept_pending: bool,
}

impl Reactor {
    fn new(
        config: ReactorConfig,
        mplex: Multiplex,
        listener: SocketHandle,
        waker: Arc<Pipe>,
        control: Receiver<Control>,
        max_conns: usize,
    ) -> Self {
        let scratch = vec![0u8; config.read_chunk];
        Self {
            config,
            mplex,
            listener,
            waker,
            control,
            conns: ConnSlab::new(max_conns),
            stats: Stats::default(),
            scratch,
            accept_pending: false,
        }
    }

    fn accept_all(&mut self) {
        self.accept_pending = false;
        loop {
            let sock = match self.listener.accept() {
                Ok(sock) => sock,
                Err(NetError::WouldBlock) => return,
                Err(e) => {
                    // Transient (EMFILE, ECONNABORTED): keep serving what we
                    // have and try the backlog again on the next loop turn.
                    tracing::warn!(error = %e, "accept failed");
                    self.stats.errors += 1;
                    self.accept_pending = true;
                    return;
                }
            };
            self.stats.accepts += 1;

            let idx = match self.conns.alloc(sock) {
                Ok(idx) => idx,
                Err(sock) => {
                    tracing::debug!(fd = sock.fd(), "connection table full, rejecting");
                    self.stats.rejects += 1;
                    let _ = sock.close();
                    continue;
                }
            };
            let Some(conn) = self.conns.get_mut(idx) else { continue };
            if let Err(e) = self.mplex.register(&conn.sock, Interest::Read, conn_token(idx)) {
                tracing::warn!(error = %e, "register failed");
                self.stats.errors += 1;
                self.close_conn(idx);
                continue;
            }
            // Data may have arrived before registration; the edge is not replayed.
            self.on_readable(idx);
        }
    }

    fn on_event(&mut self, idx: usize, fd: i32, readable: bool, writable: bool) {
        match self.conns.get_mut(idx) {
            Some(conn) if conn.sock.fd() == fd => {}
            // Slot freed earlier in this batch.
            _ => return,
        }
        if writable {
            self.on_writable(idx);
        }
        if readable {
            self.on_readable(idx);
        }
    }

    fn on_readable(&mut self, idx: usize) {
        let next = self.read_until_blocked(idx);
        self.finish(idx, next);
    }

    fn on_writable(&mut self, idx: usize) {
        let next = self.flush(idx);
        let resume = matches!(next, Next::Keep)
            && self.conns.get_mut(idx).is_some_and(|c| c.read_paused && c.out.is_empty());
        self.finish(idx, next);
        if resume {
            if let Some(conn) = self.conns.get_mut(idx) {
                conn.read_paused = false;
            }
            self.on_readable(idx);
        }
    }

    fn read_until_blocked(&mut self, idx: usize) -> Next {
        loop {
            let Some(conn) = self.conns.get_mut(idx) else { return Next::Keep };
            if conn.out.len() >= MAX_PENDING {
                conn.read_paused = true;
                return Next::Keep;
            }
            match conn.sock.recv(&mut self.scratch) {
                Ok(0) => return Next::Close,
                Ok(n) => {
                    self.stats.bytes_in += n as u64;
                    conn.out.extend_from_slice(&self.scratch[..n]);
                    if let Next::Close = self.flush(idx) {
                        return Next::Close;
                    }
                }
                Err(NetError::WouldBlock) => return Next::Keep,
                Err(e) => {
                    tracing::debug!(token = conn_token(idx).0, error = %e, "recv failed");
                    self.stats.errors += 1;
                    return Next::Close;
                }
            }
        }
    }

    /// Push `out` to the kernel; park behind write interest on a short write.
    fn flush(&mut self, idx: usize) -> Next {
        let Some(conn) = self.conns.get_mut(idx) else { return Next::Keep };
        let token = conn_token(idx);
        while !conn.out.is_empty() {
            match conn.sock.send(&conn.out) {
                Ok(n) => {
                    self.stats.bytes_out += n as u64;
                    conn.out.drain(..n);
                }
                Err(NetError::WouldBlock) => {
                    if !conn.writing {
                        if let Err(e) = self.mplex.register(&conn.sock, Interest::ReadWrite, token) {
                            tracing::warn!(token = token.0, error = %e, "register write failed");
                            self.stats.errors += 1;
                            return Next::Close;
                        }
                        conn.writing = true;
                    }
                    return Next::Keep;
                }
                Err(e) => {
                    tracing::debug!(token = token.0, error = %e, "send failed");
                    self.stats.errors += 1;
                    return Next::Close;
                }
            }
        }
        if conn.writing {
            if let Err(e) = self.mplex.unregister_write(&conn.sock, token) {
                tracing::warn!(token = token.0, error = %e, "unregister_write failed");
                self.stats.errors += 1;
                return Next::Close;
            }
            conn.writing = false;
        }
        Next::Keep
    }

    fn finish(&mut self, idx: usize, next: Next) {
        if let Next::Close = next {
            self.close_conn(idx);
        }
    }

    fn close_conn(&mut self, idx: usize) {
        let Some(conn) = self.conns.remove(idx) else { return };
        self.stats.closes += 1;
        // Closing the descriptor also drops its multiplex registration.
        if let Err(e) = conn.sock.close() {
            tracing::warn!(token = conn_token(idx).0, error = %e, "close failed");
        }
    }

    /// Returns false once shutdown was requested.
    fn on_control(&mut self, start: Instant) -> bool {
        if let Err(e) = self.waker.drain() {
            tracing::warn!(error = %e, "wake pipe drain failed");
        }
        let mut keep_running = true;
        while let Some(cmd) = self.control.try_recv() {
            tracing::debug!(?cmd, "control");
            match cmd {
                Control::Stats => self.stats.log(&self.conns, start.elapsed()),
                Control::Shutdown => keep_running = false,
            }
        }
        keep_running
    }

    fn wait_timeout(&self) -> i64 {
        match self.config.wait_timeout_ms {
            ms if !self.accept_pending => ms,
            ms if ms < 0 => ACCEPT_RETRY_MS,
            ms => ms.min(ACCEPT_RETRY_MS),
        }
    }

    /// One wait and dispatch. Returns false once shutdown was requested.
    fn poll_once(&mut self, events: &mut Events, start: Instant) -> plexio::Result<bool> {
        // Ok(0) covers both the timeout and a signal.
        self.mplex.wait(events, self.wait_timeout())?;

        if self.accept_pending {
            self.accept_all();
        }

        let mut keep_running = true;
        for ev in events.iter() {
            let token = ev.tag();
            if token == LISTENER {
                self.accept_all();
            } else if token == WAKER {
                keep_running &= self.on_control(start);
            } else {
                let idx = (token.0 - FIRST_CONN) as usize;
                self.on_event(idx, ev.socket(), ev.is_read(), ev.is_write());
            }
        }
        Ok(keep_running)
    }

    fn run(&mut self) -> plexio::Result<()> {
        let mut events = Events::with_capacity(self.config.max_events);
        let start = Instant::now();
        let mut last_stats = start;

        while RUNNING.load(Ordering::Relaxed) {
            if !self.poll_once(&mut events, start)? {
                break;
            }

            let now = Instant::now();
            if now.duration_since(last_stats) >= STATS_INTERVAL {
                self.stats.log(&self.conns, now.duration_since(start));
                last_stats = now;
            }
        }

        tracing::info!("shutting down");
        self.stats.log(&self.conns, start.elapsed());
        Ok(())
    }

    fn shutdown(mut self, counter: Option<Arc<FdCounter>>) {
        for conn in self.conns.drain() {
            let _ = conn.sock.close();
        }
        if let Err(e) = self.listener.close() {
            tracing::warn!(error = %e, "listener close failed");
        }
        if let Err(e) = self.mplex.close() {
            tracing::warn!(error = %e, "multiplex close failed");
        }
        // The control thread may still hold the pipe while blocked on stdin.
        match Arc::try_unwrap(self.waker) {
            Ok(pipe) => {
                let _ = pipe.close();
            }
            Err(_) => tracing::debug!("wake pipe still shared, leaving it to process exit"),
        }
        if let Some(counter) = counter {
            let open = counter.current();
            if open == 0 {
                tracing::info!("all tracked descriptors closed");
            } else {
                tracing::warn!(open, "tracked descriptors still open");
            }
        }
    }
}

fn run(port: u16, max_conns: usize, config: ReactorConfig) -> plexio::Result<()> {
    let counter = config.track_fds.then(FdCounter::new);

    let mut mplex = Multiplex::new()?;
    let (mut listener, bound) = SocketHandle::listen([0, 0, 0, 0], port, config.backlog)?;
    let mut waker = Pipe::open()?;
    // Accepted sockets inherit the listener's counter.
    if let Some(c) = &counter {
        mplex = mplex.track(c);
        listener = listener.track(c);
        waker = waker.track(c);
    }
    mplex.register(&listener, Interest::Read, LISTENER)?;
    mplex.register(&waker, Interest::Read, WAKER)?;

    let waker = Arc::new(waker);
    let (tx, rx) = channel::<Control>();
    spawn_control(tx, Arc::clone(&waker));

    tracing::info!(port = bound, max_conns, max_events = config.max_events, "listening on 0.0.0.0");

    let mut reactor = Reactor::new(config, mplex, listener, waker, rx, max_conns);
    let result = reactor.run();
    reactor.shutdown(counter);
    result
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);
    let max_conns = max_conns.min((u32::MAX - FIRST_CONN) as usize);

    let config = ReactorConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "bad configuration");
        std::process::exit(2);
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    if let Err(e) = run(port, max_conns, config) {
        tracing::error!(error = %e, "echo server failed");
        std::process::exit(1);
    }
    tracing::info!("done");
}
