//! Readiness multiplexer
//!
//! A [`Multiplex`] owns one kernel notification instance (epoll on Linux,
//! kqueue on macOS/BSD) and exposes the same three operations on both:
//! register, narrow back to read-only, and wait for a batch of events.
//!
//! One reactor thread owns a `Multiplex` and loops on [`wait`](Multiplex::wait).
//! Registration calls are single syscalls that the kernel serializes, so
//! other threads may register their own sockets concurrently.
//!
//! Delivery is edge-triggered: after an event, keep reading (or writing)
//! until the call returns `WouldBlock`, otherwise the next edge never comes.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use plexio_core::error::{NetError, Result};
use plexio_core::fdcount::FdCounter;

use crate::event::{Events, Interest, Token};
use crate::sys;

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub(crate) mod epoll;
        pub(crate) use epoll as backend;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))] {
        pub(crate) mod kqueue;
        pub(crate) use kqueue as backend;
    } else {
        compile_error!("plexio: no readiness backend for this platform");
    }
}

/// Handle to one epoll/kqueue instance.
#[derive(Debug)]
pub struct Multiplex {
    fd: RawFd,
    counter: Option<Arc<FdCounter>>,
}

impl Multiplex {
    /// Allocate the kernel notification instance.
    pub fn new() -> Result<Self> {
        let fd = backend::create().map_err(|e| {
            tracing::debug!(errno = %e, "multiplex init failed");
            NetError::MultiplexInitFailed(e)
        })?;
        tracing::trace!(fd, "multiplex created");
        Ok(Self { fd, counter: None })
    }

    /// Count this instance's descriptor against `counter` until `close`.
    pub fn track(mut self, counter: &Arc<FdCounter>) -> Self {
        counter.opened(1);
        self.counter = Some(Arc::clone(counter));
        self
    }

    /// Subscribe `source` for readiness, tagged with `token`.
    ///
    /// Registering a descriptor that is already registered updates its
    /// interest and token in place; the last call wins.
    pub fn register<S: AsRawFd + ?Sized>(&self, source: &S, interest: Interest, token: Token) -> Result<()> {
        let fd = source.as_raw_fd();
        backend::register(self.fd, fd, interest, token).map_err(|e| {
            tracing::debug!(fd, token = token.0, errno = %e, "register failed");
            NetError::RegisterFailed(e)
        })
    }

    /// Stop delivering write edges for `source`; read edges continue.
    ///
    /// Use once a socket's outgoing queue is fully flushed. A descriptor that
    /// is not registered with this instance is a no-op, not an error, and
    /// stays unregistered.
    pub fn unregister_write<S: AsRawFd + ?Sized>(&self, source: &S, token: Token) -> Result<()> {
        let fd = source.as_raw_fd();
        backend::unregister_write(self.fd, fd, token).map_err(|e| {
            tracing::debug!(fd, token = token.0, errno = %e, "unregister_write failed");
            NetError::RegisterFailed(e)
        })
    }

    /// Block until a registered descriptor is ready or `timeout_ms` elapses.
    ///
    /// `timeout_ms < 0` waits forever, `0` polls. At most `events.capacity()`
    /// records are written. Returns how many; `0` on timeout or when a
    /// signal interrupted the wait. Order within the batch is unspecified.
    pub fn wait(&self, events: &mut Events, timeout_ms: i64) -> Result<usize> {
        events.clear();
        let n = backend::wait(self.fd, events.slots_mut(), timeout_ms)
            .map_err(NetError::WaitFailed)?;
        events.set_len(n);
        Ok(n)
    }

    /// Release the kernel instance. Every registration against it goes too.
    ///
    /// The descriptor is gone even when this returns `CloseFailed`.
    pub fn close(self) -> Result<()> {
        let res = sys::close(self.fd);
        if let Some(counter) = &self.counter {
            counter.closed(1);
        }
        tracing::trace!(fd = self.fd, "multiplex closed");
        res.map_err(NetError::CloseFailed)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl AsRawFd for Multiplex {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use crate::pipe::Pipe;
    use crate::socket::SocketHandle;

    const LOOPBACK: [u8; 4] = [127, 0, 0, 1];
    const ANY: [u8; 4] = [0, 0, 0, 0];

    /// Wait up to `rounds` times for an event on `fd` matching `pred`.
    fn wait_for(
        mplex: &Multiplex,
        events: &mut Events,
        fd: RawFd,
        rounds: usize,
        pred: impl Fn(&crate::event::Event) -> bool,
    ) -> bool {
        for _ in 0..rounds {
            mplex.wait(events, 1000).unwrap();
            if events.iter().any(|ev| ev.socket() == fd && pred(ev)) {
                return true;
            }
        }
        false
    }

    /// Listener, connected client, and the accepted server side.
    fn connected_pair(mplex: &Multiplex, events: &mut Events) -> (SocketHandle, SocketHandle, SocketHandle) {
        let (listener, port) = SocketHandle::listen(ANY, 0, 16).unwrap();
        mplex.register(&listener, Interest::Read, Token(0)).unwrap();
        let client = SocketHandle::connect(LOOPBACK, port).unwrap();

        assert!(
            wait_for(mplex, events, listener.fd(), 10, |ev| ev.is_read() && ev.tag() == Token(0)),
            "listener never became readable"
        );
        let server = listener.accept().unwrap();
        (listener, client, server)
    }

    #[test]
    fn test_poll_empty_times_out() {
        let mplex = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(mplex.wait(&mut events, 0).unwrap(), 0);
        assert_eq!(mplex.wait(&mut events, 20).unwrap(), 0);
        assert!(events.is_empty());
        mplex.close().unwrap();
    }

    #[test]
    fn test_failed_close_still_releases_count() {
        let counter = FdCounter::new();
        let mplex = Multiplex::new().unwrap().track(&counter);
        sys::close(mplex.fd()).unwrap();

        assert_eq!(mplex.close(), Err(NetError::CloseFailed(nix::errno::Errno::EBADF)));
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_listen_connect_accept_and_read() {
        let counter = FdCounter::new();
        let mplex = Multiplex::new().unwrap().track(&counter);
        let mut events = Events::with_capacity(16);

        let (listener, port) = SocketHandle::listen(ANY, 0, 1).unwrap();
        let listener = listener.track(&counter);
        assert_ne!(port, 0);
        mplex.register(&listener, Interest::Read, Token(1)).unwrap();

        let client = SocketHandle::connect(LOOPBACK, port).unwrap().track(&counter);

        assert!(wait_for(&mplex, &mut events, listener.fd(), 10, |ev| {
            ev.tag() == Token(1) && ev.is_read()
        }));
        let server = listener.accept().unwrap();
        mplex.register(&server, Interest::Read, Token(2)).unwrap();

        let payload = b"hello, reactor";
        assert_eq!(client.send(payload).unwrap(), payload.len());

        assert!(wait_for(&mplex, &mut events, server.fd(), 10, |ev| {
            ev.tag() == Token(2) && ev.is_read()
        }));
        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], payload);
        assert_eq!(server.recv(&mut buf), Err(NetError::WouldBlock));

        assert_eq!(counter.current(), 4);
        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mplex.close().unwrap();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_read_then_write_merges_into_read_write() {
        let mplex = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (listener, client, server) = connected_pair(&mplex, &mut events);

        // Both conditions hold before the wait: data is queued on the server
        // side, and an idle socket is writable.
        client.send(b"x").unwrap();
        let mut peek = [0u8; 1];
        for _ in 0..100 {
            let n = unsafe {
                libc::recv(server.fd(), peek.as_mut_ptr() as *mut libc::c_void, 1, libc::MSG_PEEK)
            };
            if n == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        mplex.register(&server, Interest::Read, Token(7)).unwrap();
        mplex.register(&server, Interest::Write, Token(7)).unwrap();

        // One wait must report both directions for the socket.
        mplex.wait(&mut events, 1000).unwrap();
        let mine: Vec<_> = events.iter().filter(|ev| ev.socket() == server.fd()).collect();
        assert!(!mine.is_empty());
        assert!(mine.iter().all(|ev| ev.tag() == Token(7)));
        assert!(mine.iter().any(|ev| ev.is_read()), "{:?}", mine);
        assert!(mine.iter().any(|ev| ev.is_write()), "{:?}", mine);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        assert_eq!(mine.len(), 1, "epoll merges both directions into one record");

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mplex.close().unwrap();
    }

    #[test]
    fn test_unregister_write_keeps_read() {
        let mplex = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (listener, client, server) = connected_pair(&mplex, &mut events);

        mplex.register(&server, Interest::ReadWrite, Token(3)).unwrap();
        assert!(wait_for(&mplex, &mut events, server.fd(), 10, |ev| ev.is_write()));

        mplex.unregister_write(&server, Token(3)).unwrap();
        mplex.wait(&mut events, 100).unwrap();
        assert!(!events.iter().any(|ev| ev.socket() == server.fd() && ev.is_write()));

        client.send(b"ping").unwrap();
        let mut saw_read = false;
        for _ in 0..10 {
            mplex.wait(&mut events, 1000).unwrap();
            for ev in events.iter().filter(|ev| ev.socket() == server.fd()) {
                assert!(!ev.is_write(), "write edge after unregister_write");
                saw_read |= ev.is_read();
            }
            if saw_read {
                break;
            }
        }
        assert!(saw_read);

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mplex.close().unwrap();
    }

    #[test]
    fn test_unregister_write_on_unregistered_is_noop() {
        let mplex = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (listener, client, server) = connected_pair(&mplex, &mut events);

        mplex.unregister_write(&server, Token(9)).unwrap();

        // Still not registered: data arriving produces no event for it.
        client.send(b"z").unwrap();
        mplex.wait(&mut events, 100).unwrap();
        assert!(!events.iter().any(|ev| ev.socket() == server.fd()));

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mplex.close().unwrap();
    }

    #[test]
    fn test_edge_is_not_redelivered_until_drained() {
        let mplex = Multiplex::new().unwrap();
        let mut events = Events::with_capacity(16);
        let (listener, client, server) = connected_pair(&mplex, &mut events);

        mplex.register(&server, Interest::Read, Token(5)).unwrap();
        client.send(b"abc").unwrap();
        assert!(wait_for(&mplex, &mut events, server.fd(), 10, |ev| ev.is_read()));

        // Not drained: the same edge must not fire again.
        mplex.wait(&mut events, 50).unwrap();
        assert!(!events.iter().any(|ev| ev.socket() == server.fd()));

        assert_eq!(server.drain().unwrap(), 3);
        client.send(b"d").unwrap();
        assert!(wait_for(&mplex, &mut events, server.fd(), 10, |ev| ev.is_read()));

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        mplex.close().unwrap();
    }

    #[test]
    fn test_wake_pipe_interrupts_wait() {
        let mplex = Multiplex::new().unwrap();
        let pipe = std::sync::Arc::new(Pipe::open().unwrap());
        mplex.register(&*pipe, Interest::Read, Token(u32::MAX)).unwrap();

        let waker = std::sync::Arc::clone(&pipe);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            waker.wake().unwrap();
        });

        let mut events = Events::with_capacity(4);
        let n = mplex.wait(&mut events, 5000).unwrap();
        assert_eq!(n, 1);
        let ev = events.get(0).unwrap();
        assert_eq!(ev.tag(), Token(u32::MAX));
        assert_eq!(ev.socket(), pipe.as_raw_fd());
        assert!(ev.is_read());
        handle.join().unwrap();

        assert_eq!(pipe.drain().unwrap(), 1);
        let pipe = std::sync::Arc::try_unwrap(pipe).unwrap();
        pipe.close().unwrap();
        mplex.close().unwrap();
    }
}
