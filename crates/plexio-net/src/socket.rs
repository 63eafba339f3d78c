//! # Non-blocking TCP socket handle
//!
//! `SocketHandle` is a thin owner of one IPv4 stream descriptor. Every
//! descriptor it produces (`connect`, `listen`, `accept`) is non-blocking
//! from the moment it exists, and stays that way.
//!
//! ```ignore
//! let (listener, port) = SocketHandle::listen([0, 0, 0, 0], 0, 128)?;
//! mplex.register(&listener, Interest::Read, Token(0))?;
//! // ... on a read event for Token(0):
//! loop {
//!     match listener.accept() {
//!         Ok(conn) => { /* register conn */ }
//!         Err(NetError::WouldBlock) => break, // wait for the next edge
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```
//!
//! ## Ownership
//!
//! There is no close-on-drop. The descriptor is released exactly once by
//! [`close`](SocketHandle::close), which consumes the handle. Dropping a
//! handle without closing it leaks the descriptor; attach an
//! [`FdCounter`] in tests to catch that.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use plexio_core::error::{NetError, Result};
use plexio_core::fdcount::FdCounter;

use crate::sys;

/// Owner of one non-blocking TCP descriptor.
#[derive(Debug)]
pub struct SocketHandle {
    fd: RawFd,
    counter: Option<Arc<FdCounter>>,
}

impl SocketHandle {
    /// Wrap a descriptor recovered elsewhere, e.g. from `Event::socket()`.
    ///
    /// The caller decides which wrapper, if any, will eventually `close` it.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd, counter: None }
    }

    /// Count this descriptor against `counter` until `close`.
    pub fn track(mut self, counter: &Arc<FdCounter>) -> Self {
        counter.opened(1);
        self.counter = Some(Arc::clone(counter));
        self
    }

    /// Start connecting to `addr:port` without waiting for the handshake.
    ///
    /// Success means the attempt is under way. Completion or refusal shows up
    /// later as write readiness on a multiplexer; a refused connection then
    /// reads as end-of-stream or an error. Only a synchronous refusal is
    /// reported here, as `ConnectFailed`.
    pub fn connect(addr: [u8; 4], port: u16) -> Result<Self> {
        let fd = sys::stream_socket()?;
        let sa = sys::sockaddr_v4(addr, port);
        let ret = unsafe {
            libc::connect(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        match Errno::result(ret) {
            Ok(_) | Err(Errno::EINPROGRESS) | Err(Errno::EINTR) => Ok(Self { fd, counter: None }),
            Err(e) => {
                let _ = sys::close(fd);
                tracing::debug!(?addr, port, errno = %e, "connect failed");
                Err(NetError::ConnectFailed(e))
            }
        }
    }

    /// Create a listening socket on `addr:port` and return it with the bound port.
    ///
    /// Address and port reuse are enabled so a restart does not trip over
    /// sockets in TIME_WAIT. Port `0` asks the kernel for an ephemeral port,
    /// which is what gets returned.
    pub fn listen(addr: [u8; 4], port: u16, backlog: i32) -> Result<(Self, u16)> {
        let fd = sys::stream_socket()?;
        match configure_listener(fd, addr, port, backlog) {
            Ok(bound) => {
                tracing::debug!(fd, ?addr, port = bound, backlog, "listening");
                Ok((Self { fd, counter: None }, bound))
            }
            Err(e) => {
                let _ = sys::close(fd);
                tracing::debug!(?addr, port, error = %e, "listen setup failed");
                Err(e)
            }
        }
    }

    /// Take one pending connection.
    ///
    /// `WouldBlock` means the backlog is empty: go back to waiting on the
    /// listener's read readiness. The new socket is already non-blocking and
    /// inherits this listener's descriptor counter, if any.
    pub fn accept(&self) -> Result<SocketHandle> {
        let fd = match sys::accept(self.fd) {
            Ok(fd) => fd,
            Err(NetError::WouldBlock) => return Err(NetError::WouldBlock),
            Err(e) => {
                tracing::debug!(listener = self.fd, error = %e, "accept failed");
                return Err(e);
            }
        };
        let accepted = Self { fd, counter: None };
        Ok(match &self.counter {
            Some(counter) => accepted.track(counter),
            None => accepted,
        })
    }

    /// Write what the socket will take right now.
    ///
    /// Returns the number of bytes written, which may be short.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        loop {
            let ret = unsafe {
                libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), sys::SEND_FLAGS)
            };
            match Errno::result(ret) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(NetError::WouldBlock),
                Err(e) => return Err(NetError::SendFailed(e)),
            }
        }
    }

    /// Read what is available right now.
    ///
    /// `Ok(0)` means the peer closed its side; `WouldBlock` means nothing is
    /// buffered yet.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let ret = unsafe {
                libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            match Errno::result(ret) {
                Ok(n) => return Ok(n as usize),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(NetError::WouldBlock),
                Err(e) => return Err(NetError::RecvFailed(e)),
            }
        }
    }

    /// Discard everything currently readable. Returns the byte count.
    pub fn drain(&self) -> Result<usize> {
        sys::drain(self.fd)
    }

    /// Shut down both directions. The descriptor stays open until `close`.
    pub fn shutdown(&self) -> Result<()> {
        Errno::result(unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) })
            .map(drop)
            .map_err(NetError::ShutdownFailed)
    }

    /// Release the descriptor.
    ///
    /// The descriptor is gone even when this returns `CloseFailed`; do not
    /// retry.
    pub fn close(self) -> Result<()> {
        let res = sys::close(self.fd);
        if let Some(counter) = &self.counter {
            counter.closed(1);
        }
        res.map_err(NetError::CloseFailed)
    }

    /// Port this socket is bound to.
    pub fn local_port(&self) -> Result<u16> {
        sys::local_port(self.fd).map_err(NetError::ResolveBoundAddressFailed)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

fn configure_listener(fd: RawFd, addr: [u8; 4], port: u16, backlog: i32) -> Result<u16> {
    sys::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
        .map_err(NetError::SetSockOptFailed)?;
    sys::set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
        .map_err(NetError::SetSockOptFailed)?;

    let sa = sys::sockaddr_v4(addr, port);
    Errno::result(unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
    .map_err(NetError::BindFailed)?;

    Errno::result(unsafe { libc::listen(fd, backlog) }).map_err(NetError::ListenFailed)?;

    if port != 0 {
        return Ok(port);
    }
    sys::local_port(fd).map_err(NetError::ResolveBoundAddressFailed)
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Two handles are equal when they own the same descriptor.
impl PartialEq for SocketHandle {
    fn eq(&self, other: &Self) -> bool {
        self.fd == other.fd
    }
}

impl Eq for SocketHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const LOOPBACK: [u8; 4] = [127, 0, 0, 1];

    /// Spin on a non-blocking call until it stops saying WouldBlock.
    fn retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
        for _ in 0..500 {
            match f() {
                Err(NetError::WouldBlock) => thread::sleep(Duration::from_millis(2)),
                other => return other,
            }
        }
        Err(NetError::WouldBlock)
    }

    #[test]
    fn test_listen_ephemeral_port() {
        let (listener, port) = SocketHandle::listen([0, 0, 0, 0], 0, 8).unwrap();
        assert_ne!(port, 0);
        assert_eq!(listener.local_port().unwrap(), port);
        listener.close().unwrap();
    }

    #[test]
    fn test_accept_empty_backlog_would_block() {
        let (listener, _port) = SocketHandle::listen(LOOPBACK, 0, 8).unwrap();
        assert_eq!(listener.accept(), Err(NetError::WouldBlock));
        listener.close().unwrap();
    }

    #[test]
    fn test_accepted_socket_is_non_blocking() {
        let (listener, port) = SocketHandle::listen(LOOPBACK, 0, 8).unwrap();
        let client = SocketHandle::connect(LOOPBACK, port).unwrap();

        let server = retry(|| listener.accept()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.recv(&mut buf), Err(NetError::WouldBlock));
        assert_eq!(listener.accept(), Err(NetError::WouldBlock));

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_send_recv_and_peer_close() {
        let (listener, port) = SocketHandle::listen(LOOPBACK, 0, 8).unwrap();
        let client = SocketHandle::connect(LOOPBACK, port).unwrap();
        let server = retry(|| listener.accept()).unwrap();

        let sent = retry(|| client.send(b"0123456789")).unwrap();
        assert_eq!(sent, 10);

        let mut buf = [0u8; 32];
        let n = retry(|| server.recv(&mut buf)).unwrap();
        assert_eq!(&buf[..n], b"0123456789");

        client.shutdown().unwrap();
        // End-of-stream is Ok(0), not WouldBlock.
        assert_eq!(retry(|| server.recv(&mut buf)).unwrap(), 0);

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_drain_discards_backlog() {
        let (listener, port) = SocketHandle::listen(LOOPBACK, 0, 8).unwrap();
        let client = SocketHandle::connect(LOOPBACK, port).unwrap();
        let server = retry(|| listener.accept()).unwrap();

        let data = vec![0xAB; 3000];
        let sent = retry(|| client.send(&data)).unwrap();
        assert_eq!(sent, data.len());

        let mut drained = 0;
        for _ in 0..100 {
            drained += server.drain().unwrap();
            if drained == data.len() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(drained, data.len());

        let mut buf = [0u8; 8];
        assert_eq!(server.recv(&mut buf), Err(NetError::WouldBlock));

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Grab a free port, then close it so nothing listens there.
        let (listener, port) = SocketHandle::listen(LOOPBACK, 0, 1).unwrap();
        listener.close().unwrap();

        match SocketHandle::connect(LOOPBACK, port) {
            // Synchronous refusal.
            Err(NetError::ConnectFailed(e)) => assert_eq!(e, Errno::ECONNREFUSED),
            // Asynchronous refusal: surfaces on the first read.
            Ok(client) => {
                let mut buf = [0u8; 4];
                let res = retry(|| client.recv(&mut buf));
                assert!(matches!(res, Ok(0) | Err(NetError::RecvFailed(_))), "{:?}", res);
                client.close().unwrap();
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fd_counter_tracks_accepted() {
        let counter = FdCounter::new();
        let (listener, port) = SocketHandle::listen(LOOPBACK, 0, 8).unwrap();
        let listener = listener.track(&counter);
        let client = SocketHandle::connect(LOOPBACK, port).unwrap().track(&counter);
        let server = retry(|| listener.accept()).unwrap();
        assert_eq!(counter.current(), 3);

        server.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_failed_close_still_releases_count() {
        let counter = FdCounter::new();
        let (listener, _port) = SocketHandle::listen(LOOPBACK, 0, 1).unwrap();
        let listener = listener.track(&counter);

        // Release the descriptor behind the tracked handle's back.
        SocketHandle::from_raw_fd(listener.fd()).close().unwrap();

        assert_eq!(listener.close(), Err(NetError::CloseFailed(Errno::EBADF)));
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_bind_failure_is_stage_specific() {
        // TEST-NET-1 is never a local address.
        match SocketHandle::listen([192, 0, 2, 1], 0, 1) {
            Err(e) => assert_eq!(e, NetError::BindFailed(Errno::EADDRNOTAVAIL)),
            Ok((sock, _)) => panic!("bound to a non-local address: {:?}", sock),
        }
    }

    #[test]
    fn test_handle_equality_by_descriptor() {
        let (listener, _port) = SocketHandle::listen(LOOPBACK, 0, 1).unwrap();
        let alias = SocketHandle::from_raw_fd(listener.fd());
        assert_eq!(alias, listener);
        listener.close().unwrap();
    }
}
