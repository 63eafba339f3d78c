//! Raw syscall helpers shared by sockets, pipes and the multiplexer.
//!
//! Every libc return value goes through `Errno::result`, so callers see
//! `Result<_, Errno>` and map it onto the stage-specific `NetError`.

use std::mem;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use plexio_core::error::{NetError, Result};

/// Read chunk used when discarding a descriptor's backlog.
pub(crate) const DRAIN_CHUNK: usize = 512;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Peer-closed sockets report EPIPE instead of raising SIGPIPE.
        pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

        /// Stream socket created non-blocking and close-on-exec in one call.
        pub(crate) fn stream_socket() -> Result<RawFd> {
            Errno::result(unsafe {
                libc::socket(
                    libc::AF_INET,
                    libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    0,
                )
            })
            .map_err(NetError::SocketCreateFailed)
        }

        /// Accept with the new descriptor already non-blocking.
        pub(crate) fn accept(fd: RawFd) -> Result<RawFd> {
            loop {
                match Errno::result(unsafe {
                    libc::accept4(
                        fd,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                }) {
                    Ok(new_fd) => return Ok(new_fd),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(accept_error(e)),
                }
            }
        }

        pub(crate) fn pipe() -> std::result::Result<[RawFd; 2], Errno> {
            let mut fds = [-1; 2];
            Errno::result(unsafe {
                libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
            })?;
            Ok(fds)
        }
    } else {
        // No MSG_NOSIGNAL; sockets get SO_NOSIGPIPE at creation instead.
        pub(crate) const SEND_FLAGS: libc::c_int = 0;

        /// Stream socket switched to non-blocking before it is handed out.
        pub(crate) fn stream_socket() -> Result<RawFd> {
            let fd = Errno::result(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })
                .map_err(NetError::SocketCreateFailed)?;
            configure_new_socket(fd)?;
            Ok(fd)
        }

        /// Accept, then switch the new descriptor over before handing it out.
        ///
        /// A failed switch closes the descriptor and reports its own stage.
        pub(crate) fn accept(fd: RawFd) -> Result<RawFd> {
            let new_fd = loop {
                match Errno::result(unsafe {
                    libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut())
                }) {
                    Ok(new_fd) => break new_fd,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(accept_error(e)),
                }
            };
            configure_new_socket(new_fd)?;
            Ok(new_fd)
        }

        pub(crate) fn pipe() -> std::result::Result<[RawFd; 2], Errno> {
            let mut fds = [-1; 2];
            Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
            for &fd in &fds {
                if let Err(e) = set_nonblocking_cloexec(fd) {
                    let _ = close(fds[0]);
                    let _ = close(fds[1]);
                    return Err(e);
                }
            }
            Ok(fds)
        }

        /// One F_SETFL/F_SETFD pair on a descriptor nobody else has seen yet.
        fn set_nonblocking_cloexec(fd: RawFd) -> std::result::Result<(), Errno> {
            Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) })?;
            Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
            Ok(())
        }

        fn configure_new_socket(fd: RawFd) -> Result<()> {
            if let Err(e) = set_nonblocking_cloexec(fd) {
                let _ = close(fd);
                return Err(NetError::SetNonBlockingFailed(e));
            }
            if let Err(e) = set_int_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1) {
                let _ = close(fd);
                return Err(NetError::SetSockOptFailed(e));
            }
            Ok(())
        }
    }
}

/// An empty backlog is `WouldBlock`, anything else is the accept stage failing.
fn accept_error(e: Errno) -> NetError {
    if e == Errno::EAGAIN {
        NetError::WouldBlock
    } else {
        NetError::AcceptFailed(e)
    }
}

pub(crate) fn close(fd: RawFd) -> std::result::Result<(), Errno> {
    Errno::result(unsafe { libc::close(fd) }).map(drop)
}

pub(crate) fn set_int_opt(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::result::Result<(), Errno> {
    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

/// IPv4 socket address in network byte order.
pub(crate) fn sockaddr_v4(addr: [u8; 4], port: u16) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        sa.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    // `addr` is already in network order, byte for byte.
    sa.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr) };
    sa
}

/// Port the kernel actually bound `fd` to.
pub(crate) fn local_port(fd: RawFd) -> std::result::Result<u16, Errno> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    Errno::result(unsafe {
        libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    Ok(u16::from_be(sa.sin_port))
}

/// `read(2)` retried on EINTR. Works on sockets and pipes alike.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
    loop {
        match Errno::result(unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        }) {
            Ok(n) => return Ok(n as usize),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// `write(2)` retried on EINTR.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> std::result::Result<usize, Errno> {
    loop {
        match Errno::result(unsafe {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
        }) {
            Ok(n) => return Ok(n as usize),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read and discard until the descriptor would block or hits end-of-stream.
///
/// Returns the number of bytes thrown away.
pub(crate) fn drain(fd: RawFd) -> Result<usize> {
    let mut buf = [0u8; DRAIN_CHUNK];
    let mut total = 0;
    loop {
        match read(fd, &mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(Errno::EAGAIN) => return Ok(total),
            Err(e) => return Err(NetError::RecvFailed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_error_mapping() {
        assert_eq!(accept_error(Errno::EAGAIN), NetError::WouldBlock);
        assert_eq!(accept_error(Errno::EMFILE), NetError::AcceptFailed(Errno::EMFILE));
    }

    #[test]
    fn test_accept_on_non_listener_is_accept_stage() {
        let fd = stream_socket().unwrap();
        assert_eq!(accept(fd), Err(NetError::AcceptFailed(Errno::EINVAL)));
        close(fd).unwrap();
    }
}
