//! kqueue backend (macOS, iOS, FreeBSD, OpenBSD, DragonFly).
//!
//! Read and write interest are separate filters keyed by `(ident, filter)`.
//! `EV_ADD` on an existing filter updates it in place, so re-registration
//! never duplicates. `EV_CLEAR` gives edge-triggered delivery.

use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use nix::errno::Errno;

use crate::event::{Event, EventRecord, Interest, Token};

pub(crate) type RawEvent = libc::kevent;

fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    let mut kev: libc::kevent = unsafe { mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = filter;
    kev.flags = flags;
    kev.udata = token.0 as usize as *mut libc::c_void;
    kev
}

fn apply(kq: RawFd, changes: &[libc::kevent]) -> Result<(), Errno> {
    Errno::result(unsafe {
        libc::kevent(
            kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        )
    })
    .map(drop)
}

/// Remove the write filter; a filter that was never added is not an error.
fn delete_write(kq: RawFd, fd: RawFd) -> Result<(), Errno> {
    match apply(kq, &[change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, Token(0))]) {
        Err(Errno::ENOENT) => Ok(()),
        other => other,
    }
}

pub(crate) fn empty_event() -> RawEvent {
    unsafe { mem::zeroed() }
}

pub(crate) fn create() -> Result<RawFd, Errno> {
    let kq = Errno::result(unsafe { libc::kqueue() })?;
    if let Err(e) = Errno::result(unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) }) {
        unsafe { libc::close(kq) };
        return Err(e);
    }
    Ok(kq)
}

pub(crate) fn register(kq: RawFd, fd: RawFd, interest: Interest, token: Token) -> Result<(), Errno> {
    let flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
    if interest.wants_write() {
        apply(
            kq,
            &[
                change(fd, libc::EVFILT_READ, flags, token),
                change(fd, libc::EVFILT_WRITE, flags, token),
            ],
        )
    } else {
        apply(kq, &[change(fd, libc::EVFILT_READ, flags, token)])?;
        delete_write(kq, fd)
    }
}

pub(crate) fn unregister_write(kq: RawFd, fd: RawFd, _token: Token) -> Result<(), Errno> {
    delete_write(kq, fd)
}

pub(crate) fn wait(kq: RawFd, slots: &mut [Event], timeout_ms: i64) -> Result<usize, Errno> {
    let ts;
    let ts_ptr = if timeout_ms < 0 {
        ptr::null()
    } else {
        ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };
        &ts as *const libc::timespec
    };
    let max = slots.len().min(libc::c_int::MAX as usize) as libc::c_int;

    // `Event` is repr(transparent) over `kevent`.
    let ret = unsafe {
        libc::kevent(
            kq,
            ptr::null(),
            0,
            slots.as_mut_ptr() as *mut RawEvent,
            max,
            ts_ptr,
        )
    };
    match Errno::result(ret) {
        Ok(n) => Ok(n as usize),
        Err(Errno::EINTR) => Ok(0),
        Err(e) => Err(e),
    }
}

impl EventRecord for Event {
    #[inline]
    fn tag(&self) -> Token {
        Token(self.0.udata as usize as u32)
    }

    #[inline]
    fn is_read(&self) -> bool {
        self.0.filter == libc::EVFILT_READ
    }

    #[inline]
    fn is_write(&self) -> bool {
        self.0.filter == libc::EVFILT_WRITE
    }

    #[inline]
    fn socket(&self) -> RawFd {
        self.0.ident as RawFd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accessors() {
        let ev = Event(change(9, libc::EVFILT_WRITE, 0, Token(42)));
        assert_eq!(ev.tag(), Token(42));
        assert_eq!(ev.socket(), 9);
        assert!(ev.is_write());
        assert!(!ev.is_read());
    }
}
