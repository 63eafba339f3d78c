//! Linux epoll backend.
//!
//! Registrations are edge-triggered (`EPOLLET`). `EPOLL_CTL_ADD` is tried
//! first and an `EEXIST` falls back to `EPOLL_CTL_MOD`, so registering a
//! descriptor again replaces its interest mask instead of failing.

use std::os::unix::io::RawFd;

use nix::errno::Errno;

use crate::event::{Event, EventRecord, Interest, Token};

pub(crate) type RawEvent = libc::epoll_event;

const READ_MASK: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32;
const WRITE_MASK: u32 = libc::EPOLLOUT as u32;
/// Reported as readable: the follow-up read returns data, 0, or the error.
const READABLE: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

#[inline]
fn pack(fd: RawFd, token: Token) -> u64 {
    ((token.0 as u64) << 32) | (fd as u32 as u64)
}

fn mask(interest: Interest) -> u32 {
    if interest.wants_write() {
        READ_MASK | WRITE_MASK
    } else {
        READ_MASK
    }
}

pub(crate) fn empty_event() -> RawEvent {
    libc::epoll_event { events: 0, u64: 0 }
}

pub(crate) fn create() -> Result<RawFd, Errno> {
    Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

fn ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, token: Token) -> Result<(), Errno> {
    let mut ev = libc::epoll_event { events, u64: pack(fd, token) };
    Errno::result(unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) }).map(drop)
}

pub(crate) fn register(epfd: RawFd, fd: RawFd, interest: Interest, token: Token) -> Result<(), Errno> {
    let events = mask(interest);
    match ctl(epfd, libc::EPOLL_CTL_ADD, fd, events, token) {
        Err(Errno::EEXIST) => ctl(epfd, libc::EPOLL_CTL_MOD, fd, events, token),
        other => other,
    }
}

/// A descriptor that was never registered is left alone, matching kqueue.
pub(crate) fn unregister_write(epfd: RawFd, fd: RawFd, token: Token) -> Result<(), Errno> {
    match ctl(epfd, libc::EPOLL_CTL_MOD, fd, READ_MASK, token) {
        Err(Errno::ENOENT) => Ok(()),
        other => other,
    }
}

pub(crate) fn wait(epfd: RawFd, slots: &mut [Event], timeout_ms: i64) -> Result<usize, Errno> {
    let timeout = if timeout_ms < 0 {
        -1
    } else {
        timeout_ms.min(libc::c_int::MAX as i64) as libc::c_int
    };
    let max = slots.len().min(libc::c_int::MAX as usize) as libc::c_int;

    // `Event` is repr(transparent) over `epoll_event`.
    let ret = unsafe {
        libc::epoll_wait(epfd, slots.as_mut_ptr() as *mut RawEvent, max, timeout)
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
        let data = self.0.u64;
        Token((data >> 32) as u32)
    }

    #[inline]
    fn is_read(&self) -> bool {
        let events = self.0.events;
        events & READABLE != 0
    }

    #[inline]
    fn is_write(&self) -> bool {
        let events = self.0.events;
        events & WRITE_MASK != 0
    }

    #[inline]
    fn socket(&self) -> RawFd {
        let data = self.0.u64;
        data as u32 as RawFd
    }
}
