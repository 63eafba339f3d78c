//! Readiness event records and their accessors
//!
//! An [`Event`] wraps the kernel's own record (`epoll_event` or `kevent`)
//! without copying it into a normalized struct. The layout differs per
//! platform, so callers read it only through [`EventRecord`] (or the
//! `event_*` free functions, which are the same thing).
//!
//! ## Tokens
//!
//! A [`Token`] is the caller's tag for a registration, typically a slot index
//! into a connection table the caller owns. The kernel stores it and hands
//! it back verbatim; nothing here ever dereferences or frees it. On epoll the
//! 64-bit user data holds `token << 32 | fd`, on kqueue `udata` holds the
//! token and `ident` the fd, so both the tag and the socket are available
//! from every record.

use std::fmt;
use std::os::unix::io::RawFd;

use crate::multiplex::backend;

/// Caller-owned tag attached at registration and returned in each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Token {
    fn from(v: u32) -> Self {
        Token(v)
    }
}

/// Which readiness edges a registration delivers.
///
/// Read interest is part of every registration; there is no way to drop it
/// short of closing the descriptor. `Write` therefore behaves as `ReadWrite`,
/// and the variant passed to the most recent `register` call decides whether
/// write edges are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    #[inline]
    pub fn wants_write(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}

/// Uniform view over one platform readiness record.
pub trait EventRecord {
    /// The token given to `register` for this socket.
    fn tag(&self) -> Token;
    /// Readable, or the peer hung up / the socket errored (a read will say which).
    fn is_read(&self) -> bool;
    /// Writable. For a pending `connect`, the connection attempt has finished.
    fn is_write(&self) -> bool;
    /// Descriptor the event is about.
    fn socket(&self) -> RawFd;
}

/// One kernel readiness record, as filled in by `Multiplex::wait`.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Event(pub(crate) backend::RawEvent);

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("tag", &self.tag())
            .field("socket", &self.socket())
            .field("read", &self.is_read())
            .field("write", &self.is_write())
            .finish()
    }
}

#[inline]
pub fn event_tag<R: EventRecord>(record: &R) -> Token {
    record.tag()
}

#[inline]
pub fn event_is_read<R: EventRecord>(record: &R) -> bool {
    record.is_read()
}

#[inline]
pub fn event_is_write<R: EventRecord>(record: &R) -> bool {
    record.is_write()
}

#[inline]
pub fn event_socket<R: EventRecord>(record: &R) -> RawFd {
    record.socket()
}

/// Caller-owned buffer that `wait` fills. Capacity is the `max_events` bound.
pub struct Events {
    buf: Vec<Event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(max_events: usize) -> Self {
        let cap = max_events.max(1);
        Self {
            buf: vec![Event(backend::empty_event()); cap],
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Records written by the last `wait`.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> Option<&Event> {
        self.buf[..self.len].get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.buf[..self.len].iter()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Whole backing slice, for the backend to fill.
    pub(crate) fn slots_mut(&mut self) -> &mut [Event] {
        &mut self.buf
    }

    pub(crate) fn set_len(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.len = n;
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
