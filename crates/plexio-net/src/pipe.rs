//! Non-blocking wake pipe.
//!
//! The read end goes into the reactor's [`Multiplex`](crate::Multiplex) set;
//! any thread writes one byte to the write end to interrupt a blocked `wait`.
//! Both ends are non-blocking, so a full pipe simply means a wakeup is
//! already pending.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use plexio_core::error::{NetError, Result};
use plexio_core::fdcount::FdCounter;
use plexio_core::notifier::Notifier;

use crate::sys;

#[derive(Debug)]
pub struct Pipe {
    reader: RawFd,
    writer: RawFd,
    counter: Option<Arc<FdCounter>>,
}

impl Pipe {
    pub fn open() -> Result<Self> {
        let [reader, writer] = sys::pipe().map_err(NetError::PipeFailed)?;
        tracing::trace!(reader, writer, "wake pipe opened");
        Ok(Self { reader, writer, counter: None })
    }

    /// Count both ends against `counter` until `close`.
    pub fn track(mut self, counter: &Arc<FdCounter>) -> Self {
        counter.opened(2);
        self.counter = Some(Arc::clone(counter));
        self
    }

    /// Make the read end readable. Never blocks.
    pub fn wake(&self) -> Result<()> {
        match sys::write(self.writer, &[1u8]) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(NetError::SendFailed(e)),
        }
    }

    /// Consume pending wakeups. Returns how many bytes were queued.
    pub fn drain(&self) -> Result<usize> {
        sys::drain(self.reader)
    }

    /// Close both ends. Both are attempted even if the first fails.
    pub fn close(self) -> Result<()> {
        let r = sys::close(self.reader);
        let w = sys::close(self.writer);
        if let Some(counter) = &self.counter {
            counter.closed(2);
        }
        r.and(w).map_err(NetError::CloseFailed)
    }

    #[inline]
    pub fn reader_fd(&self) -> RawFd {
        self.reader
    }

    #[inline]
    pub fn writer_fd(&self) -> RawFd {
        self.writer
    }
}

/// Registering a `Pipe` registers its read end.
impl AsRawFd for Pipe {
    fn as_raw_fd(&self) -> RawFd {
        self.reader
    }
}

impl Notifier for Pipe {
    fn notify(&self) -> Result<()> {
        self.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_then_drain() {
        let pipe = Pipe::open().unwrap();
        assert_eq!(pipe.drain().unwrap(), 0);

        pipe.wake().unwrap();
        pipe.wake().unwrap();
        pipe.notify().unwrap();
        assert_eq!(pipe.drain().unwrap(), 3);
        assert_eq!(pipe.drain().unwrap(), 0);

        assert_eq!(pipe.as_raw_fd(), pipe.reader_fd());
        assert_ne!(pipe.reader_fd(), pipe.writer_fd());
        pipe.close().unwrap();
    }

    #[test]
    fn test_wake_on_full_pipe_does_not_block() {
        let pipe = Pipe::open().unwrap();
        // Far past any default pipe buffer.
        for _ in 0..1_000_000 {
            pipe.wake().unwrap();
        }
        assert!(pipe.drain().unwrap() > 0);
        pipe.close().unwrap();
    }

    #[test]
    fn test_counter_counts_both_ends() {
        let counter = FdCounter::new();
        let pipe = Pipe::open().unwrap().track(&counter);
        assert_eq!(counter.current(), 2);
        pipe.close().unwrap();
        assert_eq!(counter.current(), 0);
    }
}
