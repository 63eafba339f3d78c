//! Descriptor accounting for leak detection
//!
//! An [`FdCounter`] is an explicit instrumentation object, not global state.
//! A test creates one, attaches it to the handles it opens (`.track(&counter)`),
//! and checks that [`current`](FdCounter::current) is back to where it started
//! once every handle is closed. Separate tests use separate counters, so they
//! can run in parallel without seeing each other's descriptors.
//!
//! Handles that never get a counter attached skip the bookkeeping entirely.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Number of descriptors opened minus closed by the handles attached to it.
#[derive(Debug, Default)]
pub struct FdCounter {
    open: AtomicI64,
}

impl FdCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record `n` descriptors coming into existence.
    #[inline]
    pub fn opened(&self, n: u32) {
        self.open.fetch_add(n as i64, Ordering::SeqCst);
    }

    /// Record `n` descriptors released.
    #[inline]
    pub fn closed(&self, n: u32) {
        self.open.fetch_sub(n as i64, Ordering::SeqCst);
    }

    /// Descriptors currently outstanding. Zero means balanced.
    #[inline]
    pub fn current(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }
}
