//! Unbounded blocking MPMC channel for handing work to and from a reactor
//!
//! The queue is an intrusive singly-linked list of [`Message`] nodes kept
//! behind a `Mutex` + `Condvar`:
//!
//! - `send` appends at the tail and signals one waiter. It only blocks for
//!   the lock hold.
//! - `recv` blocks while the queue is empty, then pops the head. There is no
//!   timeout; to unblock a receiver, send it a sentinel message.
//! - `pending` peeks without taking the lock. Good for fast paths only, the
//!   answer may be stale by the time it is read.
//!
//! A node's storage belongs to whoever holds the `Box<Message<T>>`. The
//! channel links nodes it is given and hands the same allocation back out
//! of `recv`; it never allocates or frees a node itself while it is live.
//!
//! A poisoned lock is fatal: it is reported through
//! [`Unrecoverable`](crate::error::Unrecoverable) and the process aborts.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::Unrecoverable;

/// One queue node. Allocated by the sender, returned to the receiver.
pub struct Message<T> {
    /// Link to the next queued node; `None` whenever the caller holds the node.
    next: Option<NonNull<Message<T>>>,
    value: T,
}

// Safety: `next` is only followed by the queue, under the channel lock. A
// node handed to the caller is detached, so it behaves like a plain `T`.
unsafe impl<T: Send> Send for Message<T> {}
unsafe impl<T: Sync> Sync for Message<T> {}

impl<T> Message<T> {
    /// Allocate a detached node.
    pub fn new(value: T) -> Box<Self> {
        Box::new(Self { next: None, value })
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Take the payload, releasing the node.
    pub fn into_inner(self: Box<Self>) -> T {
        self.value
    }
}

/// Head/tail list. Only touched with the channel lock held.
///
/// Queued nodes are owned through raw links: `push` turns the `Box` into a
/// pointer and `pop` is the only place that turns one back into a `Box`.
struct Queue<T> {
    head: Option<NonNull<Message<T>>>,
    /// Last node of the chain starting at `head`; `None` iff `head` is `None`.
    tail: Option<NonNull<Message<T>>>,
}

// Safety: every node reachable from `head` is exclusively owned by the
// queue, and the whole `Queue` is accessed under the channel mutex.
unsafe impl<T: Send> Send for Queue<T> {}

impl<T> Queue<T> {
    const fn new() -> Self {
        Self { head: None, tail: None }
    }

    fn push(&mut self, mut msg: Box<Message<T>>) {
        msg.next = None;
        // Safety: `Box::into_raw` never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(msg)) };
        match self.tail {
            // Safety: tail is a live node owned by this queue, and no other
            // reference to it exists while the lock is held.
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    fn pop(&mut self) -> Option<Box<Message<T>>> {
        let head = self.head?;
        // Safety: `head` came from `Box::into_raw` in `push` and is unlinked
        // here exactly once, so ownership returns to a single `Box`.
        let mut msg = unsafe { Box::from_raw(head.as_ptr()) };
        self.head = msg.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        Some(msg)
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Queued nodes are raw links; hand each back to a Box to free it.
        while self.pop().is_some() {}
    }
}

/// The shared channel state.
pub struct Channel<T> {
    queue: Mutex<Queue<T>>,
    cond: Condvar,
    /// Mirrors the queue length; written under the lock, read without it.
    len: AtomicUsize,
}

impl<T> Channel<T> {
    /// Initialize an empty channel.
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::new()),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue
            .lock()
            .unwrap_or_else(|e| Unrecoverable::poisoned("channel lock", e).terminate())
    }

    /// Append `msg` at the tail and wake one receiver.
    pub fn send(&self, msg: Box<Message<T>>) {
        let mut queue = self.lock();
        queue.push(msg);
        self.len.fetch_add(1, Ordering::Release);
        self.cond.notify_one();
    }

    /// Pop the head, blocking while the channel is empty.
    pub fn recv(&self) -> Box<Message<T>> {
        let mut queue = self.lock();
        loop {
            if let Some(msg) = queue.pop() {
                self.len.fetch_sub(1, Ordering::Release);
                return msg;
            }
            queue = self
                .cond
                .wait(queue)
                .unwrap_or_else(|e| Unrecoverable::poisoned("channel wait", e).terminate());
        }
    }

    /// Pop the head if there is one, without blocking.
    pub fn try_recv(&self) -> Option<Box<Message<T>>> {
        let mut queue = self.lock();
        let msg = queue.pop()?;
        self.len.fetch_sub(1, Ordering::Release);
        Some(msg)
    }

    /// Lock-free hint: is something queued right now?
    #[inline]
    pub fn pending(&self) -> bool {
        self.len.load(Ordering::Acquire) != 0
    }

    /// Number of queued messages (hint, may be stale).
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.pending()
    }

    /// Tear the channel down, dropping any messages still queued.
    ///
    /// Taking `self` by value means no thread can still be inside `recv`.
    /// A lock poisoned by a panicking sender or receiver is fatal.
    pub fn destroy(self) {
        let queue = self
            .queue
            .into_inner()
            .unwrap_or_else(|e| Unrecoverable::poisoned("channel destroy", e).terminate());
        let left = self.len.load(Ordering::Acquire);
        if left != 0 {
            tracing::debug!(left, "channel destroyed with undelivered messages");
        }
        drop(queue);
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a channel and return its two typed ends.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Channel::new());
    (
        Sender { inner: Arc::clone(&inner) },
        Receiver { inner },
    )
}

/// Sending half of a channel
pub struct Sender<T> {
    inner: Arc<Channel<T>>,
}

/// Receiving half of a channel
pub struct Receiver<T> {
    inner: Arc<Channel<T>>,
}

impl<T> Sender<T> {
    /// Box `value` into a node and enqueue it.
    pub fn send(&self, value: T) {
        self.inner.send(Message::new(value));
    }

    pub fn pending(&self) -> bool {
        self.inner.pending()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Receiver<T> {
    /// Block until a value arrives.
    pub fn recv(&self) -> T {
        self.inner.recv().into_inner()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_recv().map(Message::into_inner)
    }

    pub fn pending(&self) -> bool {
        self.inner.pending()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver { inner: Arc::clone(&self.inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_single_thread() {
        let chan = Channel::new();
        for i in 0..5 {
            chan.send(Message::new(i));
        }
        for i in 0..5 {
            assert_eq!(chan.recv().into_inner(), i);
        }
        assert!(!chan.pending());
    }

    #[test]
    fn test_interleaved_push_pop_relinks_tail() {
        let chan = Channel::new();
        chan.send(Message::new(1));
        chan.send(Message::new(2));
        assert_eq!(chan.recv().into_inner(), 1);
        chan.send(Message::new(3));
        assert_eq!(chan.recv().into_inner(), 2);
        assert_eq!(chan.recv().into_inner(), 3);
        assert!(chan.try_recv().is_none());

        // Empty again: the next push must start a fresh chain.
        chan.send(Message::new(4));
        chan.send(Message::new(5));
        assert_eq!(chan.len(), 2);
        assert_eq!(chan.recv().into_inner(), 4);
        chan.destroy();
    }

    #[test]
    fn test_pending() {
        let chan = Channel::new();
        assert!(!chan.pending());

        chan.send(Message::new("x"));
        assert!(chan.pending());
        assert_eq!(chan.len(), 1);

        assert_eq!(*chan.recv().get(), "x");
        assert!(!chan.pending());
        assert!(chan.try_recv().is_none());
    }

    #[test]
    fn test_node_is_returned_not_copied() {
        let chan = Channel::new();
        let msg = Message::new(7u64);
        let addr = &*msg as *const Message<u64>;
        chan.send(msg);
        let got = chan.recv();
        assert_eq!(&*got as *const Message<u64>, addr);
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let (tx, rx) = channel::<u32>();

        let handle = thread::spawn(move || {
            let v = rx.recv();
            (v, rx.pending())
        });

        thread::sleep(Duration::from_millis(50));
        tx.send(99);

        let (v, pending_after) = handle.join().unwrap();
        assert_eq!(v, 99);
        assert!(!pending_after);
        assert!(!tx.pending());
    }

    #[test]
    fn test_sentinel_unblocks_receiver() {
        enum Work {
            Job(u32),
            Stop,
        }

        let (tx, rx) = channel::<Work>();
        let worker = thread::spawn(move || {
            let mut sum = 0;
            loop {
                match rx.recv() {
                    Work::Job(n) => sum += n,
                    Work::Stop => return sum,
                }
            }
        });

        for n in 1..=10 {
            tx.send(Work::Job(n));
        }
        tx.send(Work::Stop);
        assert_eq!(worker.join().unwrap(), 55);
    }

    #[test]
    fn test_mpmc_exactly_once_and_per_producer_order() {
        const PRODUCERS: u32 = 4;
        const CONSUMERS: usize = 3;
        const PER_PRODUCER: u32 = 2_000;

        let (tx, rx) = channel::<Option<(u32, u32)>>();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        tx.send(Some((p, seq)));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(item) = rx.recv() {
                        got.push(item);
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for _ in 0..CONSUMERS {
            tx.send(None);
        }

        let mut seen = HashSet::new();
        for c in consumers {
            let got = c.join().unwrap();
            // Within one consumer, each producer's items arrive in send order.
            let mut last = vec![None::<u32>; PRODUCERS as usize];
            for (p, seq) in got {
                if let Some(prev) = last[p as usize] {
                    assert!(seq > prev);
                }
                last[p as usize] = Some(seq);
                assert!(seen.insert((p, seq)), "duplicate delivery");
            }
        }
        assert_eq!(seen.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert!(!rx.pending());
    }

    #[test]
    fn test_destroy_with_leftovers() {
        let chan = Channel::new();
        chan.send(Message::new(String::from("a")));
        chan.send(Message::new(String::from("b")));
        chan.destroy();
    }
}
