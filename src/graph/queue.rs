//! Bounded queue sitting at the head of every tee branch.
//!
//! The queue caps how much a branch buffers when its consumer is slow.  What
//! happens when it is full is an explicit [`OverflowPolicy`]:
//!
//! * [`OverflowPolicy::DropOldest`] overwrites the oldest item, exactly like a
//!   ring buffer, so the branch always holds the most recent audio and the
//!   feeding thread never stalls.
//! * [`OverflowPolicy::Block`] parks the feeding thread until the consumer
//!   drains an item or the queue is shut down.
//!
//! # Example
//!
//! ```rust
//! use live_splice::graph::{BranchQueue, OverflowPolicy};
//!
//! let queue = BranchQueue::new(3, OverflowPolicy::DropOldest);
//! for i in 0..5 {
//!     queue.push(i).unwrap();
//! }
//! assert_eq!(queue.drain(), vec![2, 3, 4]);
//! assert_eq!(queue.high_water(), 3);
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// OverflowPolicy
// ---------------------------------------------------------------------------

/// What a full branch queue does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued item to make room (leaky downstream).
    DropOldest,
    /// Wait until the consumer makes room.
    Block,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

/// The queue has been shut down; the item was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("branch queue is shut down")]
pub struct QueueClosed;

/// Result of a successful [`BranchQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest item.
    Overwrote,
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

/// Fixed-capacity circular storage.  Never allocates beyond `capacity`.
struct Ring<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    /// Index of the *next* write position (wraps around `capacity`).
    write_pos: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    /// Oldest item sits `len` slots behind the write position.
    fn read_pos(&self) -> usize {
        (self.write_pos + self.capacity - self.len) % self.capacity
    }

    /// Store `item`, returning the displaced oldest item when full.
    fn push_overwrite(&mut self, item: T) -> Option<T> {
        let displaced = self.slots[self.write_pos].replace(item);
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
            None
        } else {
            displaced
        }
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let pos = self.read_pos();
        self.len -= 1;
        self.slots[pos].take()
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.write_pos = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// BranchQueue
// ---------------------------------------------------------------------------

struct Inner<T> {
    ring: Ring<T>,
    closed: bool,
    /// Bumped on every close so stale consumers can tell they were replaced.
    epoch: u64,
    high_water: usize,
    dropped: u64,
}

/// Thread-safe bounded queue with an explicit overflow policy.
///
/// Producers (streaming threads) call [`push`](Self::push); the branch's own
/// pump drains with [`pop`](Self::pop).  [`close`](Self::close) wakes every
/// blocked producer so a branch can be torn down while its feeder is parked.
pub struct BranchQueue<T> {
    inner: Mutex<Inner<T>>,
    space: Condvar,
    available: Condvar,
    policy: OverflowPolicy,
    capacity: usize,
}

impl<T> BranchQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "BranchQueue capacity must be > 0");
        Self {
            inner: Mutex::new(Inner {
                ring: Ring::new(capacity),
                closed: false,
                epoch: 0,
                high_water: 0,
                dropped: 0,
            }),
            space: Condvar::new(),
            available: Condvar::new(),
            policy,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item`, applying the overflow policy when full.
    pub fn push(&self, item: T) -> Result<PushOutcome, QueueClosed> {
        let mut inner = self.lock();
        if self.policy == OverflowPolicy::Block {
            while !inner.closed && inner.ring.len == self.capacity {
                inner = self
                    .space
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if inner.closed {
            return Err(QueueClosed);
        }

        let outcome = match inner.ring.push_overwrite(item) {
            Some(_oldest) => {
                inner.dropped += 1;
                PushOutcome::Overwrote
            }
            None => PushOutcome::Queued,
        };
        inner.high_water = inner.high_water.max(inner.ring.len);
        drop(inner);
        self.available.notify_one();
        Ok(outcome)
    }

    /// Take the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let item = self.lock().ring.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Wait for the oldest item.
    ///
    /// Returns `None` once the queue is closed or reopened under a newer
    /// epoch than `epoch`, which tells a consumer task to exit.
    pub fn pop_wait(&self, epoch: u64) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if inner.closed || inner.epoch != epoch {
                return None;
            }
            if let Some(item) = inner.ring.pop_front() {
                drop(inner);
                self.space.notify_one();
                return Some(item);
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Current epoch; see [`pop_wait`](Self::pop_wait).
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Take every queued item in arrival order.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        let mut items = Vec::with_capacity(inner.ring.len);
        while let Some(item) = inner.ring.pop_front() {
            items.push(item);
        }
        drop(inner);
        self.space.notify_all();
        items
    }

    /// Shut the queue down: discard its contents and release blocked
    /// producers.  Further pushes fail until [`reopen`](Self::reopen).
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.epoch += 1;
        inner.ring.clear();
        drop(inner);
        self.space.notify_all();
        self.available.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Largest number of items ever held at once.
    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }

    /// Number of items discarded by [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
