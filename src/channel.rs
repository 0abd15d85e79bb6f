//! Bounded FIFO channel built on one mutex and two condition variables.
//!
//! Producers park on `not_full`, consumers on `not_empty`. A successful `put`
//! signals exactly one consumer and a successful `take` exactly one producer,
//! so a state change never wakes the side that cannot make progress.

use core::fmt;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use crate::cancel::{self, CancelToken};
use crate::error::{Cancelled, CapacityError};
use crate::sync::{self, Condvar, Mutex, MutexGuard};

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Ring {
            slots,
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Caller must have checked `!is_full()`.
    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        debug_assert!(self.slots[self.tail].is_none());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
    }

    /// Caller must have checked `!is_empty()`.
    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        let item = self.slots[self.head]
            .take()
            .expect("occupied slot at head");
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        item
    }
}

enum Side {
    Producer,
    Consumer,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Producer => "producer",
            Side::Consumer => "consumer",
        }
    }

    fn is_blocked<T>(&self, ring: &Ring<T>) -> bool {
        match self {
            Side::Producer => ring.is_full(),
            Side::Consumer => ring.is_empty(),
        }
    }
}

/// Outcome of a bounded wait that did not reach its condition.
enum Abandoned {
    Cancelled,
    TimedOut,
}

/// Capacity-bounded multi-producer multi-consumer FIFO channel.
///
/// Share it between threads behind an `Arc` or a `thread::scope` borrow.
/// Items come out in exactly the order successful `put` calls inserted them.
pub struct BoundedChannel<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedChannel<T> {
    /// Creates a channel holding at most `capacity` items.
    ///
    /// Returns [`CapacityError`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError);
        }
        Ok(BoundedChannel {
            ring: Mutex::new(Ring::new(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        })
    }

    /// Like [`new`](Self::new) but panics on zero capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::new(capacity) {
            Ok(channel) => channel,
            Err(err) => panic!("{err}"),
        }
    }

    /// Maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered items. Stale as soon as it returns.
    pub fn len(&self) -> usize {
        sync::lock(&self.ring).count
    }

    /// Racy, like [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Racy, like [`len`](Self::len).
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Wakes every waiter so it re-checks its cancellation token.
    ///
    /// The lock is taken first: a waiter that has checked its token but not yet
    /// parked still holds it, so the notification cannot slip in between.
    fn interrupt(&self) {
        let _ring = sync::lock(&self.ring);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn condvar(&self, side: &Side) -> &Condvar {
        match side {
            Side::Producer => &self.not_full,
            Side::Consumer => &self.not_empty,
        }
    }
}

impl<T: Send> BoundedChannel<T> {
    /// Inserts `item`, waiting while the channel is full.
    ///
    /// Fails with [`Cancelled`] if the calling thread's current token fires
    /// while it waits; `item` is dropped and the channel is unchanged.
    pub fn put(&self, item: T) -> Result<(), Cancelled> {
        self.put_with(item, &cancel::current())
    }

    /// [`put`](Self::put) observing an explicit token.
    pub fn put_with(&self, item: T, token: &CancelToken) -> Result<(), Cancelled> {
        match self.push(item, token, None) {
            Ok(()) => Ok(()),
            Err(Abandoned::Cancelled) => Err(Cancelled),
            Err(Abandoned::TimedOut) => unreachable!("unbounded wait timed out"),
        }
    }

    /// Removes the oldest item, waiting while the channel is empty.
    pub fn take(&self) -> Result<T, Cancelled> {
        self.take_with(&cancel::current())
    }

    /// [`take`](Self::take) observing an explicit token.
    pub fn take_with(&self, token: &CancelToken) -> Result<T, Cancelled> {
        match self.pop(token, None) {
            Ok(item) => Ok(item),
            Err(Abandoned::Cancelled) => Err(Cancelled),
            Err(Abandoned::TimedOut) => unreachable!("unbounded wait timed out"),
        }
    }

    /// Inserts `item` if space frees up within `timeout`.
    ///
    /// `Ok(false)` means the deadline passed first and `item` was dropped. A zero
    /// timeout never parks.
    pub fn try_put(&self, item: T, timeout: Duration) -> Result<bool, Cancelled> {
        self.try_put_with(item, timeout, &cancel::current())
    }

    /// [`try_put`](Self::try_put) observing an explicit token.
    pub fn try_put_with(
        &self,
        item: T,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<bool, Cancelled> {
        match self.push(item, token, deadline_after(timeout)) {
            Ok(()) => Ok(true),
            Err(Abandoned::TimedOut) => Ok(false),
            Err(Abandoned::Cancelled) => Err(Cancelled),
        }
    }

    /// Removes the oldest item if one arrives within `timeout`.
    pub fn try_take(&self, timeout: Duration) -> Result<Option<T>, Cancelled> {
        self.try_take_with(timeout, &cancel::current())
    }

    /// [`try_take`](Self::try_take) observing an explicit token.
    pub fn try_take_with(
        &self,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<Option<T>, Cancelled> {
        match self.pop(token, deadline_after(timeout)) {
            Ok(item) => Ok(Some(item)),
            Err(Abandoned::TimedOut) => Ok(None),
            Err(Abandoned::Cancelled) => Err(Cancelled),
        }
    }

    fn push(
        &self,
        item: T,
        token: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<(), Abandoned> {
        self.when_ready(Side::Producer, token, deadline, |ring| {
            ring.push(item);
            self.not_empty.notify_one();
        })
    }

    fn pop(&self, token: &CancelToken, deadline: Option<Instant>) -> Result<T, Abandoned> {
        self.when_ready(Side::Consumer, token, deadline, |ring| {
            let item = ring.pop();
            self.not_full.notify_one();
            item
        })
    }

    /// Runs `act` under the lock once `side` is no longer blocked.
    ///
    /// The wake hook is registered and unregistered with the ring unlocked: a
    /// cancel holds the token's registry while it takes the ring lock.
    fn when_ready<R>(
        &self,
        side: Side,
        token: &CancelToken,
        deadline: Option<Instant>,
        act: impl FnOnce(&mut Ring<T>) -> R,
    ) -> Result<R, Abandoned> {
        {
            let mut ring = sync::lock(&self.ring);
            if !side.is_blocked(&ring) {
                return Ok(act(&mut ring));
            }
        }

        let wake = || self.interrupt();
        // SAFETY: `_hook` is a local dropped before `wake`. It is declared
        // before the ring guard so the ring is unlocked when it unregisters.
        let _hook = unsafe { token.register(&wake) };
        let mut ring = self.wait_while(sync::lock(&self.ring), &side, token, deadline)?;
        Ok(act(&mut ring))
    }

    /// Parks on the condition variable for `side` until it may proceed.
    ///
    /// The condition is always re-checked under the lock after waking, so
    /// spurious wakeups and lost races against other waiters just loop. The
    /// token and deadline are only consulted while still blocked: a waiter
    /// woken by a `notify_one` always consumes it, so no signal is lost to a
    /// waiter that then gives up.
    fn wait_while<'a>(
        &'a self,
        mut ring: MutexGuard<'a, Ring<T>>,
        side: &Side,
        token: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, Ring<T>>, Abandoned> {
        let condvar = self.condvar(side);
        while side.is_blocked(&ring) {
            if token.is_cancelled() {
                tracing::debug!(side = side.as_str(), "wait abandoned: cancelled");
                return Err(Abandoned::Cancelled);
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => {
                        tracing::trace!(side = side.as_str(), "wait abandoned: timed out");
                        return Err(Abandoned::TimedOut);
                    }
                },
            };

            tracing::trace!(side = side.as_str(), capacity = self.capacity, "parking");
            ring = match remaining {
                None => condvar.wait(ring).unwrap_or_else(PoisonError::into_inner),
                Some(remaining) => {
                    condvar
                        .wait_timeout(ring, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        Ok(ring)
    }
}

impl<T> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// `None` means wait forever, including when `timeout` overflows `Instant`.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn smoke() {
        let channel = BoundedChannel::with_capacity(8);
        channel.put(42).unwrap();
        assert_eq!(channel.take().unwrap(), 42);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(BoundedChannel::<i32>::new(0).unwrap_err(), CapacityError);
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::new(3);
        for round in 0..5 {
            for i in 0..3 {
                ring.push(round * 10 + i);
            }
            assert!(ring.is_full());
            for i in 0..3 {
                assert_eq!(ring.pop(), round * 10 + i);
            }
            assert!(ring.is_empty());
        }
        assert_eq!(ring.head, ring.tail);
    }

    #[test]
    fn pop_clears_slot() {
        let mut ring = Ring::new(2);
        ring.push(String::from("a"));
        ring.pop();
        assert!(ring.slots.iter().all(Option::is_none));
    }

    #[test]
    fn zero_timeout_does_not_park() {
        let channel = BoundedChannel::with_capacity(1);
        assert!(channel.try_put(1, Duration::ZERO).unwrap());
        assert!(!channel.try_put(2, Duration::ZERO).unwrap());
        assert_eq!(channel.try_take(Duration::ZERO).unwrap(), Some(1));
        assert_eq!(channel.try_take(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn huge_timeout_waits_like_put() {
        let channel = std::sync::Arc::new(BoundedChannel::with_capacity(1));
        channel.put(1).unwrap();
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.try_put(2, Duration::MAX))
        };
        assert_eq!(channel.take().unwrap(), 1);
        assert_eq!(producer.join().unwrap(), Ok(true));
        assert_eq!(channel.take().unwrap(), 2);
    }

    #[test]
    fn cancelled_token_is_ignored_when_not_blocked() {
        let channel = BoundedChannel::with_capacity(1);
        let token = CancelToken::new();
        token.cancel();
        channel.put_with(7, &token).unwrap();
        assert_eq!(channel.put_with(8, &token), Err(Cancelled));
        assert_eq!(channel.take_with(&token).unwrap(), 7);
        assert_eq!(channel.take_with(&token), Err(Cancelled));
    }

    #[test]
    fn hook_is_removed_after_wait() {
        let channel = std::sync::Arc::new(BoundedChannel::with_capacity(1));
        let token = CancelToken::new();
        let consumer = {
            let channel = channel.clone();
            let token = token.clone();
            thread::spawn(move || channel.take_with(&token))
        };
        while token.hook_count() == 0 {
            thread::yield_now();
        }
        channel.put(3).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(3));
        assert_eq!(token.hook_count(), 0);
    }

    #[test]
    fn borrowed_items_under_scoped_threads() {
        let data = [10, 20, 30];
        let channel = BoundedChannel::<&i32>::with_capacity(1);

        let received = thread::scope(|s| {
            s.spawn(|| {
                for item in &data {
                    channel.put(item).unwrap();
                }
            });
            let consumer = s.spawn(|| (0..3).map(|_| *channel.take().unwrap()).sum::<i32>());
            consumer.join().unwrap()
        });

        assert_eq!(received, 60);
    }

    #[test]
    fn debug_shows_len_and_capacity() {
        let channel = BoundedChannel::with_capacity(4);
        channel.put("x").unwrap();
        assert_eq!(
            format!("{channel:?}"),
            "BoundedChannel { capacity: 4, len: 1 }"
        );
    }
}
