//! Deadlock-free acquisition of several exclusive locks.
//!
//! Every acquisition attempt is non-blocking. If any lock in the list is busy,
//! everything taken so far is released (newest first) and the whole list is
//! retried after a back-off delay. No thread ever waits while holding a
//! partial set, which rules out the hold-and-wait condition for deadlock. The
//! price is possible live-lock under adversarial scheduling; randomised
//! back-off makes lockstep retries unlikely.
//!
//! ```
//! use parking_lot::Mutex;
//! use std::time::Duration;
//! use turbo_monitor::acquire_all;
//!
//! let from = Mutex::new(100);
//! let to = Mutex::new(0);
//!
//! let mut held = acquire_all(&[&from, &to], None, Duration::from_millis(1)).unwrap();
//! *held[0] -= 30;
//! *held[1] += 30;
//! drop(held);
//!
//! assert_eq!(*from.lock(), 70);
//! assert_eq!(*to.lock(), 30);
//! ```
//!
//! Locks of different types go in a tuple, and the guards come back as one:
//!
//! ```
//! use std::time::Duration;
//! use turbo_monitor::acquire_all;
//!
//! let balance = parking_lot::Mutex::new(100);
//! let ledger = std::sync::Mutex::new(Vec::<u32>::new());
//!
//! let mut held = acquire_all((&balance, &ledger), None, Duration::from_millis(1)).unwrap();
//! *held.0 -= 30;
//! held.1.push(30);
//! ```

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::TryLockError;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::{AcquisitionFailed, Contended};

/// A lock that can be taken without blocking.
///
/// Releasing is dropping the guard.
pub trait Lockable {
    /// Proof of exclusive ownership; the lock is held until it drops.
    type Guard<'a>
    where
        Self: 'a;

    /// Takes the lock if it is free right now, never waiting.
    fn try_acquire(&self) -> Option<Self::Guard<'_>>;
}

impl<T: ?Sized> Lockable for parking_lot::Mutex<T> {
    type Guard<'a> = parking_lot::MutexGuard<'a, T> where Self: 'a;

    fn try_acquire(&self) -> Option<Self::Guard<'_>> {
        self.try_lock()
    }
}

/// Exclusive (write) acquisition.
impl<T: ?Sized> Lockable for parking_lot::RwLock<T> {
    type Guard<'a> = parking_lot::RwLockWriteGuard<'a, T> where Self: 'a;

    fn try_acquire(&self) -> Option<Self::Guard<'_>> {
        self.try_write()
    }
}

/// A poisoned mutex is still handed out; the data's consistency is the caller's call.
impl<T: ?Sized> Lockable for std::sync::Mutex<T> {
    type Guard<'a> = std::sync::MutexGuard<'a, T> where Self: 'a;

    fn try_acquire(&self) -> Option<Self::Guard<'_>> {
        match self.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// An ordered list of locks that the coordinator takes front to back.
///
/// Implemented for slices, arrays and `Vec`s of references to one lock type,
/// and for tuples of up to four references to any mix of [`Lockable`] types.
pub trait LockSet<'a> {
    /// Guards taken so far in the current round.
    type Partial: Default;
    /// Guards for the complete list.
    type Guards: ReleaseInReverse;

    /// Number of locks in the list.
    fn count(&self) -> usize;

    /// Tries lock `index` without waiting, storing its guard in `partial`.
    ///
    /// Called with `index` equal to the number of guards already held.
    fn try_acquire_at(&self, index: usize, partial: &mut Self::Partial) -> bool;

    /// Drops every guard in `partial`, newest first.
    fn release(partial: &mut Self::Partial);

    /// Converts a round that holds every lock into the final guards.
    fn complete(partial: Self::Partial) -> Option<Self::Guards>;
}

impl<'a, L: Lockable + ?Sized + 'a> LockSet<'a> for &[&'a L] {
    type Partial = Vec<L::Guard<'a>>;
    type Guards = Vec<L::Guard<'a>>;

    fn count(&self) -> usize {
        self.len()
    }

    fn try_acquire_at(&self, index: usize, partial: &mut Self::Partial) -> bool {
        try_push(self[index], partial)
    }

    fn release(partial: &mut Self::Partial) {
        release_in_reverse(partial);
    }

    fn complete(partial: Self::Partial) -> Option<Self::Guards> {
        Some(partial)
    }
}

impl<'a, L: Lockable + ?Sized + 'a, const N: usize> LockSet<'a> for &[&'a L; N] {
    type Partial = Vec<L::Guard<'a>>;
    type Guards = Vec<L::Guard<'a>>;

    fn count(&self) -> usize {
        self.len()
    }

    fn try_acquire_at(&self, index: usize, partial: &mut Self::Partial) -> bool {
        try_push(self[index], partial)
    }

    fn release(partial: &mut Self::Partial) {
        release_in_reverse(partial);
    }

    fn complete(partial: Self::Partial) -> Option<Self::Guards> {
        Some(partial)
    }
}

impl<'a, L: Lockable + ?Sized + 'a> LockSet<'a> for &Vec<&'a L> {
    type Partial = Vec<L::Guard<'a>>;
    type Guards = Vec<L::Guard<'a>>;

    fn count(&self) -> usize {
        self.len()
    }

    fn try_acquire_at(&self, index: usize, partial: &mut Self::Partial) -> bool {
        try_push(self[index], partial)
    }

    fn release(partial: &mut Self::Partial) {
        release_in_reverse(partial);
    }

    fn complete(partial: Self::Partial) -> Option<Self::Guards> {
        Some(partial)
    }
}

fn try_push<'a, L: Lockable + ?Sized + 'a>(lock: &'a L, guards: &mut Vec<L::Guard<'a>>) -> bool {
    match lock.try_acquire() {
        Some(guard) => {
            guards.push(guard);
            true
        }
        None => false,
    }
}

/// Drops a set of guards, last acquired first.
pub trait ReleaseInReverse {
    /// Releases every guard in `self`.
    fn release_in_reverse(self);
}

impl<G> ReleaseInReverse for Vec<G> {
    fn release_in_reverse(mut self) {
        release_in_reverse(&mut self);
    }
}

macro_rules! tuple_lock_set {
    ($count:literal; $(($index:tt, $lock:ident, $guard:ident)),+) => {
        impl<'a, $($lock: Lockable + ?Sized + 'a),+> LockSet<'a> for ($(&'a $lock,)+) {
            type Partial = ($(Option<$lock::Guard<'a>>,)+);
            type Guards = ($($lock::Guard<'a>,)+);

            fn count(&self) -> usize {
                $count
            }

            fn try_acquire_at(&self, index: usize, partial: &mut Self::Partial) -> bool {
                match index {
                    $($index => {
                        partial.$index = Lockable::try_acquire(self.$index);
                        partial.$index.is_some()
                    })+
                    _ => false,
                }
            }

            fn release(partial: &mut Self::Partial) {
                for index in (0..$count).rev() {
                    match index {
                        $($index => partial.$index = None,)+
                        _ => {}
                    }
                }
            }

            fn complete(partial: Self::Partial) -> Option<Self::Guards> {
                let ($($guard,)+) = partial;
                Some(($($guard?,)+))
            }
        }

        impl<$($lock),+> ReleaseInReverse for ($($lock,)+) {
            fn release_in_reverse(self) {
                let ($($guard,)+) = self;
                let mut held = ($(Some($guard),)+);
                for index in (0..$count).rev() {
                    match index {
                        $($index => held.$index = None,)+
                        _ => {}
                    }
                }
            }
        }
    };
}

tuple_lock_set!(2; (0, A, a), (1, B, b));
tuple_lock_set!(3; (0, A, a), (1, B, b), (2, C, c));
tuple_lock_set!(4; (0, A, a), (1, B, b), (2, C, c), (3, D, d));

/// Delay between two acquisition rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every failed round. Give competing threads
    /// different delays to make lockstep retries less likely.
    Fixed(Duration),
    /// Random delay in `[0, min(base * 2^retry, max)]`.
    Exponential {
        /// Ceiling for the first retry.
        base: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let ceiling = base.saturating_mul(1u32 << retry.min(31)).min(max);
                let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
                Duration::from_nanos(rand::rng().random_range(0..=nanos))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_micros(50),
            max: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Trying lock `i` without blocking.
    Acquiring(usize),
    /// Every lock is held.
    HoldingAll,
    /// A lock was busy; release everything held by this round.
    BackingOff(Contended),
    /// Wait out the back-off, then start over from the first lock.
    Retry,
}

/// Acquires lists of locks with release-and-retry on partial failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffLockCoordinator {
    backoff: Backoff,
    max_attempts: Option<u32>,
}

impl BackoffLockCoordinator {
    /// Retries forever with `backoff` between rounds.
    pub fn new(backoff: Backoff) -> Self {
        BackoffLockCoordinator {
            backoff,
            max_attempts: None,
        }
    }

    /// Gives up after `max_attempts` rounds. `None` (the default) retries forever.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The configured back-off policy.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// The configured attempt bound.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Takes every lock in `locks`, in order.
    ///
    /// Listing the same lock twice can never succeed.
    pub fn acquire<'a, S: LockSet<'a>>(
        &self,
        locks: S,
    ) -> Result<HeldLocks<S::Guards>, AcquisitionFailed> {
        let count = locks.count();
        let failed = |attempts| AcquisitionFailed {
            attempts,
            locks: count,
        };
        if self.max_attempts == Some(0) {
            return Err(failed(0));
        }

        let mut partial = S::Partial::default();
        let mut attempts = 1u32;
        let mut state = State::Acquiring(0);
        loop {
            state = match state {
                State::Acquiring(index) if index == count => State::HoldingAll,
                State::Acquiring(index) => {
                    if locks.try_acquire_at(index, &mut partial) {
                        State::Acquiring(index + 1)
                    } else {
                        State::BackingOff(Contended { index })
                    }
                }
                State::HoldingAll => {
                    return match S::complete(partial) {
                        Some(guards) => Ok(HeldLocks::new(guards)),
                        None => unreachable!("lock set completed with a lock missing"),
                    };
                }
                State::BackingOff(contended) => {
                    S::release(&mut partial);
                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        tracing::warn!(
                            attempts,
                            locks = count,
                            %contended,
                            "giving up on lock set"
                        );
                        return Err(failed(attempts));
                    }
                    tracing::debug!(attempt = attempts, %contended, "backing off");
                    State::Retry
                }
                State::Retry => {
                    pause(self.backoff.delay(attempts - 1));
                    attempts = attempts.saturating_add(1);
                    State::Acquiring(0)
                }
            };
        }
    }
}

/// Acquires every lock in `locks` with a fixed back-off between rounds.
///
/// `max_attempts` of `None` retries until it succeeds.
pub fn acquire_all<'a, S: LockSet<'a>>(
    locks: S,
    max_attempts: Option<u32>,
    backoff: Duration,
) -> Result<HeldLocks<S::Guards>, AcquisitionFailed> {
    BackoffLockCoordinator::new(Backoff::Fixed(backoff))
        .with_max_attempts(max_attempts)
        .acquire(locks)
}

/// Guards for a fully acquired lock list, in acquisition order.
///
/// Derefs to a `Vec` of guards for homogeneous lists and to a tuple of guards
/// for tuples. Dropping releases the locks in reverse acquisition order.
#[derive(Debug)]
pub struct HeldLocks<G: ReleaseInReverse> {
    guards: ManuallyDrop<G>,
}

impl<G: ReleaseInReverse> HeldLocks<G> {
    fn new(guards: G) -> Self {
        HeldLocks {
            guards: ManuallyDrop::new(guards),
        }
    }

    /// Releases all locks now.
    pub fn release(self) {
        drop(self);
    }
}

impl<G: ReleaseInReverse> Deref for HeldLocks<G> {
    type Target = G;

    fn deref(&self) -> &G {
        &self.guards
    }
}

impl<G: ReleaseInReverse> DerefMut for HeldLocks<G> {
    fn deref_mut(&mut self) -> &mut G {
        &mut self.guards
    }
}

impl<G: ReleaseInReverse> Drop for HeldLocks<G> {
    fn drop(&mut self) {
        // SAFETY: `guards` is never touched again after this.
        let guards = unsafe { ManuallyDrop::take(&mut self.guards) };
        guards.release_in_reverse();
    }
}

fn release_in_reverse<G>(guards: &mut Vec<G>) {
    while let Some(guard) = guards.pop() {
        drop(guard);
    }
}

fn pause(delay: Duration) {
    if delay.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(delay);
    }
}
