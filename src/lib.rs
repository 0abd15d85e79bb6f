//! turbo_monitor - monitor-style bounded MPMC channel and back-off lock coordination
//!
//! [`BoundedChannel`] is a fixed-capacity FIFO guarded by one mutex with two
//! condition variables, so producers and consumers only wake each other.
//! Blocking calls honour a per-thread [`CancelToken`].
//!
//! [`BackoffLockCoordinator`] / [`acquire_all`] take several locks without
//! ever waiting on one while holding another.
#![warn(missing_docs)]

pub mod cancel;
mod channel;
mod coordinator;
mod error;
mod sync;

pub use cancel::CancelToken;
pub use channel::BoundedChannel;
pub use coordinator::{
    acquire_all, Backoff, BackoffLockCoordinator, HeldLocks, LockSet, Lockable, ReleaseInReverse,
};
pub use error::{AcquisitionFailed, Cancelled, CapacityError};
