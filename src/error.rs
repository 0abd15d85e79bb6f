//! Error types

use thiserror::Error;

/// The waiting thread's cancellation token fired before its condition held.
///
/// Returned by the blocking channel operations. The channel is left exactly as
/// it was before the call: nothing was inserted or removed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation was cancelled while waiting")]
pub struct Cancelled;

/// A channel was constructed with zero capacity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("capacity must be greater than 0")]
pub struct CapacityError;

/// The coordinator ran out of attempts before holding every lock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("failed to acquire {locks} locks after {attempts} attempts")]
pub struct AcquisitionFailed {
    /// Number of complete acquisition rounds that were tried.
    pub attempts: u32,
    /// Number of locks requested.
    pub locks: usize,
}

/// Why a coordinator attempt round stopped short.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("lock {index} is held elsewhere")]
pub(crate) struct Contended {
    pub(crate) index: usize,
}
