//! Cooperative cancellation for threads parked in a channel operation.
//!
//! Every thread owns a *current* [`CancelToken`], created lazily the first time
//! it is asked for. Blocking channel operations observe the current token, so
//! handing a clone of it to another thread gives that thread the power to
//! interrupt whatever the owner is waiting on:
//!
//! ```
//! use std::sync::{mpsc, Arc};
//! use std::thread;
//! use turbo_monitor::{BoundedChannel, CancelToken, Cancelled};
//!
//! let channel = Arc::new(BoundedChannel::<u32>::with_capacity(1));
//! let (tx, rx) = mpsc::channel();
//!
//! let consumer = {
//!     let channel = channel.clone();
//!     thread::spawn(move || {
//!         tx.send(CancelToken::current()).unwrap();
//!         channel.take()
//!     })
//! };
//!
//! rx.recv().unwrap().cancel();
//! assert_eq!(consumer.join().unwrap(), Err(Cancelled));
//! ```
//!
//! A token stays cancelled once fired. Install a fresh one with
//! [`set_current`] to make the thread interruptible again.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::sync::{self, thread_local, Arc, AtomicBool, Mutex, Ordering};

/// A registered wake hook with its borrow lifetime erased.
///
/// Only dereferenced while the registry lock is held, and [`HookGuard`] removes
/// the entry under that same lock before the borrow ends.
struct HookPtr(NonNull<dyn Fn() + Sync>);

// SAFETY: the pointee is `Sync`, so calling it from the cancelling thread is fine.
unsafe impl Send for HookPtr {}

thread_local! {
    static CURRENT: RefCell<Option<CancelToken>> = RefCell::new(None);
}

/// Returns the calling thread's current token, creating it on first use.
pub fn current() -> CancelToken {
    CURRENT.with(|slot| slot.borrow_mut().get_or_insert_with(CancelToken::new).clone())
}

/// Replaces the calling thread's current token, returning the previous one.
pub fn set_current(token: CancelToken) -> Option<CancelToken> {
    CURRENT.with(|slot| slot.borrow_mut().replace(token))
}

/// A shareable cancellation flag that can wake threads waiting on it.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    entries: Vec<(u64, HookPtr)>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Shorthand for [`current()`](crate::cancel::current).
    pub fn current() -> Self {
        current()
    }

    /// Fires the token and wakes every operation currently waiting on it.
    ///
    /// Idempotent: only the first call runs the wake hooks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Registry stays locked while hooks run, so no entry is unregistered
        // mid-call. A hook must not touch this token.
        let hooks = sync::lock(&self.inner.hooks);
        tracing::debug!(waiters = hooks.entries.len(), "cancel token fired");
        for (_, hook) in &hooks.entries {
            // SAFETY: the entry is still registered, so its guard has not
            // dropped and the borrowed closure is alive.
            unsafe { hook.0.as_ref()() };
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called on this token or a clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `hook` to run on cancellation until the returned guard drops.
    ///
    /// Callers must register *before* checking [`is_cancelled`](Self::is_cancelled),
    /// otherwise a cancel landing between the check and the registration is lost.
    /// Dropping the guard waits for a concurrent [`cancel`](Self::cancel) to
    /// finish, so it must not happen while holding a lock the hook takes.
    ///
    /// # Safety
    ///
    /// The guard must be dropped, not leaked, before `hook`'s borrow ends.
    pub(crate) unsafe fn register<'h>(&'h self, hook: &'h (dyn Fn() + Sync)) -> HookGuard<'h> {
        // SAFETY: only the lifetime is erased; the caller keeps the guard,
        // which unregisters the pointer, inside `'h`.
        let hook = unsafe {
            std::mem::transmute::<NonNull<dyn Fn() + Sync + 'h>, NonNull<dyn Fn() + Sync>>(
                NonNull::from(hook),
            )
        };
        let mut hooks = sync::lock(&self.inner.hooks);
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.entries.push((id, HookPtr(hook)));
        HookGuard {
            token: self,
            id,
            _hook: PhantomData,
        }
    }

    #[cfg(all(test, not(loom)))]
    pub(crate) fn hook_count(&self) -> usize {
        sync::lock(&self.inner.hooks).entries.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes a wake hook from its token when dropped.
pub(crate) struct HookGuard<'a> {
    token: &'a CancelToken,
    id: u64,
    _hook: PhantomData<&'a (dyn Fn() + Sync)>,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        let mut hooks = sync::lock(&self.token.inner.hooks);
        hooks.entries.retain(|(id, _)| *id != self.id);
    }
}
