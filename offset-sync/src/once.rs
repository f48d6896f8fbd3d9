//! One-time initialization.
//!
//! See the documentation on the [`Once`] type for details.
use crate::{
    loom::sync::atomic::{AtomicBool, Ordering::*},
    mutex::Mutex,
};
use core::{fmt, future::Future};


/// Runs an initializer exactly once, no matter how many tasks ask for it.
///
/// The first caller of [`call_once`] (or [`call_once_async`]) runs its
/// closure. Every concurrent caller waits until that run has finished, and
/// every later caller returns immediately without running anything.
///
/// If the closure panics, the `Once` is still considered complete.
///
/// # Examples
///
/// ```
/// use offset_sync::Once;
/// # tokio_test::block_on(async {
///
/// let once = Once::new();
/// let mut runs = 0;
/// once.call_once(|| runs += 1).await;
/// once.call_once(|| runs += 1).await;
/// assert_eq!(runs, 1);
/// assert!(once.is_completed());
/// # });
/// ```
///
/// [`call_once`]: Once::call_once
/// [`call_once_async`]: Once::call_once_async
pub struct Once {
    done: AtomicBool,
    lock: Mutex<()>,
}

/// Marks a [`Once`] complete when dropped, so that a panicking initializer
/// still counts as having run.
struct Complete<'a>(&'a AtomicBool);

impl Once {
    /// Returns a new `Once` that has not run yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Runs `f` if no initializer has run on this `Once` yet.
    ///
    /// If another task is currently running the initializer, waits for it to
    /// finish.
    pub async fn call_once<F>(&self, f: F)
    where
        F: FnOnce(),
    {
        if self.is_completed() {
            return;
        }

        let _guard = self.lock.lock().await;
        if self.done.load(Relaxed) {
            return;
        }

        let _complete = Complete(&self.done);
        test_trace!("Once::call_once -> running initializer");
        f();
    }

    /// Like [`call_once`](Self::call_once), but the initializer is itself
    /// asynchronous.
    ///
    /// If this future is dropped while the initializer is still running, the
    /// `Once` is *not* marked complete and the next caller runs its own
    /// initializer.
    pub async fn call_once_async<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self.is_completed() {
            return;
        }

        let _guard = self.lock.lock().await;
        if self.done.load(Relaxed) {
            return;
        }

        test_trace!("Once::call_once_async -> running initializer");
        let complete = Complete(&self.done);
        let cancel = CancelGuard(Some(complete));
        f().await;
        drop(cancel.disarm());
    }

    /// Returns `true` once an initializer has run to completion (or
    /// panicked).
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.load(Acquire)
    }
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Once {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Drop for Complete<'_> {
    fn drop(&mut self) {
        self.0.store(true, Release);
    }
}

/// Holds a [`Complete`] across an `.await`. If the future is dropped early,
/// the `Complete` is forgotten unless the thread is unwinding.
struct CancelGuard<'a>(Option<Complete<'a>>);

impl<'a> CancelGuard<'a> {
    fn disarm(mut self) -> Option<Complete<'a>> {
        self.0.take()
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(complete) = self.0.take() {
            if !std::thread::panicking() {
                core::mem::forget(complete);
            }
        }
    }
}
