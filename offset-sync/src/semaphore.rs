//! A [counting semaphore] for cooperatively scheduled tasks.
//!
//! This is the sleep/wake primitive that every other type in this crate is
//! built on. See the [`Semaphore`] type's documentation for details.
//!
//! [counting semaphore]: https://en.wikipedia.org/wiki/Semaphore_(programming)
use crate::loom::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::collections::VecDeque;


/// A counting semaphore whose waiters are tasks rather than threads.
///
/// A semaphore holds a count of _permits_. [`acquire`] takes one permit,
/// parking the calling task while none are available, and [`release`]
/// returns one.
///
/// # Fairness
///
/// This semaphore is _fair_: a released permit is handed directly to the
/// task that has been waiting longest, rather than returned to the count
/// where a newly arriving task could take it first. A woken task therefore
/// never has to retry.
///
/// # Examples
///
/// ```
/// use offset_sync::Semaphore;
/// # tokio_test::block_on(async {
///
/// let sem = Semaphore::new(1);
/// sem.acquire().await;
/// assert_eq!(sem.available_permits(), 0);
///
/// sem.release();
/// assert_eq!(sem.available_permits(), 1);
/// # });
/// ```
///
/// [`acquire`]: Semaphore::acquire
/// [`release`]: Semaphore::release
pub struct Semaphore {
    permits: AtomicUsize,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

/// The future returned by [`Semaphore::acquire`].
///
/// If this future is dropped after a permit was handed to it but before it
/// observed that permit, the permit is passed on to the next waiter.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Acquire<'sem> {
    semaphore: &'sem Semaphore,
    waiter: Option<Arc<Waiter>>,
}

#[derive(Debug)]
struct Waiter {
    state: Mutex<WaiterState>,
}

#[derive(Debug)]
struct WaiterState {
    granted: bool,
    waker: Option<Waker>,
}

// === impl Semaphore ===

impl Semaphore {
    /// Returns a new `Semaphore` with `permits` permits available.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquires a permit, waiting until one is available.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire {
            semaphore: self,
            waiter: None,
        }
    }

    /// Acquires a permit only if one is available right now.
    ///
    /// Returns `true` if a permit was taken.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self
                .permits
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one permit.
    ///
    /// If any task is waiting in [`acquire`](Self::acquire), the permit goes
    /// to the one that has waited longest and that task is woken. Otherwise
    /// the permit is added back to the count.
    pub fn release(&self) {
        let mut waiters = self.waiters.lock();
        if let Some(waiter) = waiters.pop_front() {
            let waker = waiter.grant();
            drop(waiters);
            test_trace!("Semaphore::release -> handed permit to waiter");
            if let Some(waker) = waker {
                waker.wake();
            }
            return;
        }

        // the count is bumped while holding the wait list lock, so a task
        // that enqueues itself after failing the fast path re-checks the
        // count and cannot miss this permit.
        self.permits.fetch_add(1, Ordering::Release);
        drop(waiters);
    }

    /// Returns the number of permits currently available.
    #[inline]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Returns the number of tasks currently waiting for a permit.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .field("waiters", &self.waiters())
            .finish()
    }
}

// === impl Acquire ===

impl Acquire<'_> {
    /// Withdraws this future from the wait list without passing on a permit
    /// that was handed to it.
    ///
    /// Returns `true` if a permit had already been handed over. That permit
    /// now belongs to the caller. Afterwards, dropping this future does
    /// nothing.
    pub(crate) fn cancel(&mut self) -> bool {
        let Some(waiter) = self.waiter.take() else {
            return false;
        };

        let mut waiters = self.semaphore.waiters.lock();
        let granted = waiter.state.lock().granted;
        if !granted {
            waiters.retain(|queued| !Arc::ptr_eq(queued, &waiter));
        }
        test_trace!(granted, "Acquire::cancel");
        granted
    }
}

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(waiter) = this.waiter.as_ref() {
            let mut state = waiter.state.lock();
            if state.granted {
                drop(state);
                this.waiter = None;
                return Poll::Ready(());
            }

            let will_wake = state
                .waker
                .as_ref()
                .map_or(false, |waker| waker.will_wake(cx.waker()));
            if !will_wake {
                state.waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }

        if this.semaphore.try_acquire() {
            return Poll::Ready(());
        }

        let mut waiters = this.semaphore.waiters.lock();
        if this.semaphore.try_acquire() {
            return Poll::Ready(());
        }

        let waiter = Arc::new(Waiter {
            state: Mutex::new(WaiterState {
                granted: false,
                waker: Some(cx.waker().clone()),
            }),
        });
        waiters.push_back(waiter.clone());
        test_trace!(waiters = waiters.len(), "Acquire::poll -> waiting");
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let mut waiters = self.semaphore.waiters.lock();
        let granted = waiter.state.lock().granted;
        if granted {
            drop(waiters);
            test_trace!("Acquire::drop -> passing on an unobserved permit");
            self.semaphore.release();
            return;
        }

        waiters.retain(|queued| !Arc::ptr_eq(queued, &waiter));
    }
}

impl fmt::Debug for Acquire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquire")
            .field("semaphore", &self.semaphore)
            .field("queued", &self.waiter.is_some())
            .finish()
    }
}

// === impl Waiter ===

impl Waiter {
    fn grant(&self) -> Option<Waker> {
        let mut state = self.state.lock();
        state.granted = true;
        state.waker.take()
    }
}
