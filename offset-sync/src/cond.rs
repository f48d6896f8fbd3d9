//! A condition variable for tasks.
//!
//! See the documentation on the [`Cond`] type for details.
use crate::{
    loom::sync::{Arc, Mutex},
    mutex::{MutexGuard, RawMutex},
    semaphore::{Acquire, Semaphore},
};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

#[cfg(test)]
mod tests;

/// A condition variable: a rendezvous point for tasks waiting for, or
/// announcing, a change to state guarded by a [`Mutex`](crate::Mutex).
///
/// [`wait`] atomically releases the guard it is given and parks the task;
/// when the task is woken, it re-locks the mutex before returning. As with
/// any condition variable, a woken task should re-check its predicate in a
/// loop. [`wait_raw`] does the same for a bare [`RawMutex`].
///
/// Waiters are kept in two generations. New waiters join the *new*
/// generation. [`signal`] wakes one task from the *old* generation, first
/// rotating the new generation into the old slot if the old one is empty.
/// This guarantees that a `signal` never wakes a task that started waiting
/// after the `signal` was issued.
///
/// # Examples
///
/// ```
/// use offset_sync::{Cond, Mutex};
/// use tokio_test::{assert_pending, assert_ready, task};
///
/// let ready = Mutex::new(false);
/// let cond = Cond::new();
///
/// let mut waiter = task::spawn(async {
///     let mut ready = ready.lock().await;
///     while !*ready {
///         ready = cond.wait(ready).await;
///     }
/// });
///
/// // the waiter parks, releasing the mutex while it waits
/// assert_pending!(waiter.poll());
/// assert!(!ready.is_locked());
///
/// *ready.try_lock().unwrap() = true;
/// cond.signal();
///
/// assert!(waiter.is_woken());
/// assert_ready!(waiter.poll());
/// ```
///
/// [`wait`]: Cond::wait
/// [`wait_raw`]: Cond::wait_raw
/// [`signal`]: Cond::signal
pub struct Cond {
    generations: Mutex<Generations>,
}

#[derive(Default)]
struct Generations {
    old: Generation,
    new: Generation,
}

#[derive(Default)]
struct Generation {
    waiters: usize,
    sema: Option<Arc<Semaphore>>,
}

/// A task parked on its generation's semaphore.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
struct Waiting<'a> {
    cond: &'a Cond,
    sema: &'a Arc<Semaphore>,
    acquire: Acquire<'a>,
    woken: bool,
}

impl Cond {
    /// Returns a new `Cond` with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generations: Mutex::new(Generations::default()),
        }
    }

    /// Releases `guard`, waits to be woken by [`signal`] or [`broadcast`],
    /// and then re-locks the same mutex.
    ///
    /// # Cancel safety
    ///
    /// Dropping this future while it is parked withdraws the task from its
    /// generation, so later signals are not spent on it. If a signal had
    /// already picked this task, the wakeup is passed on to another waiter.
    ///
    /// [`signal`]: Cond::signal
    /// [`broadcast`]: Cond::broadcast
    pub async fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let sema = self.enqueue();
        drop(guard);
        self.sleep(&sema).await;
        mutex.lock().await
    }

    /// Unlocks `mutex`, waits to be woken by [`signal`] or [`broadcast`],
    /// and then locks `mutex` again.
    ///
    /// This is [`wait`] for code that locks a [`RawMutex`] explicitly rather
    /// than through a guard. It is cancel safe in the same way.
    ///
    /// # Panics
    ///
    /// If `mutex` is not locked.
    ///
    /// [`wait`]: Cond::wait
    /// [`signal`]: Cond::signal
    /// [`broadcast`]: Cond::broadcast
    pub async fn wait_raw(&self, mutex: &RawMutex) {
        let sema = self.enqueue();
        // if `unlock` panics, dropping this uncounts the task again
        let waiting = self.sleep(&sema);
        mutex.unlock();
        waiting.await;
        mutex.lock().await;
    }

    /// Wakes one waiting task, if there is one.
    pub fn signal(&self) {
        let mut generations = self.generations.lock();
        if generations.old.waiters == 0 && generations.new.waiters > 0 {
            let Generations { old, new } = &mut *generations;
            core::mem::swap(old, new);
        }

        let old = &mut generations.old;
        if old.waiters == 0 {
            return;
        }

        old.waiters -= 1;
        let sema = if old.waiters == 0 {
            old.sema.take()
        } else {
            old.sema.clone()
        };

        // released under the lock; a waiter giving up checks for its permit
        // under the same lock.
        test_trace!("Cond::signal -> waking one");
        if let Some(sema) = sema {
            sema.release();
        }
    }

    /// Wakes every task currently waiting.
    pub fn broadcast(&self) {
        let mut generations = self.generations.lock();
        let old = core::mem::take(&mut generations.old);
        let new = core::mem::take(&mut generations.new);

        test_trace!(old = old.waiters, new = new.waiters, "Cond::broadcast");
        for generation in [old, new] {
            if let Some(sema) = generation.sema {
                for _ in 0..generation.waiters {
                    sema.release();
                }
            }
        }
    }

    /// Returns the number of tasks waiting to be signaled.
    #[must_use]
    pub fn waiters(&self) -> usize {
        let generations = self.generations.lock();
        generations.old.waiters + generations.new.waiters
    }

    /// Counts the calling task into the new generation, returning that
    /// generation's semaphore.
    fn enqueue(&self) -> Arc<Semaphore> {
        let mut generations = self.generations.lock();
        let new = &mut generations.new;
        new.waiters += 1;
        test_trace!(waiters = new.waiters, "Cond::wait");
        new.sema
            .get_or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    fn sleep<'a>(&'a self, sema: &'a Arc<Semaphore>) -> Waiting<'a> {
        Waiting {
            cond: self,
            sema,
            acquire: sema.acquire(),
            woken: false,
        }
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let generations = self.generations.lock();
        f.debug_struct("Cond")
            .field("old_waiters", &generations.old.waiters)
            .field("new_waiters", &generations.new.waiters)
            .finish()
    }
}

// === impl Generations ===

impl Generations {
    /// Returns the generation parked on `sema`, if it has not been fully
    /// signaled yet.
    fn parked_on(&mut self, sema: &Arc<Semaphore>) -> Option<&mut Generation> {
        [&mut self.old, &mut self.new].into_iter().find(|generation| {
            generation
                .sema
                .as_ref()
                .map_or(false, |parked| Arc::ptr_eq(parked, sema))
        })
    }
}

// === impl Waiting ===

impl Future for Waiting<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if Pin::new(&mut this.acquire).poll(cx).is_pending() {
            return Poll::Pending;
        }
        this.woken = true;
        Poll::Ready(())
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.woken {
            return;
        }

        let mut generations = self.cond.generations.lock();
        if !self.acquire.cancel() {
            if let Some(generation) = generations.parked_on(self.sema) {
                generation.waiters -= 1;
                if generation.waiters == 0 {
                    generation.sema = None;
                }
                test_trace!(waiters = generation.waiters, "Waiting::drop -> uncounted");
                return;
            }
        }
        drop(generations);

        // a signal was spent on this task, which will never see it
        test_trace!("Waiting::drop -> passing on a wakeup");
        self.cond.signal();
    }
}
