//! An asynchronous [mutual exclusion lock].
//!
//! See the documentation on the [`Mutex`] type for details.
//!
//! [mutual exclusion lock]: https://en.wikipedia.org/wiki/Mutual_exclusion
use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicUsize, Ordering::*},
    },
    semaphore::Semaphore,
};
use core::{
    fmt,
    ops::{Deref, DerefMut},
};


mycelium_bitfield::bitfield! {
    /// A snapshot of a [`RawMutex`]'s lock word.
    #[derive(PartialEq, Eq)]
    struct State<usize> {
        /// The mutex is held.
        const LOCKED: bool;

        /// A parked task has been released and is about to retry the lock.
        ///
        /// While this is set, `unlock` does not release another waiter.
        const WOKEN: bool;

        /// The number of tasks parked on the mutex's semaphore.
        const WAITERS = ..;
    }
}

const LOCKED_BIT: usize = State::LOCKED.first_bit();
const WOKEN_BIT: usize = State::WOKEN.first_bit();
const WAITER: usize = State::WAITERS.first_bit();

/// A mutual exclusion lock that protects no data.
///
/// This is the lock used by [`Mutex`], exposed on its own for code which
/// needs to lock and unlock explicitly. A [`Cond`] can wait on it with
/// [`Cond::wait_raw`].
///
/// The lock word packs a `LOCKED` bit, a `WOKEN` bit and a count of parked
/// waiters. An uncontended [`lock`] is a single compare-and-swap. A contended
/// one registers as a waiter and parks on an internal [`Semaphore`]. When
/// [`unlock`] sees waiters and nobody already on their way to retry, it
/// releases exactly one of them, which then competes for the lock again.
///
/// This lock is **not** fair: a task arriving while a released waiter is
/// being rescheduled may take the lock first, in which case the waiter parks
/// again.
///
/// # Cancel safety
///
/// Dropping a pending [`lock`] future is allowed. If the dropped task had
/// already been released by an `unlock`, the next task to contend for the
/// lock absorbs that stale wakeup and retries.
///
/// [`lock`]: RawMutex::lock
/// [`unlock`]: RawMutex::unlock
/// [`Cond`]: crate::Cond
/// [`Cond::wait_raw`]: crate::Cond::wait_raw
pub struct RawMutex {
    state: AtomicUsize,
    sema: Semaphore,
}

/// An asynchronous mutual exclusion lock protecting a value of type `T`.
///
/// [`lock`] waits asynchronously until the lock is free and returns a
/// [`MutexGuard`]; the lock is released when the guard is dropped.
///
/// # Examples
///
/// ```
/// use offset_sync::Mutex;
/// # tokio_test::block_on(async {
///
/// let lock = Mutex::new(1);
/// {
///     let mut guard = lock.lock().await;
///     *guard += 1;
/// }
/// assert_eq!(*lock.lock().await, 2);
/// # });
/// ```
///
/// [`lock`]: Mutex::lock
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

/// An RAII guard granting exclusive access to the value in a [`Mutex`].
///
/// The mutex is unlocked when this guard is dropped.
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

// === impl RawMutex ===

impl RawMutex {
    /// Returns a new, unlocked `RawMutex`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            sema: Semaphore::new(0),
        }
    }

    /// Locks the mutex, waiting until it is available.
    pub async fn lock(&self) {
        if self
            .state
            .compare_exchange(0, LOCKED_BIT, Acquire, Relaxed)
            .is_ok()
        {
            test_trace!("RawMutex::lock -> uncontended");
            return;
        }

        self.lock_slow().await
    }

    async fn lock_slow(&self) {
        let mut awoke = false;
        let mut old = self.load();
        loop {
            let mut new = old;
            new.set(State::LOCKED, true);
            if old.get(State::LOCKED) {
                new = State(new.0 + WAITER);
            }
            if awoke {
                // we were released by an unlock, so the flag is ours to clear
                // whether or not we get the lock this time.
                new.set(State::WOKEN, false);
            }

            match self
                .state
                .compare_exchange_weak(old.0, new.0, AcqRel, Relaxed)
            {
                Ok(_) if !old.get(State::LOCKED) => {
                    test_trace!(awoke, "RawMutex::lock -> acquired");
                    return;
                }
                Ok(_) => {
                    test_trace!(state = ?new, "RawMutex::lock -> parking");
                    self.sema.acquire().await;
                    awoke = true;
                    old = self.load();
                }
                Err(actual) => old = State(actual),
            }
        }
    }

    /// Attempts to lock the mutex without waiting.
    ///
    /// Returns `true` if the lock was acquired.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let old = self.load();
        if old.get(State::LOCKED) {
            return false;
        }
        self.state
            .compare_exchange(old.0, old.0 | LOCKED_BIT, Acquire, Relaxed)
            .is_ok()
    }

    /// Unlocks the mutex, releasing one parked task if there is one and no
    /// other task is already on its way to retry.
    ///
    /// # Panics
    ///
    /// If the mutex is not locked.
    #[track_caller]
    pub fn unlock(&self) {
        let prev = State(self.state.fetch_and(!LOCKED_BIT, Release));
        if !prev.get(State::LOCKED) {
            panic!("unlock of unlocked mutex");
        }

        let mut old = State(prev.0 & !LOCKED_BIT);
        loop {
            if old.get(State::WAITERS) == 0 || old.get(State::LOCKED) || old.get(State::WOKEN) {
                return;
            }

            let new = State((old.0 - WAITER) | WOKEN_BIT);
            match self
                .state
                .compare_exchange_weak(old.0, new.0, Release, Relaxed)
            {
                Ok(_) => {
                    test_trace!(state = ?new, "RawMutex::unlock -> releasing a waiter");
                    self.sema.release();
                    return;
                }
                Err(actual) => old = State(actual),
            }
        }
    }

    /// Returns `true` if the mutex is currently locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.load().get(State::LOCKED)
    }

    fn load(&self) -> State {
        State(self.state.load(Relaxed))
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.load();
        f.debug_struct("RawMutex")
            .field("locked", &state.get(State::LOCKED))
            .field("woken", &state.get(State::WOKEN))
            .field("waiters", &state.get(State::WAITERS))
            .finish()
    }
}

// === impl Mutex ===

impl<T> Mutex<T> {
    /// Returns a new, unlocked `Mutex` protecting `data`.
    #[must_use]
    pub fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks this mutex, waiting until it is available.
    ///
    /// Returns a [`MutexGuard`] which unlocks the mutex when dropped.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock().await;
        MutexGuard { mutex: self }
    }

    /// Attempts to lock this mutex without waiting.
    ///
    /// Returns `None` if the mutex is already locked.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Returns `true` if this mutex is currently locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

// === impl MutexGuard ===

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Returns the [`Mutex`] this guard locks. Used to re-lock after a
    /// [`Cond::wait`](crate::Cond::wait) releases the guard.
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: holding the guard means we hold the lock.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: holding the guard means we hold the lock.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}
