//! Waiting for a collection of tasks to finish.
//!
//! See the documentation on the [`WaitGroup`] type for details.
use crate::{
    loom::sync::{
        atomic::{AtomicIsize, Ordering::*},
        Arc, Mutex,
    },
    semaphore::Semaphore,
};
use core::fmt;


/// Waits for a counter of outstanding work to reach zero.
///
/// The owner [`add`]s the number of tasks to wait for, each of those tasks
/// calls [`done`] when it finishes, and [`wait`] parks until the counter is
/// back at zero. Every task parked in `wait` when the counter reaches zero
/// is woken.
///
/// # Examples
///
/// ```
/// use offset_sync::WaitGroup;
/// # tokio_test::block_on(async {
///
/// let wg = WaitGroup::new();
/// wg.add(2);
/// wg.done();
/// wg.done();
/// wg.wait().await;
/// assert_eq!(wg.counter(), 0);
/// # });
/// ```
///
/// [`add`]: WaitGroup::add
/// [`done`]: WaitGroup::done
/// [`wait`]: WaitGroup::wait
pub struct WaitGroup {
    counter: AtomicIsize,
    waiters: AtomicIsize,
    sema: Mutex<Option<Arc<Semaphore>>>,
}

impl WaitGroup {
    /// Returns a new `WaitGroup` with a counter of zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicIsize::new(0),
            waiters: AtomicIsize::new(0),
            sema: Mutex::new(None),
        }
    }

    /// Adds `delta`, which may be negative, to the counter.
    ///
    /// If the counter becomes zero, every task parked in [`wait`] is woken.
    ///
    /// # Panics
    ///
    /// If the counter becomes negative.
    ///
    /// [`wait`]: WaitGroup::wait
    #[track_caller]
    pub fn add(&self, delta: isize) {
        let counter = test_dbg!(self.counter.fetch_add(delta, SeqCst) + delta);
        if counter < 0 {
            panic!("negative WaitGroup counter");
        }
        if counter > 0 || self.waiters.load(SeqCst) == 0 {
            return;
        }

        let mut sema = self.sema.lock();
        if self.counter.load(SeqCst) == 0 {
            let waiters = self.waiters.swap(0, SeqCst);
            if let Some(sema) = sema.take() {
                test_trace!(waiters, "WaitGroup::add -> releasing waiters");
                for _ in 0..waiters {
                    sema.release();
                }
            }
        }
    }

    /// Decrements the counter by one.
    ///
    /// # Panics
    ///
    /// If the counter becomes negative.
    #[track_caller]
    pub fn done(&self) {
        self.add(-1);
    }

    /// Waits until the counter is zero.
    ///
    /// Returns immediately if it already is.
    pub async fn wait(&self) {
        if self.counter.load(SeqCst) == 0 {
            return;
        }

        let sema = {
            let mut sema = self.sema.lock();
            self.waiters.fetch_add(1, SeqCst);
            if self.counter.load(SeqCst) == 0 {
                self.waiters.fetch_sub(1, SeqCst);
                return;
            }
            sema.get_or_insert_with(|| Arc::new(Semaphore::new(0)))
                .clone()
        };

        test_trace!("WaitGroup::wait -> parking");
        sema.acquire().await;
    }

    /// Returns the current value of the counter.
    #[must_use]
    pub fn counter(&self) -> isize {
        self.counter.load(SeqCst)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGroup")
            .field("counter", &self.counter())
            .field("waiters", &self.waiters.load(Relaxed))
            .finish()
    }
}
