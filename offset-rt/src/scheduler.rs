//! The cooperative task scheduler.
//!
//! A [`Scheduler`] owns a FIFO run queue of [tasks] and polls them one at a
//! time on the thread that drives it. Tasks run until they yield
//! ([`Poll::Pending`]); a task that yields without having been woken is
//! *parked*, and leaves the run queue until it is woken or
//! [readied](crate::task::TaskRef::ready).
//!
//! The scheduler is driven by calling [`Scheduler::tick`],
//! [`Scheduler::run`], or [`Scheduler::block_on`]. Real blocking work is
//! moved off the scheduler thread with [`Scheduler::blocking`].
//!
//! [tasks]: crate::task
//! [`Poll::Pending`]: core::task::Poll::Pending
use crate::{
    blocking::{Blocking, CallId, Pool},
    config::Config,
    task::{self, Builder, JoinError, JoinHandle, PollResult, Settings, TaskId, TaskRef},
};
use core::{fmt, future::Future};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::*},
        Arc,
    },
};
use tracing::{debug, debug_span, trace, warn};


/// A cooperative, single-threaded task scheduler.
///
/// `Scheduler` is a cheaply cloneable handle; every clone refers to the same
/// run queue. Tasks usually hold a clone so that they can spawn more tasks or
/// make blocking calls.
///
/// # Examples
///
/// ```
/// use offset_rt::Scheduler;
///
/// let scheduler = Scheduler::new();
/// let answer = scheduler.block_on(async { 6 * 7 }).unwrap();
/// assert_eq!(answer, 42);
/// ```
#[derive(Clone)]
pub struct Scheduler(Arc<Core>);

/// Metrics recorded during a scheduler tick.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Tick {
    /// The total number of tasks polled on this scheduler tick.
    pub polled: usize,

    /// The number of polled tasks that *completed* on this scheduler tick.
    ///
    /// This should always be <= `self.polled`.
    pub completed: usize,

    /// `true` if the tick completed with any tasks remaining in the run queue.
    pub has_remaining: bool,

    /// The number of tasks that were spawned since the last tick.
    pub spawned: usize,

    /// The number of tasks that were woken or readied from outside of their
    /// own `poll` calls since the last tick.
    pub woken_external: usize,

    /// The number of tasks that were woken from within their own poll calls
    /// during this tick.
    pub woken_internal: usize,
}

/// Returned by [`Scheduler::run`] once the run queue is empty and no
/// blocking calls are in flight.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Drained {
    /// The number of tasks that are still parked, with nothing left that could
    /// wake them from inside the scheduler.
    pub parked: usize,
}

/// Errors returned by [`Scheduler::block_on`].
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    /// Every task is parked and no blocking call is in flight, so the main
    /// future can never complete.
    #[error("all tasks are asleep; deadlock ({parked} tasks parked)")]
    Deadlock {
        /// The number of parked tasks, including the main task.
        parked: usize,
    },

    /// The main future panicked or was canceled.
    #[error(transparent)]
    Join(#[from] JoinError),
}

pub(crate) struct Core {
    run_queue: Mutex<VecDeque<TaskRef>>,
    /// Every task spawned on this scheduler that has not yet terminated.
    tasks: Mutex<HashMap<TaskId, TaskRef>>,
    current_task: Mutex<Option<TaskRef>>,
    /// Tasks waiting on blocking calls, keyed by call.
    blocking: Mutex<HashMap<CallId, TaskRef>>,
    next_call: AtomicU64,
    pool: Pool,
    /// Pinged whenever a task is enqueued, so that an idle scheduler waiting
    /// on blocking calls notices.
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
    config: Config,
    spawned: AtomicUsize,
    woken_external: AtomicUsize,
    stopped: AtomicBool,
}

// === impl Scheduler ===

impl Scheduler {
    /// Returns a new scheduler configured by [`Config::from_env`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::from_env())
    }

    /// Returns a new scheduler with the provided [`Config`].
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        Self(Arc::new(Core {
            run_queue: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(HashMap::new()),
            current_task: Mutex::new(None),
            blocking: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
            pool: Pool::new(config.max_blocking_threads()),
            notify_tx,
            notify_rx,
            config,
            spawned: AtomicUsize::new(0),
            woken_external: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Returns this scheduler's [`Config`].
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Spawns a new task on this scheduler, returning a [`JoinHandle`] for its
    /// output.
    ///
    /// The task is appended to the back of the run queue; nothing is polled
    /// until the scheduler is driven.
    #[inline]
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.build_task().spawn(future)
    }

    /// Returns a new [task `Builder`] for configuring tasks prior to spawning
    /// them on this scheduler.
    ///
    /// [task `Builder`]: task::Builder
    #[must_use]
    pub fn build_task(&self) -> Builder<'_> {
        Builder::new(self)
    }

    pub(crate) fn spawn_with<F>(&self, settings: Settings<'_>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = TaskId::next();
        let (future, slot) = task::instrument(id, future);
        let task = TaskRef::new(id, settings, Arc::downgrade(&self.0), future);
        trace!(
            task.id = %id,
            task.name = task.name(),
            task.kind = task.kind(),
            spawned_at = ?task.spawned_at(),
            "spawned task"
        );

        self.0.tasks.lock().insert(id, task.clone());
        self.0.spawned.fetch_add(1, Relaxed);
        self.0.run_queue.lock().push_back(task.clone());
        self.0.notify();

        JoinHandle::new(task, slot)
    }

    /// Polls up to [`Config::tick_size`] tasks from the run queue.
    ///
    /// Tasks woken during the tick (including those that yield) are appended
    /// to the run queue and may be polled again in the same tick.
    pub fn tick(&self) -> Tick {
        self.0.tick_n(self.0.config.tick_size())
    }

    /// Runs the scheduler until its run queue is empty and no blocking calls
    /// are in flight.
    ///
    /// While blocking calls are in flight, an idle scheduler waits for them
    /// for up to [`Config::idle_poll_interval`] at a time.
    pub fn run(&self) -> Drained {
        loop {
            let tick = self.tick();
            if tick.has_remaining || self.0.wait_for_blocking() {
                continue;
            }
            if self.0.run_queue.lock().is_empty() {
                break;
            }
        }

        let parked = self.tasks();
        if parked > 0 {
            warn!(parked, "scheduler drained with parked tasks");
        }
        Drained { parked }
    }

    /// Spawns `future` as the main task, and runs the scheduler until it
    /// completes.
    ///
    /// Other tasks that are still running or parked when the main task
    /// completes are left in place; call [`Scheduler::stop`] to cancel them.
    ///
    /// # Errors
    ///
    /// - [`RunError::Deadlock`] if every task is parked while the main task
    ///   has not completed, and no blocking call is in flight.
    /// - [`RunError::Join`] if the main task panicked or was canceled.
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, RunError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut main = self.build_task().name("main").kind("main").spawn(future);
        loop {
            let tick = self.tick();
            if let Some(output) = main.try_take() {
                return output.map_err(RunError::from);
            }

            if tick.has_remaining || self.0.wait_for_blocking() {
                continue;
            }

            // a task may have been woken from another thread since the tick.
            if !self.0.run_queue.lock().is_empty() {
                continue;
            }

            let parked = self.tasks();
            warn!(parked, "all tasks are asleep");
            return Err(RunError::Deadlock { parked });
        }
    }

    /// Stops the scheduler.
    ///
    /// Every live task is canceled, the run queue is cleared, and the
    /// blocking pool stops accepting calls. Pool threads still running a call
    /// are not waited for.
    pub fn stop(&self) {
        self.0.stopped.store(true, Release);
        let tasks: Vec<TaskRef> = self.0.tasks.lock().drain().map(|(_, task)| task).collect();
        self.0.blocking.lock().clear();

        let canceled = tasks.iter().filter(|task| task.cancel()).count();
        // dropping a canceled future may have woken other tasks.
        self.0.run_queue.lock().clear();
        self.0.pool.shutdown();
        debug!(canceled, "scheduler stopped");
    }

    /// Runs `f` on the blocking-call thread pool, parking the current task
    /// until it returns.
    ///
    /// The returned [`Blocking`] future must be awaited from a task running
    /// on this scheduler.
    ///
    /// # Examples
    ///
    /// ```
    /// use offset_rt::Scheduler;
    ///
    /// let scheduler = Scheduler::new();
    /// let handle = scheduler.clone();
    /// let sum = scheduler
    ///     .block_on(async move { handle.blocking(|| (1..=10).sum::<u32>()).await })
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(sum, 55);
    /// ```
    pub fn blocking<F, T>(&self, f: F) -> Blocking<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Blocking::new(self.0.clone(), f)
    }

    /// Returns a [`TaskRef`] for the task currently being polled, if any.
    #[must_use]
    pub fn current_task(&self) -> Option<TaskRef> {
        self.0.current_task()
    }

    /// Returns the number of live tasks: tasks that have been spawned and
    /// have neither completed nor been canceled.
    #[must_use]
    pub fn tasks(&self) -> usize {
        self.0.tasks.lock().len()
    }

    /// Returns the number of blocking calls in flight.
    #[must_use]
    pub fn blocking_calls(&self) -> usize {
        self.0.blocking.lock().len()
    }

    /// Returns `true` if [`Scheduler::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.is_stopped()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.0).finish()
    }
}

// === impl Core ===

impl Core {
    pub(crate) fn current_task(&self) -> Option<TaskRef> {
        self.current_task.lock().clone()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Acquire)
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Schedules a woken or readied task, at the front of the run queue if
    /// `front` is set.
    pub(crate) fn enqueue(&self, task: TaskRef, front: bool) {
        self.woken_external.fetch_add(1, Relaxed);
        {
            let mut run_queue = self.run_queue.lock();
            if front {
                run_queue.push_front(task);
            } else {
                run_queue.push_back(task);
            }
        }
        self.notify();
    }

    pub(crate) fn deregister(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
    }

    pub(crate) fn register_blocking(&self, task: TaskRef) -> CallId {
        let call = CallId(self.next_call.fetch_add(1, Relaxed));
        trace!(?call, task.id = %task.id(), "blocking call submitted");
        self.blocking.lock().insert(call, task);
        call
    }

    /// Called on a pool thread when a blocking call returns.
    pub(crate) fn complete_blocking(&self, call: CallId) {
        {
            // wake before the call leaves the map: an idle scheduler must
            // always see either the call or the woken task.
            let mut blocking = self.blocking.lock();
            match blocking.remove(&call) {
                Some(task) => {
                    trace!(?call, task.id = %task.id(), "blocking call completed");
                    task.wake_priority();
                }
                None => trace!(?call, "blocking call completed with no waiting task"),
            }
        }
        self.notify();
    }

    pub(crate) fn forget_blocking(&self, call: CallId) {
        self.blocking.lock().remove(&call);
    }

    fn notify(&self) {
        // a full channel means a notification is already pending.
        let _ = self.notify_tx.try_send(());
    }

    /// If any blocking calls are in flight, waits up to the idle poll
    /// interval for something to be enqueued and returns `true`.
    fn wait_for_blocking(&self) -> bool {
        if self.blocking.lock().is_empty() {
            return false;
        }

        if !self.run_queue.lock().is_empty() {
            return true;
        }

        let _ = self.notify_rx.recv_timeout(self.config.idle_poll_interval());
        true
    }

    fn tick_n(&self, n: usize) -> Tick {
        let mut tick = Tick::default();

        while tick.polled < n {
            let Some(task) = self.run_queue.lock().pop_front() else {
                break;
            };

            let _span = debug_span!(
                "poll",
                task.id = %task.id(),
                task.name = task.name(),
                task.kind = task.kind(),
            )
            .entered();

            *self.current_task.lock() = Some(task.clone());
            let poll_result = task.poll();
            *self.current_task.lock() = None;

            match poll_result {
                PollResult::Ready => {
                    tick.completed += 1;
                    self.deregister(task.id());
                }
                PollResult::Canceled => self.deregister(task.id()),
                PollResult::PendingSchedule { front } => {
                    let mut run_queue = self.run_queue.lock();
                    if front {
                        run_queue.push_front(task);
                    } else {
                        run_queue.push_back(task);
                    }
                    tick.woken_internal += 1;
                }
                PollResult::Pending => {}
                // the task was canceled or is being polled elsewhere; a stale
                // run queue entry is not a poll.
                PollResult::Skipped => continue,
            }

            tick.polled += 1;
            debug!(poll = ?poll_result, tick.polled, tick.completed);
        }

        tick.has_remaining = !self.run_queue.lock().is_empty();
        tick.spawned = self.spawned.swap(0, Relaxed);
        tick.woken_external = self.woken_external.swap(0, Relaxed);

        // log scheduler metrics.
        debug!(
            tick.polled,
            tick.completed,
            tick.spawned,
            tick.woken_external,
            tick.woken_internal,
            tick.has_remaining
        );

        tick
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("run_queue", &self.run_queue.lock().len())
            .field("tasks", &self.tasks.lock().len())
            .field("current_task", &self.current_task.lock().as_ref().map(TaskRef::id))
            .field("blocking", &self.blocking.lock().len())
            .field("pool", &self.pool)
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
