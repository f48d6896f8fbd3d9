//! The `offset` task type and the handles used to refer to it.
//!
//! A task is a boxed `Future<Output = ()>` plus the bookkeeping the
//! [scheduler] needs to run it: a unique [`TaskId`], an optional name, and an
//! atomic state word. Tasks are spawned with [`Scheduler::spawn`] or a task
//! [`Builder`], which return a [`JoinHandle`] for awaiting the task's output.
//!
//! A task that returns [`Poll::Pending`] without having been woken is
//! *parked*: it leaves the run queue and is not polled again until it is
//! [readied](TaskRef::ready) or its [`Waker`] is woken.
//!
//! [scheduler]: crate::scheduler
//! [`Scheduler::spawn`]: crate::Scheduler::spawn
mod builder;
mod id;
mod join_handle;
mod state;


pub use self::{
    builder::Builder,
    id::TaskId,
    join_handle::{JoinError, JoinHandle},
};
pub use crate::future::{park, Park};

pub(crate) use self::{builder::Settings, join_handle::instrument, state::PollResult};

use self::state::{CancelAction, ScheduleAction, State, StateCell};
use crate::scheduler::Core;
use core::{
    fmt,
    future::Future,
    panic::Location,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::Mutex;
use std::sync::{atomic::Ordering::*, Arc, Weak};

/// A type-erased, reference-counted handle to a spawned task.
///
/// `TaskRef`s are cheap to clone. Holding one does not keep the task from
/// completing, but it does keep its bookkeeping alive.
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

/// An error returned by [`TaskRef::ready`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ReadyError {
    /// The task was not parked. Only a sleeping task can be readied.
    #[error("task {0} is not sleeping")]
    NotSleeping(TaskId),
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(crate) struct Task {
    id: TaskId,
    name: Option<String>,
    kind: &'static str,
    spawned_at: Option<Location<'static>>,
    state: StateCell,
    scheduler: Weak<Core>,
    future: Mutex<Option<BoxFuture>>,
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(
        id: TaskId,
        settings: Settings<'_>,
        scheduler: Weak<Core>,
        future: BoxFuture,
    ) -> Self {
        Self(Arc::new(Task {
            id,
            name: settings.name.map(String::from),
            kind: settings.kind,
            spawned_at: settings.location,
            state: StateCell::new(),
            scheduler,
            future: Mutex::new(Some(future)),
        }))
    }

    /// Returns this task's unique [`TaskId`].
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    /// Returns this task's name, if it was given one by a [`Builder`].
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Returns the kind of task this is (`"task"` unless set by a
    /// [`Builder`]).
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.0.kind
    }

    /// Returns `true` if this task has completed or been canceled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns `true` if this task is parked.
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.state().get(State::SLEEPING)
    }

    /// Readies a parked task, appending it to the back of its scheduler's run
    /// queue.
    ///
    /// This never polls the task itself.
    ///
    /// # Errors
    ///
    /// [`ReadyError::NotSleeping`] if the task is not parked: it is queued,
    /// running, or has terminated.
    pub fn ready(&self) -> Result<(), ReadyError> {
        if !test_dbg!(self.0.state.ready()) {
            return Err(ReadyError::NotSleeping(self.id()));
        }

        if let Some(scheduler) = self.0.scheduler.upgrade() {
            scheduler.enqueue(self.clone(), false);
        }
        Ok(())
    }

    /// Cancels this task.
    ///
    /// The task's future is dropped, which abandons whatever it was waiting
    /// on. If the task is being polled right now (that is, a task is
    /// canceling itself), the future is dropped as soon as that poll returns.
    /// Its [`JoinHandle`] resolves to [`JoinError::Canceled`].
    ///
    /// Returns `false` if the task had already terminated.
    pub fn cancel(&self) -> bool {
        match test_dbg!(self.0.state.cancel()) {
            CancelAction::AlreadyDone => false,
            CancelAction::Deferred => true,
            CancelAction::DropFuture => {
                tracing::trace!(task.id = %self.id(), "canceled task");
                self.drop_future();
                if let Some(scheduler) = self.0.scheduler.upgrade() {
                    scheduler.deregister(self.id());
                }
                true
            }
        }
    }

    pub(crate) fn poll(&self) -> PollResult {
        if !self.0.state.start_poll() {
            return PollResult::Skipped;
        }

        let waker = Waker::from(self.0.clone());
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let mut future = self.0.future.lock();
            match future.as_mut() {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            }
        };

        let result = self.0.state.end_poll(poll.is_ready());
        if matches!(result, PollResult::Ready | PollResult::Canceled) {
            self.drop_future();
        }
        result
    }

    /// Wakes this task on behalf of a completed blocking call, so that it
    /// resumes at the front of the run queue.
    pub(crate) fn wake_priority(&self) {
        self.0.wake_inner(true)
    }

    pub(crate) fn spawned_at(&self) -> Option<Location<'static>> {
        self.0.spawned_at
    }

    fn drop_future(&self) {
        // take the future out before dropping it, so that its destructor
        // runs without the lock held.
        let future = self.0.future.lock().take();
        drop(future);
    }

    fn state(&self) -> State {
        self.0.state.load(Acquire)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.0.state)
            .finish()
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TaskRef {}

// === impl Task ===

impl Task {
    fn wake_inner(self: &Arc<Self>, priority: bool) {
        if self.state.wake(priority) != ScheduleAction::Enqueue {
            return;
        }

        test_trace!(task.id = %self.id, priority, "waking sleeping task");
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.enqueue(TaskRef(self.clone()), priority);
        }
    }
}

impl std::task::Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_inner(false)
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_inner(false)
    }
}
