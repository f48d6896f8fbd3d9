use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering::*};

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct State<usize> {
        /// If set, this task is currently being polled.
        pub(crate) const POLLING: bool;

        /// If set, this task was woken while it was being polled, and must be
        /// scheduled again when the poll returns.
        pub(crate) const WOKEN: bool;

        /// If set, this task is parked: it is not in the run queue and will
        /// not be polled until something readies it.
        pub(crate) const SLEEPING: bool;

        /// If set, the wake that arrived during the current poll came from a
        /// completed blocking call, and the task goes to the *front* of the
        /// run queue.
        pub(crate) const PRIORITY: bool;

        /// If set, this task's future has completed.
        pub(crate) const COMPLETED: bool;

        /// If set, this task has been canceled.
        pub(crate) const CANCELED: bool;
    }
}

/// An atomic cell that stores a task's current [`State`].
#[repr(transparent)]
pub(super) struct StateCell(AtomicUsize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task's future completed.
    Ready,

    /// The task was canceled while it was being polled; its future must be
    /// dropped.
    Canceled,

    /// The task is now parked.
    Pending,

    /// The task was woken during the poll and must be re-queued, at the
    /// front of the run queue if `front` is set.
    PendingSchedule { front: bool },

    /// The task had already terminated and was not polled.
    Skipped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum ScheduleAction {
    /// The task should be enqueued.
    Enqueue,

    /// The task does not need to be enqueued.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum CancelAction {
    /// The task was idle; the canceler drops its future.
    DropFuture,

    /// The task is being polled; the future is dropped when that poll
    /// returns.
    Deferred,

    /// The task had already terminated.
    AlreadyDone,
}

impl State {
    #[inline]
    pub(crate) fn is_terminal(self) -> bool {
        self.get(Self::COMPLETED) || self.get(Self::CANCELED)
    }
}

// === impl StateCell ===

impl StateCell {
    pub(super) fn new() -> Self {
        Self(AtomicUsize::new(State::new().0))
    }

    /// Marks the task as being polled. Returns `false` if the task has
    /// already terminated and must not be polled.
    pub(super) fn start_poll(&self) -> bool {
        self.transition(|state| {
            if state.is_terminal() {
                return false;
            }

            debug_assert!(!state.get(State::POLLING), "task polled concurrently");
            state
                .set(State::POLLING, true)
                .set(State::WOKEN, false)
                .set(State::SLEEPING, false)
                .set(State::PRIORITY, false);
            true
        })
    }

    pub(super) fn end_poll(&self, completed: bool) -> PollResult {
        self.transition(|state| {
            debug_assert!(state.get(State::POLLING));
            state.set(State::POLLING, false);

            if completed {
                state.set(State::COMPLETED, true);
                return PollResult::Ready;
            }

            if state.get(State::CANCELED) {
                return PollResult::Canceled;
            }

            if state.get(State::WOKEN) {
                let front = state.get(State::PRIORITY);
                state.set(State::WOKEN, false).set(State::PRIORITY, false);
                return PollResult::PendingSchedule { front };
            }

            state.set(State::SLEEPING, true);
            PollResult::Pending
        })
    }

    /// Wakes the task.
    ///
    /// A sleeping task must be enqueued by the caller; a task being polled
    /// is flagged so that it is re-queued when the poll ends. Waking a
    /// queued or terminated task does nothing.
    pub(super) fn wake(&self, priority: bool) -> ScheduleAction {
        self.transition(|state| {
            if state.is_terminal() {
                return ScheduleAction::None;
            }

            if state.get(State::POLLING) {
                state.set(State::WOKEN, true);
                if priority {
                    state.set(State::PRIORITY, true);
                }
                return ScheduleAction::None;
            }

            if state.get(State::SLEEPING) {
                state.set(State::SLEEPING, false);
                return ScheduleAction::Enqueue;
            }

            ScheduleAction::None
        })
    }

    /// Clears the sleeping flag. Returns `false` if the task was not
    /// sleeping.
    pub(super) fn ready(&self) -> bool {
        self.transition(|state| {
            if state.is_terminal() || !state.get(State::SLEEPING) {
                return false;
            }

            state.set(State::SLEEPING, false);
            true
        })
    }

    pub(super) fn cancel(&self) -> CancelAction {
        self.transition(|state| {
            if state.is_terminal() {
                return CancelAction::AlreadyDone;
            }

            state.set(State::CANCELED, true).set(State::SLEEPING, false);
            if state.get(State::POLLING) {
                CancelAction::Deferred
            } else {
                CancelAction::DropFuture
            }
        })
    }

    pub(super) fn load(&self, order: core::sync::atomic::Ordering) -> State {
        State(self.0.load(order))
    }

    /// Advance this task's state by running the provided
    /// `transition` function on the current [`State`].
    #[cfg_attr(test, track_caller)]
    fn transition<T>(&self, mut transition: impl FnMut(&mut State) -> T) -> T {
        let mut current = self.load(Acquire);
        loop {
            test_trace!("StateCell::transition; current:\n{}", current);
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if test_dbg!(current.0 == next.0) {
                return res;
            }

            test_trace!("StateCell::transition; next:\n{}", next);
            match self
                .0
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return res,
                Err(actual) => current = State(actual),
            }
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}
