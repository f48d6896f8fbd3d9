//! Waiter nodes queued on a channel by blocked senders, receivers and
//! `select`s.
use core::{
    fmt,
    task::{Poll, Waker},
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering::*},
    Arc,
};

/// A task blocked on a channel operation.
///
/// A sender's waiter carries the value being sent; a receiver's waiter is
/// where a sender delivers its value. A counterpart pops the waiter, moves
/// the value, sets the status and wakes the waiting task.
pub(crate) struct Waiter<T> {
    slot: Mutex<Slot<T>>,
    target: Target,
}

/// The outcome of a wait, as seen by the waiting future.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    /// A counterpart took or delivered the value.
    Delivered(Option<T>),
    /// The channel was closed. A sender gets its value back.
    Closed(Option<T>),
    /// The waiter left its queue with neither outcome.
    Spurious(Option<T>),
}

/// Shared by all of a `select`'s waiters. The first counterpart to claim
/// the selector picks the winning case.
pub(crate) struct Selector {
    winner: AtomicUsize,
}

enum Target {
    Task,
    Select { selector: Arc<Selector>, case: usize },
}

struct Slot<T> {
    value: Option<T>,
    status: Status,
    queued: bool,
    waker: Option<Waker>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Status {
    Waiting,
    Delivered,
    Closed,
}

// === impl Waiter ===

impl<T> Waiter<T> {
    pub(crate) fn task(value: Option<T>, waker: &Waker) -> Arc<Self> {
        Self::new(value, waker, Target::Task)
    }

    pub(crate) fn select(
        value: Option<T>,
        waker: &Waker,
        selector: Arc<Selector>,
        case: usize,
    ) -> Arc<Self> {
        Self::new(value, waker, Target::Select { selector, case })
    }

    fn new(value: Option<T>, waker: &Waker, target: Target) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                value,
                status: Status::Waiting,
                queued: true,
                waker: Some(waker.clone()),
            }),
            target,
        })
    }

    /// Claims this waiter for a counterpart that just popped it off its
    /// queue. Returns `false` if the waiter belongs to a `select` that
    /// another case has already won; such a waiter is stale and is
    /// discarded.
    ///
    /// Must be called with the channel locked.
    pub(crate) fn claim(&self) -> bool {
        let claimed = match &self.target {
            Target::Task => true,
            Target::Select { selector, case } => selector.claim(*case),
        };
        if !claimed {
            self.slot.lock().queued = false;
        }
        claimed
    }

    /// Hands `value` to a claimed receiver.
    pub(crate) fn deliver(&self, value: T) -> Option<Waker> {
        let mut slot = self.slot.lock();
        debug_assert_eq!(slot.status, Status::Waiting);
        slot.value = Some(value);
        slot.status = Status::Delivered;
        slot.queued = false;
        slot.waker.take()
    }

    /// Takes the value out of a claimed sender.
    pub(crate) fn take_value(&self) -> (T, Option<Waker>) {
        let mut slot = self.slot.lock();
        debug_assert_eq!(slot.status, Status::Waiting);
        let Some(value) = slot.value.take() else {
            unreachable!("queued sender carries no value");
        };
        slot.status = Status::Delivered;
        slot.queued = false;
        (value, slot.waker.take())
    }

    /// Marks a claimed waiter as woken by the channel closing.
    pub(crate) fn close(&self) -> Option<Waker> {
        let mut slot = self.slot.lock();
        slot.status = Status::Closed;
        slot.queued = false;
        slot.waker.take()
    }

    /// Marks the waiter as removed from its queue by its own future. Returns
    /// `false` if it was no longer queued.
    pub(crate) fn dequeue(&self) -> bool {
        let mut slot = self.slot.lock();
        let was_queued = slot.queued;
        slot.queued = false;
        was_queued
    }

    /// Checks whether the wait has finished, registering `waker` if not.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Poll<Outcome<T>> {
        let mut slot = self.slot.lock();
        match slot.status {
            Status::Delivered => Poll::Ready(Outcome::Delivered(slot.value.take())),
            Status::Closed => Poll::Ready(Outcome::Closed(slot.value.take())),
            Status::Waiting if slot.queued => {
                match &mut slot.waker {
                    Some(current) if current.will_wake(waker) => {}
                    other => *other = Some(waker.clone()),
                }
                Poll::Pending
            }
            Status::Waiting => Poll::Ready(Outcome::Spurious(slot.value.take())),
        }
    }

    /// Like [`Waiter::poll_outcome`], but for a `select` case that has already
    /// been chosen as the winner: an unfinished wait stays pending.
    pub(crate) fn poll_claimed(&self, waker: &Waker) -> Poll<Outcome<T>> {
        let mut slot = self.slot.lock();
        match slot.status {
            Status::Delivered => Poll::Ready(Outcome::Delivered(slot.value.take())),
            Status::Closed => Poll::Ready(Outcome::Closed(slot.value.take())),
            Status::Waiting => {
                slot.waker = Some(waker.clone());
                Poll::Pending
            }
        }
    }

    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.slot.lock();
        if slot.status != Status::Waiting {
            return;
        }
        match &mut slot.waker {
            Some(current) if current.will_wake(waker) => {}
            other => *other = Some(waker.clone()),
        }
    }
}

impl<T> fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        let mut s = f.debug_struct("Waiter");
        s.field("status", &slot.status)
            .field("queued", &slot.queued)
            .field("has_value", &slot.value.is_some());
        if let Target::Select { case, .. } = self.target {
            s.field("select_case", &case);
        }
        s.finish()
    }
}

// === impl Selector ===

impl Selector {
    const NONE: usize = usize::MAX;

    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            winner: AtomicUsize::new(Self::NONE),
        })
    }

    fn claim(&self, case: usize) -> bool {
        test_dbg!(self
            .winner
            .compare_exchange(Self::NONE, case, AcqRel, Acquire)
            .is_ok())
    }

    /// Returns the index of the winning case, if any case has been claimed.
    pub(crate) fn winner(&self) -> Option<usize> {
        match self.winner.load(Acquire) {
            Self::NONE => None,
            case => Some(case),
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("winner", &self.winner())
            .finish()
    }
}
