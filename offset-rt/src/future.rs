//! Futures for suspending the current task.
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A future that yields to the scheduler one or more times before completing.
///
/// Each yield wakes the task before returning [`Poll::Pending`], so the task
/// goes to the back of the run queue rather than being parked.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct Yield {
    yields: usize,
}

/// A future that parks the current task once.
///
/// The first poll returns [`Poll::Pending`] *without* registering the task's
/// waker anywhere, so the scheduler marks the task as sleeping. It is not
/// polled again until some other party readies it with
/// [`TaskRef::ready`](crate::task::TaskRef::ready) or wakes it. The poll
/// after that completes the future.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct Park {
    parked: bool,
}

impl Future for Yield {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let yields = &mut self.as_mut().yields;
        if *yields == 0 {
            return Poll::Ready(());
        }
        *yields -= 1;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl Yield {
    /// Returns a new future that yields `yields` times before completing.
    #[inline]
    pub const fn new(yields: usize) -> Self {
        Self { yields }
    }
}

/// Yield to the scheduler a single time before proceeding.
#[inline]
pub fn yield_now() -> Yield {
    Yield::new(1)
}

impl Future for Park {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            return Poll::Ready(());
        }
        self.parked = true;
        Poll::Pending
    }
}

/// Parks the current task until something readies it.
///
/// # Examples
///
/// ```
/// use offset_rt::{task, Scheduler};
///
/// let scheduler = Scheduler::new();
/// let sleeper = scheduler.spawn(task::park());
///
/// scheduler.tick();
/// assert!(sleeper.task_ref().is_sleeping());
///
/// sleeper.task_ref().ready().unwrap();
/// scheduler.tick();
/// assert!(sleeper.is_complete());
/// ```
#[inline]
pub fn park() -> Park {
    Park { parked: false }
}
