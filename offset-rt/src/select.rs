//! Waiting on several channel operations at once.
//!
//! A [`Select`] is built from a list of cases, each a send or a receive on
//! some [`Chan`], plus an optional default. Awaiting [`Select::wait`] runs
//! exactly one case: a ready case chosen uniformly at random if any is
//! ready, otherwise the default, otherwise whichever case becomes ready
//! first. Each case's handler maps its outcome to the select's output.
//!
//! # Examples
//!
//! ```
//! use offset_rt::{Chan, Scheduler, Select};
//!
//! let scheduler = Scheduler::new();
//! let numbers = Chan::new(1);
//! let words: Chan<&str> = Chan::new(1);
//! numbers.try_send(7).unwrap();
//!
//! let picked = scheduler
//!     .block_on(async move {
//!         Select::new()
//!             .recv(&numbers, |n| format!("number {n:?}"))
//!             .recv(&words, |w| format!("word {w:?}"))
//!             .wait()
//!             .await
//!     })
//!     .unwrap();
//! assert_eq!(picked, "number Some(7)");
//! ```
use crate::chan::{
    waiter::{Outcome, Selector, Waiter},
    Chan, Queue, SendError, TryRecvError, TrySendError,
};
use core::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use rand::{seq::SliceRandom, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;


/// A set of channel operations to wait on. See the [module docs](self).
#[must_use = "a `Select` does nothing until `wait` or `try_select` is called"]
pub struct Select<'a, O> {
    cases: Vec<Box<dyn Case<O> + Send + 'a>>,
    default: Option<Box<dyn FnOnce() -> O + Send + 'a>>,
}

/// A future returned by [`Select::wait`].
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct Wait<'a, O> {
    cases: Vec<Option<Box<dyn Case<O> + Send + 'a>>>,
    default: Option<Box<dyn FnOnce() -> O + Send + 'a>>,
    selector: Option<Arc<Selector>>,
}

thread_local! {
    static RNG: RefCell<Xoshiro256PlusPlus> =
        RefCell::new(Xoshiro256PlusPlus::seed_from_u64(rand::random()));
}

/// Reseeds this thread's case-shuffling generator, making the order in
/// which ready cases are tried reproducible.
pub fn reseed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = Xoshiro256PlusPlus::seed_from_u64(seed));
}

fn shuffled(len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    RNG.with(|rng| order.shuffle(&mut *rng.borrow_mut()));
    order
}

/// One arm of a select.
trait Case<O> {
    /// Attempts the operation without waiting. Returns `true` if it
    /// completed.
    fn try_fire(&mut self) -> bool;

    /// Enqueues a waiter for this case on its channel.
    fn register(&mut self, selector: &Arc<Selector>, case: usize, waker: &Waker);

    fn set_waker(&self, waker: &Waker);

    /// Removes this case's waiter from its channel, if it is still queued.
    fn dequeue(&mut self);

    /// Collects the outcome of a case that won while waiting. Returns `false`
    /// if the counterpart that claimed it has not finished yet.
    fn complete(&mut self, waker: &Waker) -> bool;

    /// Runs the handler on the case's outcome.
    fn finish(self: Box<Self>) -> O;
}

struct RecvCase<'a, T, F> {
    chan: &'a Chan<T>,
    handler: F,
    waiter: Option<Arc<Waiter<T>>>,
    outcome: Option<Option<T>>,
}

struct SendCase<'a, T, F> {
    chan: &'a Chan<T>,
    value: Option<T>,
    handler: F,
    waiter: Option<Arc<Waiter<T>>>,
    outcome: Option<Result<(), SendError<T>>>,
}

// === impl Select ===

impl<'a, O> Select<'a, O> {
    /// Returns a new select with no cases.
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    /// Adds a case that receives from `chan`.
    ///
    /// `handler` receives `Some(value)`, or `None` if the channel is closed
    /// and drained.
    pub fn recv<T, F>(mut self, chan: &'a Chan<T>, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Option<T>) -> O + Send + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            chan,
            handler,
            waiter: None,
            outcome: None,
        }));
        self
    }

    /// Adds a case that sends `value` on `chan`.
    ///
    /// `handler` receives `Ok(())` once the value is sent, or
    /// [`SendError::Closed`] with the value if the channel is closed.
    pub fn send<T, F>(mut self, chan: &'a Chan<T>, value: T, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Result<(), SendError<T>>) -> O + Send + 'a,
    {
        self.cases.push(Box::new(SendCase {
            chan,
            value: Some(value),
            handler,
            waiter: None,
            outcome: None,
        }));
        self
    }

    /// Sets the case that runs if no other case is ready.
    ///
    /// A select with a default never waits. Setting a second default
    /// replaces the first.
    pub fn default<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> O + Send + 'a,
    {
        self.default = Some(Box::new(handler));
        self
    }

    /// Returns a future that runs exactly one case.
    ///
    /// A select with no cases and no default never completes.
    ///
    /// # Panics
    ///
    /// If a receive case is woken by its channel closing while the channel
    /// still holds buffered values.
    pub fn wait(self) -> Wait<'a, O> {
        Wait {
            cases: self.cases.into_iter().map(Some).collect(),
            default: self.default,
            selector: None,
        }
    }

    /// Runs a ready case, or the default if no case is ready, without
    /// waiting.
    ///
    /// Returns `None` if nothing was ready and there is no default.
    pub fn try_select(self) -> Option<O> {
        let Self { mut cases, default } = self;
        for i in shuffled(cases.len()) {
            if cases[i].try_fire() {
                return Some(cases.swap_remove(i).finish());
            }
        }
        default.map(|default| default())
    }
}

impl<O> Default for Select<'_, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> fmt::Debug for Select<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .field("default", &self.default.is_some())
            .finish()
    }
}

// === impl Wait ===

impl<O> Wait<'_, O> {
    fn finish(&mut self, case: usize) -> O {
        let Some(case) = self.cases[case].take() else {
            unreachable!("select case {case} finished twice");
        };
        case.finish()
    }

    fn dequeue_all(&mut self) {
        for case in self.cases.iter_mut().flatten() {
            case.dequeue();
        }
    }
}

impl<O> Future for Wait<'_, O> {
    type Output = O;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<O> {
        let this = &mut *self;

        let Some(selector) = this.selector.clone() else {
            let order = shuffled(this.cases.len());
            for &i in &order {
                let fired = this.cases[i].as_mut().is_some_and(|case| case.try_fire());
                if fired {
                    tracing::trace!(case = i, "select case ready");
                    return Poll::Ready(this.finish(i));
                }
            }

            if let Some(default) = this.default.take() {
                tracing::trace!("select default");
                return Poll::Ready(default());
            }

            let selector = Selector::new();
            for &i in &order {
                if let Some(case) = this.cases[i].as_mut() {
                    case.register(&selector, i, cx.waker());
                }
            }
            tracing::trace!(cases = order.len(), "select waiting");
            this.selector = Some(selector);
            return Poll::Pending;
        };

        let Some(winner) = selector.winner() else {
            for case in this.cases.iter().flatten() {
                case.set_waker(cx.waker());
            }
            return Poll::Pending;
        };

        let completed = this.cases[winner]
            .as_mut()
            .is_some_and(|case| case.complete(cx.waker()));
        if !completed {
            return Poll::Pending;
        }

        tracing::trace!(case = winner, "select case won");
        let output = this.finish(winner);
        this.dequeue_all();
        Poll::Ready(output)
    }
}

impl<O> Drop for Wait<'_, O> {
    fn drop(&mut self) {
        self.dequeue_all();
    }
}

impl<O> fmt::Debug for Wait<'_, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("cases", &self.cases.iter().flatten().count())
            .field("default", &self.default.is_some())
            .field("selector", &self.selector)
            .finish()
    }
}

// === impl RecvCase ===

impl<T, F, O> Case<O> for RecvCase<'_, T, F>
where
    F: FnOnce(Option<T>) -> O,
{
    fn try_fire(&mut self) -> bool {
        let result = self.chan.lock().try_recv();
        match result {
            Ok((value, waker)) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                self.outcome = Some(Some(value));
                true
            }
            Err(TryRecvError::Closed) => {
                self.outcome = Some(None);
                true
            }
            Err(TryRecvError::Empty) => false,
        }
    }

    fn register(&mut self, selector: &Arc<Selector>, case: usize, waker: &Waker) {
        let waiter = Waiter::select(None, waker, selector.clone(), case);
        self.chan.lock().enqueue(waiter.clone(), Queue::Recv);
        self.waiter = Some(waiter);
    }

    fn set_waker(&self, waker: &Waker) {
        if let Some(waiter) = &self.waiter {
            waiter.set_waker(waker);
        }
    }

    fn dequeue(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.chan.dequeue(&waiter, Queue::Recv);
        }
    }

    fn complete(&mut self, waker: &Waker) -> bool {
        let Some(waiter) = &self.waiter else {
            return self.outcome.is_some();
        };

        let value = match waiter.poll_claimed(waker) {
            Poll::Pending => return false,
            Poll::Ready(Outcome::Delivered(value)) => value,
            Poll::Ready(Outcome::Closed(_)) => {
                assert!(
                    self.chan.is_empty(),
                    "select receive woken by close while its channel still holds values"
                );
                None
            }
            Poll::Ready(Outcome::Spurious(_)) => {
                unreachable!("a claimed select waiter is never spurious")
            }
        };
        self.waiter = None;
        self.outcome = Some(value);
        true
    }

    fn finish(self: Box<Self>) -> O {
        let Some(outcome) = self.outcome else {
            unreachable!("select receive case finished without an outcome");
        };
        (self.handler)(outcome)
    }
}

// === impl SendCase ===

impl<T, F, O> Case<O> for SendCase<'_, T, F>
where
    F: FnOnce(Result<(), SendError<T>>) -> O,
{
    fn try_fire(&mut self) -> bool {
        let Some(value) = self.value.take() else {
            return false;
        };

        let result = self.chan.lock().try_send(value);
        match result {
            Ok(waker) => {
                if let Some(waker) = waker {
                    waker.wake();
                }
                self.outcome = Some(Ok(()));
                true
            }
            Err(TrySendError::Closed(value)) => {
                self.outcome = Some(Err(SendError::Closed(value)));
                true
            }
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                false
            }
        }
    }

    fn register(&mut self, selector: &Arc<Selector>, case: usize, waker: &Waker) {
        let waiter = Waiter::select(self.value.take(), waker, selector.clone(), case);
        self.chan.lock().enqueue(waiter.clone(), Queue::Send);
        self.waiter = Some(waiter);
    }

    fn set_waker(&self, waker: &Waker) {
        if let Some(waiter) = &self.waiter {
            waiter.set_waker(waker);
        }
    }

    fn dequeue(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.chan.dequeue(&waiter, Queue::Send);
        }
    }

    fn complete(&mut self, waker: &Waker) -> bool {
        let Some(waiter) = &self.waiter else {
            return self.outcome.is_some();
        };

        let outcome = match waiter.poll_claimed(waker) {
            Poll::Pending => return false,
            Poll::Ready(Outcome::Delivered(_)) => Ok(()),
            Poll::Ready(Outcome::Closed(Some(value))) => Err(SendError::Closed(value)),
            Poll::Ready(Outcome::Closed(None) | Outcome::Spurious(_)) => {
                unreachable!("a claimed select sender always keeps or delivers its value")
            }
        };
        self.waiter = None;
        self.outcome = Some(outcome);
        true
    }

    fn finish(self: Box<Self>) -> O {
        let Some(outcome) = self.outcome else {
            unreachable!("select send case finished without an outcome");
        };
        (self.handler)(outcome)
    }
}
