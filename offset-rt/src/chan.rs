//! Go-style channels.
//!
//! A [`Chan`] is a FIFO queue of values shared by any number of sending and
//! receiving tasks. A channel created with a capacity of zero is
//! *unbuffered*: a send completes only once a receiver takes the value. A
//! channel with capacity `C` buffers up to `C` values before senders block.
//!
//! Closing a channel is terminal. Blocked senders fail with
//! [`SendError::Closed`], and receivers drain whatever is still buffered
//! before observing the close as `Ok(None)`.
//!
//! # Examples
//!
//! ```
//! use offset_rt::{Chan, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let chan = Chan::new(0);
//!
//! let tx = chan.clone();
//! scheduler.spawn(async move {
//!     for i in 1..=3 {
//!         tx.send(i).await.unwrap();
//!     }
//!     tx.close();
//! });
//!
//! let total = scheduler
//!     .block_on(async move {
//!         let mut total = 0;
//!         while let Some(i) = chan.recv().await.unwrap() {
//!             total += i;
//!         }
//!         total
//!     })
//!     .unwrap();
//! assert_eq!(total, 6);
//! ```
use self::waiter::{Outcome, Waiter};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use parking_lot::{Mutex, MutexGuard};
use std::{collections::VecDeque, sync::Arc};

pub(crate) mod waiter;
#[cfg(test)]
mod tests;

/// A multi-producer, multi-consumer channel.
///
/// `Chan` is a cheaply cloneable handle; all clones refer to the same
/// channel.
pub struct Chan<T> {
    inner: Arc<Inner<T>>,
}

/// A future returned by [`Chan::send`].
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct SendFuture<'a, T> {
    chan: &'a Chan<T>,
    value: Option<T>,
    waiter: Option<Arc<Waiter<T>>>,
}

/// A future returned by [`Chan::recv`].
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct RecvFuture<'a, T> {
    chan: &'a Chan<T>,
    yielded: bool,
    waiter: Option<Arc<Waiter<T>>>,
}

/// Errors returned by [`Chan::send`]. Both variants hand the unsent value
/// back.
#[derive(Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SendError<T> {
    /// The channel is closed.
    #[error("send on closed channel")]
    Closed(T),
    /// The sender was removed from the channel's wait queue without its value
    /// being taken.
    #[error("sender woken without its value being taken")]
    Spurious(T),
}

/// Errors returned by [`Chan::try_send`].
#[derive(Clone, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TrySendError<T> {
    /// Sending would block.
    #[error("channel is full")]
    Full(T),
    /// The channel is closed.
    #[error("send on closed channel")]
    Closed(T),
}

/// Errors returned by [`Chan::recv`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RecvError {
    /// The receiver was removed from the channel's wait queue without a value
    /// being delivered.
    #[error("receiver woken without a value")]
    Spurious,
}

/// Errors returned by [`Chan::try_recv`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TryRecvError {
    /// Receiving would block.
    #[error("channel is empty")]
    Empty,
    /// The channel is closed and drained.
    #[error("channel is closed")]
    Closed,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    capacity: usize,
}

pub(crate) struct State<T> {
    buf: VecDeque<T>,
    capacity: usize,
    closed: bool,
    recvq: VecDeque<Arc<Waiter<T>>>,
    sendq: VecDeque<Arc<Waiter<T>>>,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Queue {
    Send,
    Recv,
}

// === impl Chan ===

impl<T> Chan<T> {
    /// Returns a new channel with room for `capacity` buffered values.
    ///
    /// A capacity of zero creates an unbuffered channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buf: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                    recvq: VecDeque::new(),
                    sendq: VecDeque::new(),
                }),
                capacity,
            }),
        }
    }

    /// Sends `value` on this channel, waiting for buffer space or a receiver
    /// if necessary.
    ///
    /// If a receiver is already waiting, the value is handed to it directly
    /// and the send completes immediately, without waiting for the receiver
    /// to run.
    ///
    /// # Errors
    ///
    /// - [`SendError::Closed`] if the channel is closed, either before the
    ///   send or while it was waiting.
    /// - [`SendError::Spurious`] if the waiting sender was woken with neither
    ///   outcome.
    ///
    /// # Cancellation
    ///
    /// Dropping the future before it completes removes the sender from the
    /// channel's queue. If the send was waiting, the value was not sent.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            chan: self,
            value: Some(value),
            waiter: None,
        }
    }

    /// Receives the next value from this channel, waiting for one if
    /// necessary.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained. A receive
    /// from a buffered channel yields to the scheduler once before taking a
    /// buffered value.
    ///
    /// # Errors
    ///
    /// [`RecvError::Spurious`] if the waiting receiver was woken without a
    /// value.
    ///
    /// # Cancellation
    ///
    /// This future is cancel safe: no value is lost if it is dropped before
    /// completing.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            chan: self,
            yielded: false,
            waiter: None,
        }
    }

    /// Sends `value` without waiting.
    ///
    /// # Errors
    ///
    /// - [`TrySendError::Full`] if no receiver is waiting and the buffer is
    ///   full (always the case for an unbuffered channel with no receiver).
    /// - [`TrySendError::Closed`] if the channel is closed.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let waker = self.lock().try_send(value)?;
        wake(waker);
        Ok(())
    }

    /// Receives a value without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryRecvError::Empty`] if no value is buffered and no sender is
    ///   waiting.
    /// - [`TryRecvError::Closed`] if the channel is closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let (value, waker) = self.lock().try_recv()?;
        wake(waker);
        Ok(value)
    }

    /// Closes the channel, waking every waiting sender and receiver.
    ///
    /// Returns `false` if the channel was already closed. Closing is
    /// terminal; a channel cannot be reopened.
    pub fn close(&self) -> bool {
        let wakers = {
            let mut state = self.lock();
            let state = &mut *state;
            if state.closed {
                return false;
            }
            state.closed = true;

            let waiters = state.recvq.drain(..).chain(state.sendq.drain(..));
            let wakers: Vec<Waker> = waiters
                .filter(|waiter| waiter.claim())
                .filter_map(|waiter| waiter.close())
                .collect();
            tracing::trace!(woken = wakers.len(), buffered = state.buf.len(), "channel closed");
            wakers
        };

        wakers.into_iter().for_each(Waker::wake);
        true
    }

    /// Returns `true` if the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns the number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    /// Returns `true` if no values are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    /// Returns the channel's buffer capacity. Zero means unbuffered.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the number of senders waiting on this channel.
    #[must_use]
    pub fn waiting_senders(&self) -> usize {
        self.lock().sendq.len()
    }

    /// Returns the number of receivers waiting on this channel.
    #[must_use]
    pub fn waiting_receivers(&self) -> usize {
        self.lock().recvq.len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock()
    }

    /// Removes `waiter` from one of this channel's queues, if it is still
    /// queued.
    pub(crate) fn dequeue(&self, waiter: &Arc<Waiter<T>>, queue: Queue) {
        let mut state = self.lock();
        if !waiter.dequeue() {
            return;
        }
        let queue = match queue {
            Queue::Send => &mut state.sendq,
            Queue::Recv => &mut state.recvq,
        };
        queue.retain(|queued| !Arc::ptr_eq(queued, waiter));
        test_trace!(?waiter, "dequeued waiter");
    }
}

impl<T, E> Chan<Result<T, E>> {
    /// Sends an error on a channel of results.
    ///
    /// The receiving task gets `Ok(Some(Err(error)))` and typically
    /// propagates it with `?`.
    ///
    /// # Errors
    ///
    /// See [`Chan::send`].
    pub async fn poison(&self, error: E) -> Result<(), SendError<Result<T, E>>> {
        self.send(Err(error)).await
    }
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Chan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Chan")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.buf.len())
            .field("closed", &state.closed)
            .field("waiting_senders", &state.sendq.len())
            .field("waiting_receivers", &state.recvq.len())
            .finish()
    }
}

// === impl State ===

impl<T> State<T> {
    pub(crate) fn try_send(&mut self, value: T) -> Result<Option<Waker>, TrySendError<T>> {
        if self.closed {
            return Err(TrySendError::Closed(value));
        }

        if let Some(receiver) = pop_claimed(&mut self.recvq) {
            test_trace!(?receiver, "handing value to waiting receiver");
            return Ok(receiver.deliver(value));
        }

        if self.buf.len() < self.capacity {
            self.buf.push_back(value);
            return Ok(None);
        }

        Err(TrySendError::Full(value))
    }

    pub(crate) fn try_recv(&mut self) -> Result<(T, Option<Waker>), TryRecvError> {
        if let Some(value) = self.buf.pop_front() {
            // the buffer has room again; refill it from the first waiting
            // sender.
            let waker = pop_claimed(&mut self.sendq).and_then(|sender| {
                let (queued, waker) = sender.take_value();
                self.buf.push_back(queued);
                waker
            });
            return Ok((value, waker));
        }

        if let Some(sender) = pop_claimed(&mut self.sendq) {
            test_trace!(?sender, "taking value from waiting sender");
            return Ok(sender.take_value());
        }

        if self.closed {
            return Err(TryRecvError::Closed);
        }

        Err(TryRecvError::Empty)
    }

    pub(crate) fn enqueue(&mut self, waiter: Arc<Waiter<T>>, queue: Queue) {
        test_trace!(?waiter, ?queue, "enqueued waiter");
        match queue {
            Queue::Send => self.sendq.push_back(waiter),
            Queue::Recv => self.recvq.push_back(waiter),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Pops the first waiter that can still be claimed, discarding stale
/// `select` waiters.
fn pop_claimed<T>(queue: &mut VecDeque<Arc<Waiter<T>>>) -> Option<Arc<Waiter<T>>> {
    while let Some(waiter) = queue.pop_front() {
        if waiter.claim() {
            return Some(waiter);
        }
        test_trace!(?waiter, "discarded stale select waiter");
    }
    None
}

fn wake(waker: Option<Waker>) {
    if let Some(waker) = waker {
        waker.wake();
    }
}

// === impl SendFuture ===

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(waiter) = this.waiter.as_ref() {
            let outcome = match waiter.poll_outcome(cx.waker()) {
                Poll::Ready(outcome) => outcome,
                Poll::Pending => return Poll::Pending,
            };
            this.waiter = None;
            return Poll::Ready(match outcome {
                Outcome::Delivered(_) => Ok(()),
                Outcome::Closed(Some(value)) => Err(SendError::Closed(value)),
                Outcome::Spurious(Some(value)) => {
                    tracing::warn!("sender woken without its value being taken");
                    Err(SendError::Spurious(value))
                }
                Outcome::Closed(None) | Outcome::Spurious(None) => {
                    unreachable!("waiting sender lost its value")
                }
            });
        }

        let Some(value) = this.value.take() else {
            panic!("`SendFuture` polled after it completed");
        };

        let mut state = this.chan.lock();
        match state.try_send(value) {
            Ok(waker) => {
                drop(state);
                wake(waker);
                Poll::Ready(Ok(()))
            }
            Err(TrySendError::Closed(value)) => Poll::Ready(Err(SendError::Closed(value))),
            Err(TrySendError::Full(value)) => {
                let waiter = Waiter::task(Some(value), cx.waker());
                state.enqueue(waiter.clone(), Queue::Send);
                this.waiter = Some(waiter);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.chan.dequeue(&waiter, Queue::Send);
        }
    }
}

// the value is never pinned.
impl<T> Unpin for SendFuture<'_, T> {}

impl<T> fmt::Debug for SendFuture<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendFuture")
            .field("chan", &self.chan)
            .field("waiter", &self.waiter)
            .finish()
    }
}

// === impl RecvFuture ===

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<Option<T>, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(waiter) = this.waiter.as_ref() {
            let outcome = match waiter.poll_outcome(cx.waker()) {
                Poll::Ready(outcome) => outcome,
                Poll::Pending => return Poll::Pending,
            };
            this.waiter = None;
            return Poll::Ready(match outcome {
                Outcome::Delivered(value) => Ok(value),
                Outcome::Closed(_) => Ok(None),
                Outcome::Spurious(_) => {
                    tracing::warn!("receiver woken without a value");
                    Err(RecvError::Spurious)
                }
            });
        }

        let mut state = this.chan.lock();
        if !this.yielded && !state.is_empty() {
            this.yielded = true;
            drop(state);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        match state.try_recv() {
            Ok((value, waker)) => {
                drop(state);
                wake(waker);
                Poll::Ready(Ok(Some(value)))
            }
            Err(TryRecvError::Closed) => Poll::Ready(Ok(None)),
            Err(TryRecvError::Empty) => {
                let waiter = Waiter::task(None, cx.waker());
                state.enqueue(waiter.clone(), Queue::Recv);
                this.waiter = Some(waiter);
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.chan.dequeue(&waiter, Queue::Recv);
        }
    }
}

impl<T> fmt::Debug for RecvFuture<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvFuture")
            .field("chan", &self.chan)
            .field("yielded", &self.yielded)
            .field("waiter", &self.waiter)
            .finish()
    }
}

// === impl SendError ===

impl<T> SendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(value) | Self::Spurious(value) => value,
        }
    }

    /// Returns `true` if the send failed because the channel is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Spurious(_) => f.write_str("Spurious(..)"),
        }
    }
}

// === impl TrySendError ===

impl<T> TrySendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }

    /// Returns `true` if the send failed because the channel is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}
