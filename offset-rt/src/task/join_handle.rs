use super::{TaskId, TaskRef};
use core::{
    any::Any,
    fmt,
    future::Future,
    mem,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;

/// An owned permission to await the output of a spawned task.
///
/// A `JoinHandle` is a future that resolves to the task's output once the
/// task completes, or to a [`JoinError`] if the task panicked or was
/// canceled. Dropping a `JoinHandle` *detaches* the task: it keeps running,
/// and its output is discarded.
pub struct JoinHandle<T> {
    task: TaskRef,
    slot: Arc<JoinSlot<T>>,
}

/// Errors returned by awaiting a [`JoinHandle`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum JoinError {
    /// The task was canceled before it completed.
    #[error("task {id} was canceled")]
    Canceled {
        /// The canceled task.
        id: TaskId,
    },

    /// The task panicked.
    #[error("task {id} panicked: {message}")]
    Panicked {
        /// The task that panicked.
        id: TaskId,
        /// The panic's message, if it had a string payload.
        message: String,
    },
}

pub(crate) struct JoinSlot<T> {
    state: Mutex<JoinState<T>>,
}

enum JoinState<T> {
    Waiting(Option<Waker>),
    Ready(Result<T, JoinError>),
    Taken,
}

/// Delivers a task's output to its [`JoinSlot`]. If it is dropped without
/// delivering anything, the task's future was dropped early, and the slot
/// receives [`JoinError::Canceled`].
struct Completion<T> {
    id: TaskId,
    slot: Option<Arc<JoinSlot<T>>>,
}

/// Wraps `future` so that its output, or its panic, is delivered to the
/// returned [`JoinSlot`].
pub(crate) fn instrument<F>(
    id: TaskId,
    future: F,
) -> (
    Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    Arc<JoinSlot<F::Output>>,
)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let slot = Arc::new(JoinSlot {
        state: Mutex::new(JoinState::Waiting(None)),
    });
    let mut completion = Completion {
        id,
        slot: Some(slot.clone()),
    };

    let task = async move {
        let output = AssertUnwindSafe(future).catch_unwind().await;
        let output = output.map_err(|panic| {
            let message = panic_message(&*panic);
            tracing::error!(task.id = %id, %message, "task panicked");
            JoinError::Panicked { id, message }
        });
        completion.complete(output);
    };

    (Box::pin(task), slot)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        return (*message).to_owned();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    String::from("<non-string panic payload>")
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef, slot: Arc<JoinSlot<T>>) -> Self {
        Self { task, slot }
    }

    /// Returns the [`TaskId`] of the task this handle joins.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Returns a [`TaskRef`] for the task this handle joins.
    #[inline]
    #[must_use]
    pub fn task_ref(&self) -> &TaskRef {
        &self.task
    }

    /// Cancels the task. See [`TaskRef::cancel`].
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Returns `true` once the task's output (or error) is available.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !matches!(*self.slot.state.lock(), JoinState::Waiting(_))
    }

    /// Takes the task's output without waiting, if it is available.
    pub(crate) fn try_take(&mut self) -> Option<Result<T, JoinError>> {
        let mut state = self.slot.state.lock();
        match mem::replace(&mut *state, JoinState::Taken) {
            JoinState::Ready(output) => Some(output),
            other => {
                *state = other;
                None
            }
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        match mem::replace(&mut *state, JoinState::Taken) {
            JoinState::Ready(output) => Poll::Ready(output),
            JoinState::Waiting(_) => {
                *state = JoinState::Waiting(Some(cx.waker().clone()));
                Poll::Pending
            }
            JoinState::Taken => panic!("JoinHandle polled after it completed"),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .field("complete", &self.is_complete())
            .finish()
    }
}

// === impl JoinError ===

impl JoinError {
    /// Returns the [`TaskId`] of the task that failed.
    #[must_use]
    pub fn id(&self) -> TaskId {
        match self {
            Self::Canceled { id } | Self::Panicked { id, .. } => *id,
        }
    }

    /// Returns `true` if the task was canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Returns `true` if the task panicked.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

// === impl Completion ===

impl<T> Completion<T> {
    fn complete(&mut self, output: Result<T, JoinError>) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        let waker = {
            let mut state = slot.state.lock();
            match mem::replace(&mut *state, JoinState::Ready(output)) {
                JoinState::Waiting(waker) => waker,
                already => {
                    *state = already;
                    None
                }
            }
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.complete(Err(JoinError::Canceled { id: self.id }));
        }
    }
}
