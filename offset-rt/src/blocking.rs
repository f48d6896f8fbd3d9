//! Offloading blocking calls to a bounded thread pool.
//!
//! Tasks never block the scheduler thread. A task that must make a real
//! blocking call (file I/O, a DNS lookup, a long computation) passes it to
//! [`Scheduler::blocking`], which runs it on a pool thread and parks the task
//! until it returns. See [`Blocking`] for details.
//!
//! [`Scheduler::blocking`]: crate::Scheduler::blocking
use crate::scheduler::Core;
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Arc,
    },
    thread,
};


/// Identifies one in-flight blocking call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct CallId(pub(crate) u64);

/// Errors returned by awaiting a [`Blocking`] future.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BlockingError {
    /// The call was awaited outside of a task running on the scheduler that
    /// created it.
    #[error("blocking call awaited outside of a task on its scheduler")]
    NoCurrentTask,

    /// The scheduler has been stopped, and its pool no longer accepts work.
    #[error("scheduler has been stopped")]
    Shutdown,

    /// The pool had no threads and could not start one.
    #[error("failed to spawn a blocking pool thread")]
    Spawn(#[source] std::io::Error),
}

/// A blocking call running on the scheduler's thread pool.
///
/// Returned by [`Scheduler::blocking`]. The first poll submits the call to
/// the pool and parks the awaiting task. When the call returns, the pool
/// thread re-admits the task at the *front* of the run queue, so the task
/// resumes before anything that was already runnable.
///
/// If the call panics, the panic is resumed in the awaiting task.
///
/// Dropping this future before the call returns does not interrupt the call;
/// its result is discarded.
///
/// [`Scheduler::blocking`]: crate::Scheduler::blocking
#[must_use = "futures do nothing unless `.await`ed or polled"]
pub struct Blocking<T> {
    core: Arc<Core>,
    job: Option<Box<dyn FnOnce() -> T + Send + 'static>>,
    call: Option<CallId>,
    output: Arc<Mutex<Option<thread::Result<T>>>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A lazily grown pool of worker threads, at most `max_threads` strong.
pub(crate) struct Pool {
    jobs: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    max_threads: usize,
    threads: AtomicUsize,
    idle: Arc<AtomicUsize>,
}

// === impl Blocking ===

impl<T: Send + 'static> Blocking<T> {
    pub(crate) fn new<F>(core: Arc<Core>, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            core,
            job: Some(Box::new(f)),
            call: None,
            output: Arc::new(Mutex::new(None)),
        }
    }

    fn submit(&mut self, job: Box<dyn FnOnce() -> T + Send + 'static>) -> Result<(), BlockingError> {
        let Some(task) = self.core.current_task() else {
            return Err(BlockingError::NoCurrentTask);
        };
        if self.core.is_stopped() {
            return Err(BlockingError::Shutdown);
        }

        let call = self.core.register_blocking(task);
        let output = self.output.clone();
        let core = Arc::downgrade(&self.core);
        let job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            *output.lock() = Some(result);
            if let Some(core) = core.upgrade() {
                core.complete_blocking(call);
            }
        });

        if let Err(error) = self.core.pool().submit(job) {
            self.core.forget_blocking(call);
            return Err(error);
        }

        self.call = Some(call);
        Ok(())
    }
}

impl<T: Send + 'static> Future for Blocking<T> {
    type Output = Result<T, BlockingError>;

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(job) = this.job.take() {
            // the task is parked without registering its waker; the pool
            // thread wakes it through the blocking map instead.
            return match this.submit(job) {
                Ok(()) => Poll::Pending,
                Err(error) => Poll::Ready(Err(error)),
            };
        }

        let output = this.output.lock().take();
        match output {
            Some(Ok(output)) => {
                this.call = None;
                Poll::Ready(Ok(output))
            }
            Some(Err(panic)) => {
                this.call = None;
                panic::resume_unwind(panic)
            }
            None if this.call.is_some() => Poll::Pending,
            None => panic!("`Blocking` polled after it completed"),
        }
    }
}

impl<T> Drop for Blocking<T> {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            self.core.forget_blocking(call);
        }
    }
}

impl<T> fmt::Debug for Blocking<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocking")
            .field("submitted", &self.job.is_none())
            .field("call", &self.call)
            .finish()
    }
}

// === impl Pool ===

impl Pool {
    pub(crate) fn new(max_threads: usize) -> Self {
        let (jobs, receiver) = crossbeam_channel::unbounded();
        Self {
            jobs: Mutex::new(Some(jobs)),
            receiver,
            max_threads,
            threads: AtomicUsize::new(0),
            idle: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), BlockingError> {
        let jobs = self.jobs.lock();
        let Some(sender) = jobs.as_ref() else {
            return Err(BlockingError::Shutdown);
        };

        if self.idle.load(Acquire) == 0 && self.threads.load(Acquire) < self.max_threads {
            if let Err(error) = self.spawn_worker() {
                if self.threads.load(Acquire) == 0 {
                    return Err(BlockingError::Spawn(error));
                }
                tracing::warn!(%error, "failed to grow blocking pool; queueing call");
            }
        }

        sender.send(job).map_err(|_| BlockingError::Shutdown)
    }

    /// Stops accepting work. Threads finish the calls already queued and
    /// then exit; nobody waits for them.
    pub(crate) fn shutdown(&self) {
        if self.jobs.lock().take().is_some() {
            tracing::debug!(threads = self.threads(), "blocking pool shut down");
        }
    }

    pub(crate) fn threads(&self) -> usize {
        self.threads.load(Acquire)
    }

    fn spawn_worker(&self) -> std::io::Result<()> {
        let id = self.threads.fetch_add(1, AcqRel);
        let receiver = self.receiver.clone();
        let idle = self.idle.clone();
        let spawned = thread::Builder::new()
            .name(format!("offset-blocking-{id}"))
            .spawn(move || worker(id, receiver, idle));

        match spawned {
            Ok(_) => {
                tracing::debug!(worker = id, max = self.max_threads, "spawned blocking pool thread");
                Ok(())
            }
            Err(error) => {
                self.threads.fetch_sub(1, AcqRel);
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("threads", &self.threads())
            .field("idle", &self.idle.load(Relaxed))
            .field("max_threads", &self.max_threads)
            .field("queued", &self.receiver.len())
            .field("shut_down", &self.jobs.lock().is_none())
            .finish()
    }
}

fn worker(id: usize, jobs: Receiver<Job>, idle: Arc<AtomicUsize>) {
    let _span = tracing::debug_span!("blocking_worker", worker = id).entered();
    loop {
        idle.fetch_add(1, AcqRel);
        let job = jobs.recv();
        idle.fetch_sub(1, AcqRel);

        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
    tracing::debug!("blocking pool thread exiting");
}
