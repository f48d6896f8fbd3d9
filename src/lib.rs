#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

use core::future::Future;

#[doc(inline)]
pub use offset_rt::{
    blocking, chan, config, future, scheduler, select, task, yield_now, Blocking, BlockingError,
    Chan, Config, Drained, JoinError, JoinHandle, RecvError, RunError, Scheduler, Select,
    SendError, TaskId, TaskRef, Tick, TryRecvError, TrySendError,
};

/// Synchronization primitives for tasks.
///
/// This module re-exports the [`offset_sync`] crate.
pub mod sync {
    #[doc(inline)]
    pub use offset_sync::*;
}

/// Runs an application on a new [`Scheduler`] configured from the
/// environment.
///
/// `f` receives a handle to the scheduler and returns the main future. The
/// scheduler runs until the main future completes. Any tasks still alive at
/// that point are canceled, and the blocking pool is shut down.
///
/// # Errors
///
/// - [`RunError::Deadlock`] if every task parks before the main future
///   completes.
/// - [`RunError::Join`] if the main future panics.
///
/// # Examples
///
/// ```
/// use offset::Chan;
///
/// let sum = offset::run(|scheduler| async move {
///     let chan = Chan::new(0);
///     let tx = chan.clone();
///     scheduler.spawn(async move {
///         for i in 1..=4 {
///             tx.send(i).await.unwrap();
///         }
///         tx.close();
///     });
///
///     let mut sum = 0;
///     while let Some(i) = chan.recv().await.unwrap() {
///         sum += i;
///     }
///     sum
/// })
/// .unwrap();
///
/// assert_eq!(sum, 10);
/// ```
#[track_caller]
pub fn run<F, Fut>(f: F) -> Result<Fut::Output, RunError>
where
    F: FnOnce(Scheduler) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    run_with_config(Config::from_env(), f)
}

/// Like [`run`], but with an explicit [`Config`].
///
/// # Errors
///
/// See [`run`].
#[track_caller]
pub fn run_with_config<F, Fut>(config: Config, f: F) -> Result<Fut::Output, RunError>
where
    F: FnOnce(Scheduler) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let scheduler = Scheduler::with_config(config);
    let _span = tracing::info_span!("offset").entered();
    tracing::debug!(config = ?scheduler.config(), "starting runtime");

    let result = scheduler.block_on(f(scheduler.clone()));
    match &result {
        Ok(_) => tracing::debug!(remaining = scheduler.tasks(), "main task completed"),
        Err(error) => tracing::warn!(%error, "main task failed"),
    }

    // tasks holding scheduler handles would otherwise keep it alive.
    scheduler.stop();
    result
}
