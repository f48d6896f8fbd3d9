use super::JoinHandle;
use crate::Scheduler;
use core::{future::Future, panic::Location};

/// Builds a new [task] with custom configuration.
///
/// A `Builder` is returned by [`Scheduler::build_task`]. It can set a name
/// and a kind for the task, which appear in its [`tracing`] spans, before
/// spawning it.
///
/// # Examples
///
/// ```
/// use offset_rt::Scheduler;
///
/// let scheduler = Scheduler::new();
/// let join = scheduler
///     .build_task()
///     .name("answer")
///     .spawn(async { 42 });
///
/// scheduler.run();
/// assert!(join.is_complete());
/// ```
///
/// [task]: crate::task
/// [`Scheduler::build_task`]: crate::Scheduler::build_task
#[derive(Debug, Clone)]
pub struct Builder<'a> {
    scheduler: &'a Scheduler,
    settings: Settings<'a>,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings<'a> {
    pub(super) name: Option<&'a str>,
    pub(super) kind: &'static str,
    pub(super) location: Option<Location<'static>>,
}

impl<'a> Builder<'a> {
    pub(crate) const fn new(scheduler: &'a Scheduler) -> Self {
        Self {
            scheduler,
            settings: Settings::new(),
        }
    }

    /// Adds a name to the tasks spawned by this builder.
    ///
    /// The name is recorded on the `poll` span of every poll of the task.
    pub fn name(self, name: &'a str) -> Self {
        Self {
            settings: Settings {
                name: Some(name),
                ..self.settings
            },
            ..self
        }
    }

    /// Adds a static string which describes the type of the spawned task,
    /// such as `"main"` or `"worker"`.
    pub fn kind(self, kind: &'static str) -> Self {
        Self {
            settings: Settings {
                kind,
                ..self.settings
            },
            ..self
        }
    }

    /// Overrides the source code location recorded as the task's spawn
    /// location. By default, the caller of [`spawn`](Self::spawn) is used.
    pub fn location(self, location: Location<'static>) -> Self {
        Self {
            settings: Settings {
                location: Some(location),
                ..self.settings
            },
            ..self
        }
    }

    /// Spawns a new task with this builder's configured settings.
    ///
    /// Returns a [`JoinHandle`] that resolves to the future's output.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut settings = self.settings.clone();
        if settings.location.is_none() {
            settings.location = Some(*Location::caller());
        }
        self.scheduler.spawn_with(settings, future)
    }
}

impl Settings<'_> {
    pub(crate) const fn new() -> Self {
        Self {
            name: None,
            kind: "task",
            location: None,
        }
    }
}
