//! Runtime configuration.
use std::{env, time::Duration};

/// Configures a [`Scheduler`](crate::Scheduler).
///
/// [`Config::default()`] uses one blocking-pool thread per CPU.
/// [`Config::from_env()`] additionally honors the
/// [`OFFSET_MAX_THREADS`](Config::ENV_MAX_THREADS) environment variable.
///
/// # Examples
///
/// ```
/// use offset_rt::{Config, Scheduler};
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_max_blocking_threads(4)
///     .with_idle_poll_interval(Duration::from_millis(10));
/// let scheduler = Scheduler::with_config(config);
/// assert_eq!(scheduler.config().max_blocking_threads(), 4);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    max_blocking_threads: usize,
    idle_poll_interval: Duration,
    tick_size: usize,
}

impl Config {
    /// The environment variable read by [`Config::from_env`] to size the
    /// blocking-call thread pool.
    pub const ENV_MAX_THREADS: &'static str = "OFFSET_MAX_THREADS";

    /// The blocking pool never has fewer threads than this.
    pub const MIN_BLOCKING_THREADS: usize = 2;

    /// How long the scheduler waits for a blocking call to complete before
    /// re-checking its run queue.
    pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// How many tasks are polled per call to [`Scheduler::tick`].
    ///
    /// [`Scheduler::tick`]: crate::Scheduler::tick
    pub const DEFAULT_TICK_SIZE: usize = 256;

    /// Returns the default configuration, overridden by any valid
    /// `OFFSET_MAX_THREADS` value in the environment.
    ///
    /// Values that are not a non-negative integer are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self::default();
        match env::var(Self::ENV_MAX_THREADS) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(threads) => config.with_max_blocking_threads(threads),
                Err(error) => {
                    tracing::warn!(
                        %error,
                        value = %value,
                        "ignoring invalid {}",
                        Self::ENV_MAX_THREADS
                    );
                    config
                }
            },
            Err(env::VarError::NotPresent) => config,
            Err(error) => {
                tracing::warn!(%error, "ignoring invalid {}", Self::ENV_MAX_THREADS);
                config
            }
        }
    }

    /// Sets the maximum number of threads in the blocking-call pool.
    ///
    /// Values below [`MIN_BLOCKING_THREADS`](Self::MIN_BLOCKING_THREADS) are
    /// raised to it.
    #[must_use]
    pub fn with_max_blocking_threads(self, threads: usize) -> Self {
        Self {
            max_blocking_threads: threads.max(Self::MIN_BLOCKING_THREADS),
            ..self
        }
    }

    /// Sets how long an idle scheduler waits on in-flight blocking calls
    /// before checking its run queue again.
    #[must_use]
    pub fn with_idle_poll_interval(self, interval: Duration) -> Self {
        Self {
            idle_poll_interval: interval,
            ..self
        }
    }

    /// Sets how many tasks are polled per scheduler tick. Zero is treated as
    /// one.
    #[must_use]
    pub fn with_tick_size(self, tick_size: usize) -> Self {
        Self {
            tick_size: tick_size.max(1),
            ..self
        }
    }

    /// Returns the maximum number of threads in the blocking-call pool.
    #[must_use]
    pub fn max_blocking_threads(&self) -> usize {
        self.max_blocking_threads
    }

    /// Returns the idle poll interval.
    #[must_use]
    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    /// Returns the number of tasks polled per tick.
    #[must_use]
    pub fn tick_size(&self) -> usize {
        self.tick_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blocking_threads: num_cpus::get().max(Self::MIN_BLOCKING_THREADS),
            idle_poll_interval: Self::DEFAULT_IDLE_POLL_INTERVAL,
            tick_size: Self::DEFAULT_TICK_SIZE,
        }
    }
}
