//! Internal utilities: tracing helpers and shared test scaffolding.

#[cfg(all(not(test), not(offset_ultraverbose)))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(any(test, offset_ultraverbose))]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(all(not(test), not(offset_ultraverbose)))]
macro_rules! test_trace {
    ($($t:tt)*) => {};
}

#[cfg(any(test, offset_ultraverbose))]
macro_rules! test_trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}
