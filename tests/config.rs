use offset::{Config, Scheduler};

// this is the only test in this binary, so setting the environment does not
// race with other tests.
#[test]
fn max_threads_from_env() {
    std::env::set_var(Config::ENV_MAX_THREADS, "5");
    assert_eq!(Config::from_env().max_blocking_threads(), 5);
    assert_eq!(Scheduler::new().config().max_blocking_threads(), 5);

    std::env::set_var(Config::ENV_MAX_THREADS, "1");
    assert_eq!(
        Config::from_env().max_blocking_threads(),
        Config::MIN_BLOCKING_THREADS
    );

    std::env::set_var(Config::ENV_MAX_THREADS, "lots");
    assert_eq!(Config::from_env(), Config::default());

    std::env::remove_var(Config::ENV_MAX_THREADS);
    assert_eq!(Config::from_env(), Config::default());
}
