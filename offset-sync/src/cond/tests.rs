use super::*;
use crate::{
    loom::{self, future, thread},
    Mutex, RawMutex,
};

#[test]
fn signal_wakes_waiter() {
    loom::model(|| {
        let state = Arc::new((Mutex::new(false), Cond::new()));

        let waiter = thread::spawn({
            let state = state.clone();
            move || {
                future::block_on(async {
                    let (lock, cond) = &*state;
                    let mut ready = lock.lock().await;
                    while !*ready {
                        ready = cond.wait(ready).await;
                    }
                })
            }
        });

        future::block_on(async {
            let (lock, cond) = &*state;
            *lock.lock().await = true;
            cond.signal();
        });

        waiter.join().unwrap();
    })
}

#[cfg(not(loom))]
mod sequential {
    use super::*;
    use crate::util::test::{assert_send_sync, trace_init};
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn cond_is_send_and_sync() {
        assert_send_sync::<Cond>();
    }

    #[test]
    fn wait_releases_and_relocks() {
        let _trace = trace_init();
        let lock = Mutex::new(0);
        let cond = Cond::new();

        let mut waiter = task::spawn(async {
            let guard = lock.lock().await;
            let guard = cond.wait(guard).await;
            *guard
        });
        assert_pending!(waiter.poll());
        assert!(!lock.is_locked(), "waiting released the mutex");
        assert_eq!(cond.waiters(), 1);

        let mut guard = lock.try_lock().unwrap();
        *guard = 42;
        cond.signal();
        assert!(waiter.is_woken());

        // woken, but the mutex is still held by us
        assert_pending!(waiter.poll());
        drop(guard);
        assert!(waiter.is_woken());
        assert_eq!(assert_ready!(waiter.poll()), 42);
    }

    #[test]
    fn signal_without_waiters_is_lost() {
        let _trace = trace_init();
        let lock = Mutex::new(());
        let cond = Cond::new();

        cond.signal();

        let mut waiter = task::spawn(async {
            let guard = lock.lock().await;
            drop(cond.wait(guard).await);
        });
        assert_pending!(waiter.poll());
        assert!(!waiter.is_woken());
    }

    #[test]
    fn signal_wakes_only_earlier_waiters() {
        let _trace = trace_init();
        let lock = Mutex::new(());
        let cond = Cond::new();

        let (lock, cond) = (&lock, &cond);
        let wait = move || async move {
            let guard = lock.lock().await;
            drop(cond.wait(guard).await);
        };

        let mut first = task::spawn(wait());
        let mut second = task::spawn(wait());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        // rotates {first, second} into the old generation and wakes first
        cond.signal();
        assert!(first.is_woken());
        assert!(!second.is_woken());

        // a waiter arriving now joins the new generation...
        let mut third = task::spawn(wait());
        assert_pending!(third.poll());

        // ...so the next signal still goes to `second`
        cond.signal();
        assert!(second.is_woken());
        assert!(!third.is_woken());

        assert_ready!(first.poll());
        assert_ready!(second.poll());

        cond.signal();
        assert!(third.is_woken());
        assert_ready!(third.poll());
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn broadcast_wakes_everyone() {
        let _trace = trace_init();
        let lock = Mutex::new(());
        let cond = Cond::new();

        let (lock, cond) = (&lock, &cond);
        let wait = move || async move {
            let guard = lock.lock().await;
            drop(cond.wait(guard).await);
        };

        let mut waiters = (0..3).map(|_| task::spawn(wait())).collect::<Vec<_>>();
        for waiter in &mut waiters {
            assert_pending!(waiter.poll());
        }
        // split the waiters across both generations
        cond.signal();
        assert_ready!(waiters[0].poll());
        let mut late = task::spawn(wait());
        assert_pending!(late.poll());
        assert_eq!(cond.waiters(), 3);

        cond.broadcast();
        assert_eq!(cond.waiters(), 0);
        assert!(late.is_woken());
        for waiter in &mut waiters[1..] {
            assert!(waiter.is_woken());
            assert_ready!(waiter.poll());
        }
        assert_ready!(late.poll());
    }

    #[test]
    fn dropped_waiter_does_not_spend_a_signal() {
        let _trace = trace_init();
        let lock = Mutex::new(());
        let cond = Cond::new();

        let (lock, cond) = (&lock, &cond);
        let wait = move || async move {
            let guard = lock.lock().await;
            drop(cond.wait(guard).await);
        };

        let mut first = task::spawn(wait());
        let mut dropped = task::spawn(wait());
        assert_pending!(first.poll());
        assert_pending!(dropped.poll());

        cond.signal();
        assert!(first.is_woken());
        assert_ready!(first.poll());

        drop(dropped);
        assert_eq!(cond.waiters(), 0);

        let mut next = task::spawn(wait());
        assert_pending!(next.poll());
        cond.signal();
        assert!(next.is_woken());
        assert_ready!(next.poll());
    }

    #[test]
    fn signaled_waiter_dropped_passes_the_wakeup_on() {
        let _trace = trace_init();
        let lock = Mutex::new(());
        let cond = Cond::new();

        let (lock, cond) = (&lock, &cond);
        let wait = move || async move {
            let guard = lock.lock().await;
            drop(cond.wait(guard).await);
        };

        let mut first = task::spawn(wait());
        let mut second = task::spawn(wait());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        cond.signal();
        assert!(first.is_woken());
        assert!(!second.is_woken());

        // `first` never observes the signal it was given
        drop(first);
        assert!(second.is_woken());
        assert_ready!(second.poll());
        assert_eq!(cond.waiters(), 0);
    }

    #[test]
    fn wait_raw_releases_and_relocks() {
        let _trace = trace_init();
        let mutex = RawMutex::new();
        let cond = Cond::new();

        let mut waiter = task::spawn(async {
            mutex.lock().await;
            cond.wait_raw(&mutex).await;
        });
        assert_pending!(waiter.poll());
        assert!(!mutex.is_locked(), "waiting unlocked the mutex");
        assert_eq!(cond.waiters(), 1);

        cond.signal();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(mutex.is_locked(), "the waiter holds the mutex again");
        mutex.unlock();
    }

    #[test]
    fn wait_raw_on_unlocked_mutex_panics_without_counting() {
        use std::panic::{self, AssertUnwindSafe};

        let _trace = trace_init();
        let mutex = RawMutex::new();
        let cond = Cond::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = task::spawn(cond.wait_raw(&mutex)).poll();
        }));
        assert!(result.is_err());
        assert_eq!(cond.waiters(), 0);
    }
}
