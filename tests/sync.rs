mod support;

use offset::{
    sync::{Cond, Mutex, Once, RwLock, Semaphore, WaitGroup},
    yield_now,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use support::{settle, trace_init};

const TASKS: usize = 8;

#[test]
fn once_runs_exactly_once() {
    let _trace = trace_init();
    let calls = offset::run(|scheduler| async move {
        let once = Arc::new(Once::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..TASKS)
            .map(|_| {
                let (once, calls) = (once.clone(), calls.clone());
                scheduler.spawn(async move {
                    once.call_once_async(|| async {
                        // give the other tasks a chance to pile up.
                        yield_now().await;
                        calls.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
                    assert!(once.is_completed());
                })
            })
            .collect();

        for join in joins {
            join.await.unwrap();
        }
        calls.load(Ordering::SeqCst)
    })
    .unwrap();

    assert_eq!(calls, 1);
}

#[test]
fn wait_group_waits_for_zero() {
    let _trace = trace_init();
    offset::run(|scheduler| async move {
        let wg = Arc::new(WaitGroup::new());
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..TASKS {
            wg.add(1);
            let (wg, finished) = (wg.clone(), finished.clone());
            scheduler.spawn(async move {
                offset::future::Yield::new(i).await;
                finished.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }

        wg.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), TASKS);
        assert_eq!(wg.counter(), 0);

        // waiting on a zero counter returns immediately.
        wg.wait().await;
    })
    .unwrap();
}

#[test]
#[should_panic(expected = "negative WaitGroup counter")]
fn wait_group_negative_counter() {
    let wg = WaitGroup::new();
    wg.add(1);
    wg.done();
    wg.done();
}

#[test]
fn mutex_is_exclusive_and_fifo() {
    let _trace = trace_init();
    let (order, max_holders) = offset::run(|scheduler| async move {
        let lock = Arc::new(Mutex::new(Vec::new()));
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let guard = lock.lock().await;
        let joins: Vec<_> = (0..TASKS)
            .map(|i| {
                let (lock, holders, max_holders) =
                    (lock.clone(), holders.clone(), max_holders.clone());
                scheduler.spawn(async move {
                    let mut order = lock.lock().await;
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);

                    order.push(i);
                    yield_now().await;

                    holders.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        // everyone queues up behind the main task.
        settle(2).await;
        drop(guard);

        for join in joins {
            join.await.unwrap();
        }
        let order = lock.lock().await.clone();
        (order, max_holders.load(Ordering::SeqCst))
    })
    .unwrap();

    assert_eq!(order, (0..TASKS).collect::<Vec<_>>());
    assert_eq!(max_holders, 1);
}

#[test]
fn rwlock_readers_share_writers_exclude() {
    let _trace = trace_init();
    offset::run(|scheduler| async move {
        let lock = Arc::new(RwLock::new(0usize));
        let readers = Arc::new(AtomicUsize::new(0));
        let max_readers = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..TASKS)
            .map(|_| {
                let (lock, readers, max_readers) =
                    (lock.clone(), readers.clone(), max_readers.clone());
                scheduler.spawn(async move {
                    let value = lock.read().await;
                    let now = readers.fetch_add(1, Ordering::SeqCst) + 1;
                    max_readers.fetch_max(now, Ordering::SeqCst);
                    yield_now().await;
                    readers.fetch_sub(1, Ordering::SeqCst);
                    *value
                })
            })
            .collect();

        for join in joins {
            assert_eq!(join.await.unwrap(), 0);
        }
        assert_eq!(max_readers.load(Ordering::SeqCst), TASKS);

        // a pending writer blocks new readers.
        let reader = lock.read().await;
        let writer = scheduler.spawn({
            let lock = lock.clone();
            async move {
                *lock.write().await += 1;
            }
        });
        settle(1).await;
        assert!(!writer.is_complete());
        assert!(lock.try_read().is_none());

        let late_reader = scheduler.spawn({
            let lock = lock.clone();
            async move { *lock.read().await }
        });
        drop(reader);

        writer.await.unwrap();
        // the late reader waited for the writer.
        assert_eq!(late_reader.await.unwrap(), 1);
    })
    .unwrap();
}

#[test]
fn semaphore_is_fifo() {
    let _trace = trace_init();
    let order = offset::run(|scheduler| async move {
        let sem = Arc::new(Semaphore::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let joins: Vec<_> = (0..TASKS)
            .map(|i| {
                let (sem, order) = (sem.clone(), order.clone());
                scheduler.spawn(async move {
                    sem.acquire().await;
                    order.lock().push(i);
                })
            })
            .collect();

        settle(2).await;
        assert_eq!(sem.waiters(), TASKS);

        for _ in 0..TASKS {
            sem.release();
        }
        for join in joins {
            join.await.unwrap();
        }

        let order = order.lock().clone();
        order
    })
    .unwrap();

    assert_eq!(order, (0..TASKS).collect::<Vec<_>>());
}

#[test]
fn semaphore_bounds_concurrency() {
    const PERMITS: usize = 3;

    let _trace = trace_init();
    let max = offset::run(|scheduler| async move {
        let sem = Arc::new(Semaphore::new(PERMITS));
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..TASKS * 2)
            .map(|_| {
                let (sem, active, max) = (sem.clone(), active.clone(), max.clone());
                scheduler.spawn(async move {
                    sem.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    offset::future::Yield::new(2).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    sem.release();
                })
            })
            .collect();

        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(sem.available_permits(), PERMITS);
        max.load(Ordering::SeqCst)
    })
    .unwrap();

    assert_eq!(max, PERMITS);
}

#[test]
fn cond_producer_consumer() {
    const ITEMS: usize = 20;

    let _trace = trace_init();
    let consumed = offset::run(|scheduler| async move {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let cond = Arc::new(Cond::new());

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let (queue, cond) = (queue.clone(), cond.clone());
                scheduler.spawn(async move {
                    let mut consumed = Vec::new();
                    loop {
                        let mut items = queue.lock().await;
                        while items.is_empty() {
                            items = cond.wait(items).await;
                        }
                        match items.pop_front() {
                            Some(Some(item)) => consumed.push(item),
                            // `None` is the shutdown marker.
                            _ => return consumed,
                        }
                    }
                })
            })
            .collect();

        for item in 0..ITEMS {
            queue.lock().await.push_back(Some(item));
            cond.signal();
            if item % 3 == 0 {
                yield_now().await;
            }
        }
        {
            let mut items = queue.lock().await;
            items.push_back(None);
            items.push_back(None);
        }
        cond.broadcast();

        let mut consumed = Vec::new();
        for consumer in consumers {
            consumed.extend(consumer.await.unwrap());
        }
        consumed.sort_unstable();
        consumed
    })
    .unwrap();

    assert_eq!(consumed, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn canceled_rwlock_waiters_do_not_wedge_the_lock() {
    let _trace = trace_init();
    offset::run(|scheduler| async move {
        let lock = Arc::new(RwLock::new(0usize));

        // a reader parked behind a writer is canceled.
        let guard = lock.write().await;
        let reader = scheduler.spawn({
            let lock = lock.clone();
            async move { *lock.read().await }
        });
        settle(1).await;
        assert!(reader.cancel());
        drop(guard);
        assert!(reader.await.unwrap_err().is_canceled());
        *lock.write().await += 1;

        // a writer waiting on an active reader is canceled.
        let guard = lock.read().await;
        let writer = scheduler.spawn({
            let lock = lock.clone();
            async move { *lock.write().await += 10 }
        });
        settle(1).await;
        let late_reader = scheduler.spawn({
            let lock = lock.clone();
            async move { *lock.read().await }
        });
        settle(1).await;
        assert!(writer.cancel());
        drop(guard);
        assert!(writer.await.unwrap_err().is_canceled());
        assert_eq!(late_reader.await.unwrap(), 1);

        *lock.write().await += 1;
        assert_eq!(*lock.read().await, 2);
    })
    .unwrap();
}

#[test]
fn canceled_cond_waiter_does_not_swallow_signals() {
    let _trace = trace_init();
    offset::run(|scheduler| async move {
        let state = Arc::new((Mutex::new(()), Cond::new()));
        let waiter = || {
            let state = state.clone();
            scheduler.spawn(async move {
                let (lock, cond) = &*state;
                let guard = lock.lock().await;
                drop(cond.wait(guard).await);
            })
        };

        let first = waiter();
        let canceled = waiter();
        settle(1).await;

        state.1.signal();
        assert!(canceled.cancel());
        first.await.unwrap();

        let next = waiter();
        settle(1).await;
        state.1.signal();
        next.await.unwrap();
        assert_eq!(state.1.waiters(), 0);
    })
    .unwrap();
}
