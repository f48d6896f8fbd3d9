mod support;

use offset::{
    task::{self, ReadyError},
    Chan, JoinError, RunError, Scheduler,
};
use parking_lot::Mutex;
use std::{sync::Arc, thread, time::Duration};
use support::{settle, trace_init};

#[test]
fn ready_requires_a_sleeping_task() {
    let _trace = trace_init();
    offset::run(|scheduler| async move {
        let sleeper = scheduler.spawn(task::park());
        let id = sleeper.id();

        // queued, not yet polled.
        assert_eq!(
            sleeper.task_ref().ready(),
            Err(ReadyError::NotSleeping(id))
        );

        settle(1).await;
        assert!(sleeper.task_ref().is_sleeping());
        assert_eq!(sleeper.task_ref().ready(), Ok(()));
        // readied, but not yet run.
        assert!(sleeper.task_ref().ready().is_err());

        sleeper.await.unwrap();

        // the current task is running, not sleeping.
        let me = scheduler.current_task().unwrap();
        assert_eq!(me.ready(), Err(ReadyError::NotSleeping(me.id())));
    })
    .unwrap();
}

#[test]
fn blocking_call_resumes_at_the_front() {
    let _trace = trace_init();
    let order = Arc::new(Mutex::new(Vec::new()));

    offset::run({
        let order = order.clone();
        move |scheduler| async move {
            let (release, released) = crossbeam_channel::bounded::<()>(0);

            let blocker = scheduler.spawn({
                let (handle, order) = (scheduler.clone(), order.clone());
                async move {
                    handle
                        .blocking(move || released.recv().unwrap())
                        .await
                        .unwrap();
                    order.lock().push("after blocking call");
                }
            });
            settle(1).await;
            assert!(blocker.task_ref().is_sleeping());

            // a batch of runnable tasks, queued behind the main task.
            let yielders: Vec<_> = (0..3)
                .map(|_| {
                    let order = order.clone();
                    scheduler.spawn(async move {
                        order.lock().push("yielder");
                    })
                })
                .collect();

            // let the call finish while the scheduler is busy with this task.
            release.send(()).unwrap();
            while scheduler.blocking_calls() > 0 {
                thread::sleep(Duration::from_millis(1));
            }
            order.lock().push("main yields");
            settle(1).await;

            blocker.await.unwrap();
            for yielder in yielders {
                yielder.await.unwrap();
            }
        }
    })
    .unwrap();

    assert_eq!(
        *order.lock(),
        ["main yields", "after blocking call", "yielder", "yielder", "yielder"]
    );
}

#[test]
fn blocking_call_panic_resumes_in_task() {
    let _trace = trace_init();
    let result = offset::run(|scheduler| async move {
        let handle = scheduler.clone();
        let task = scheduler.spawn(async move {
            handle
                .blocking(|| -> usize { panic!("disk on fire") })
                .await
        });

        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        err
    })
    .unwrap();

    match result {
        JoinError::Panicked { message, .. } => assert_eq!(message, "disk on fire"),
        other => panic!("expected a panic, got {other:?}"),
    }
}

#[test]
fn many_blocking_calls_share_the_pool() {
    const CALLS: u64 = 16;

    let _trace = trace_init();
    let config = offset::Config::default().with_max_blocking_threads(2);
    let sum = offset::run_with_config(config, |scheduler| async move {
        let results = Chan::new(CALLS as usize);
        for i in 0..CALLS {
            let (handle, results) = (scheduler.clone(), results.clone());
            scheduler.spawn(async move {
                let value = handle
                    .blocking(move || {
                        thread::sleep(Duration::from_millis(2));
                        i * 10
                    })
                    .await
                    .unwrap();
                results.send(value).await.unwrap();
            });
        }

        let mut sum = 0;
        for _ in 0..CALLS {
            sum += results.recv().await.unwrap().unwrap();
        }
        sum
    })
    .unwrap();

    assert_eq!(sum, (0..CALLS).map(|i| i * 10).sum::<u64>());
}

#[test]
fn stop_cancels_parked_tasks() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan: Chan<u32> = Chan::new(0);

    let parked: Vec<_> = (0..3)
        .map(|_| {
            let chan = chan.clone();
            scheduler.spawn(async move { chan.recv().await })
        })
        .collect();

    assert_eq!(scheduler.run().parked, 3);
    assert_eq!(chan.waiting_receivers(), 3);

    scheduler.stop();
    assert_eq!(scheduler.tasks(), 0);
    // canceled receivers leave the channel's queue.
    assert_eq!(chan.waiting_receivers(), 0);

    let results = Scheduler::new()
        .block_on(async move {
            let mut results = Vec::new();
            for join in parked {
                results.push(join.await);
            }
            results
        })
        .unwrap();

    for result in results {
        assert!(result.unwrap_err().is_canceled());
    }
}

#[test]
fn run_stops_leftover_tasks() {
    let _trace = trace_init();
    let chan: Chan<u32> = Chan::new(0);

    let leftover = offset::run({
        let chan = chan.clone();
        move |scheduler| async move {
            let leftover = scheduler.spawn(async move { chan.recv().await });
            settle(1).await;
            leftover
        }
    })
    .unwrap();

    assert!(leftover.is_complete());
    assert_eq!(chan.waiting_receivers(), 0);
}

#[test]
fn deadlock_is_detected() {
    let _trace = trace_init();
    let result = offset::run(|scheduler| async move {
        let chan: Chan<()> = Chan::new(0);
        let other = chan.clone();
        scheduler.spawn(async move { other.recv().await });
        chan.recv().await
    });

    assert_eq!(result, Err(RunError::Deadlock { parked: 2 }));
}

#[test]
fn main_task_panic_is_reported() {
    let _trace = trace_init();
    let result = offset::run(|_| async move {
        settle(1).await;
        panic!("main failed");
    });

    match result {
        Err(RunError::Join(err)) => assert!(err.is_panic()),
        other => panic!("expected a join error, got {other:?}"),
    }
}

#[test]
fn schedulers_are_independent() {
    let _trace = trace_init();
    let a = Scheduler::new();
    let b = Scheduler::new();

    let on_a = a.spawn(async { "a" });
    let on_b = b.spawn(async { "b" });

    assert_eq!(a.tick().completed, 1);
    assert!(on_a.is_complete());
    assert!(!on_b.is_complete());

    assert_eq!(b.run().parked, 0);
    assert!(on_b.is_complete());
}
