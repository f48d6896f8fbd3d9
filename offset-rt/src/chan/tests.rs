use super::*;
use crate::{util::test::trace_init, Scheduler};
use futures_util::FutureExt;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn try_send_and_try_recv() {
    let chan = Chan::new(2);
    assert_eq!(chan.capacity(), 2);
    assert!(chan.is_empty());

    chan.try_send(1).unwrap();
    chan.try_send(2).unwrap();
    assert_eq!(chan.try_send(3), Err(TrySendError::Full(3)));
    assert_eq!(chan.len(), 2);

    assert_eq!(chan.try_recv(), Ok(1));
    assert_eq!(chan.try_recv(), Ok(2));
    assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn unbuffered_try_send_needs_a_receiver() {
    let chan = Chan::new(0);
    assert_eq!(chan.try_send("hi"), Err(TrySendError::Full("hi")));
    assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn close_is_terminal() {
    let chan = Chan::new(1);
    chan.try_send(1).unwrap();

    assert!(chan.close());
    assert!(!chan.close());
    assert!(chan.is_closed());

    assert_eq!(chan.try_send(2), Err(TrySendError::Closed(2)));
    // buffered values are still drained after close.
    assert_eq!(chan.try_recv(), Ok(1));
    assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));

    let recv = chan.recv().now_or_never().expect("closed channel never blocks");
    assert_eq!(recv, Ok(None));
    let send = chan.send(3).now_or_never().expect("closed channel never blocks");
    assert_eq!(send.unwrap_err().into_inner(), 3);
}

#[test]
fn unbuffered_send_waits_for_receiver() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan = Chan::new(0);
    let log = Arc::new(Mutex::new(Vec::new()));

    scheduler.spawn({
        let chan = chan.clone();
        let log = log.clone();
        async move {
            for i in 1..=2 {
                chan.send(i).await.unwrap();
                log.lock().push(format!("sent {i}"));
            }
        }
    });

    let received = scheduler.spawn({
        let log = log.clone();
        async move {
            let a = chan.recv().await.unwrap().unwrap();
            log.lock().push(format!("recv {a}"));
            let b = chan.recv().await.unwrap().unwrap();
            log.lock().push(format!("recv {b}"));
            (a, b)
        }
    });

    assert_eq!(scheduler.run().parked, 0);
    assert_eq!(received.now_or_never(), Some(Ok((1, 2))));

    let log = log.lock();
    let position = |event: &str| log.iter().position(|e| e == event).unwrap();
    assert!(position("recv 1") < position("sent 2"), "{log:?}");
}

#[test]
fn waiting_receivers_are_served_in_order() {
    const RECEIVERS: usize = 4;

    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan = Chan::new(0);

    let joins: Vec<_> = (0..RECEIVERS)
        .map(|_| {
            let chan = chan.clone();
            scheduler.spawn(async move { chan.recv().await.unwrap() })
        })
        .collect();

    scheduler.run();
    assert_eq!(chan.waiting_receivers(), RECEIVERS);

    for i in 0..RECEIVERS {
        chan.try_send(i).unwrap();
    }
    assert_eq!(chan.waiting_receivers(), 0);
    scheduler.run();

    for (i, join) in joins.into_iter().enumerate() {
        assert_eq!(join.now_or_never(), Some(Ok(Some(i))));
    }
}

#[test]
fn close_wakes_blocked_senders_and_receivers() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let inbox: Chan<u32> = Chan::new(0);
    let outbox = Chan::new(0);

    let receivers: Vec<_> = (0..3)
        .map(|_| {
            let inbox = inbox.clone();
            scheduler.spawn(async move { inbox.recv().await })
        })
        .collect();
    let senders: Vec<_> = (10..12)
        .map(|i| {
            let outbox = outbox.clone();
            scheduler.spawn(async move { outbox.send(i).await })
        })
        .collect();

    assert_eq!(scheduler.run().parked, 5);

    assert!(inbox.close());
    assert!(outbox.close());
    assert_eq!(scheduler.run().parked, 0);

    for join in receivers {
        assert_eq!(join.now_or_never(), Some(Ok(Ok(None))));
    }
    for (join, i) in senders.into_iter().zip(10..) {
        let err = join.now_or_never().unwrap().unwrap().unwrap_err();
        assert!(err.is_closed());
        assert_eq!(err.into_inner(), i);
    }
}

#[test]
fn buffered_recv_yields_once() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan = Chan::new(1);
    chan.try_send(7).unwrap();

    let join = scheduler.spawn({
        let chan = chan.clone();
        async move { chan.recv().await }
    });

    let tick = scheduler.tick();
    assert_eq!(tick.polled, 2);
    assert_eq!(tick.woken_internal, 1);
    assert_eq!(join.now_or_never(), Some(Ok(Ok(Some(7)))));
}

#[test]
fn buffered_recv_refills_from_waiting_sender() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan = Chan::new(1);

    let sender = scheduler.spawn({
        let chan = chan.clone();
        async move {
            chan.send(1).await.unwrap();
            chan.send(2).await.unwrap();
        }
    });

    scheduler.run();
    assert_eq!(chan.waiting_senders(), 1);

    assert_eq!(chan.try_recv(), Ok(1));
    // the waiting sender's value moved into the buffer.
    assert_eq!(chan.len(), 1);
    assert_eq!(chan.waiting_senders(), 0);

    scheduler.run();
    assert!(sender.is_complete());
    assert_eq!(chan.try_recv(), Ok(2));
}

#[test]
fn dropped_recv_leaves_the_queue() {
    let chan: Chan<u32> = Chan::new(0);

    let mut recv = chan.recv();
    assert!((&mut recv).now_or_never().is_none());
    assert_eq!(chan.waiting_receivers(), 1);

    drop(recv);
    assert_eq!(chan.waiting_receivers(), 0);
    assert_eq!(chan.try_send(1), Err(TrySendError::Full(1)));
}

#[test]
fn dropped_send_takes_its_value_back() {
    let chan = Chan::new(0);

    let mut send = chan.send(String::from("unsent"));
    assert!((&mut send).now_or_never().is_none());
    assert_eq!(chan.waiting_senders(), 1);

    drop(send);
    assert_eq!(chan.waiting_senders(), 0);
    assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn poisoned_values_propagate() {
    async fn sum(chan: Chan<Result<u32, String>>) -> Result<u32, String> {
        let mut total = 0;
        while let Some(value) = chan.recv().await.map_err(|e| e.to_string())? {
            total += value?;
        }
        Ok(total)
    }

    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let chan = Chan::new(4);

    let producer = chan.clone();
    scheduler.spawn(async move {
        producer.send(Ok(1)).await.unwrap();
        producer.send(Ok(2)).await.unwrap();
        producer.poison(String::from("sensor offline")).await.unwrap();
        producer.send(Ok(3)).await.unwrap();
        producer.close();
    });

    let result = scheduler.block_on(sum(chan)).unwrap();
    assert_eq!(result, Err(String::from("sensor offline")));
}

proptest! {
    #[test]
    fn send_blocks_once_the_buffer_is_full(capacity in 0usize..8) {
        let scheduler = Scheduler::new();
        let chan = Chan::new(capacity);
        let sent = Arc::new(AtomicUsize::new(0));

        let sender = scheduler.spawn({
            let chan = chan.clone();
            let sent = sent.clone();
            async move {
                for i in 0..=capacity {
                    chan.send(i).await.unwrap();
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        prop_assert_eq!(scheduler.run().parked, 1);
        prop_assert_eq!(sent.load(Ordering::SeqCst), capacity);
        prop_assert_eq!(chan.len(), capacity);
        prop_assert_eq!(chan.waiting_senders(), 1);

        // one receive makes room, and the sender finishes.
        prop_assert_eq!(chan.try_recv(), Ok(0));
        prop_assert_eq!(scheduler.run().parked, 0);
        prop_assert_eq!(sent.load(Ordering::SeqCst), capacity + 1);
        prop_assert!(sender.is_complete());

        let rest: Vec<usize> = std::iter::from_fn(|| chan.try_recv().ok()).collect();
        prop_assert_eq!(rest, (1..=capacity).collect::<Vec<_>>());
    }

    #[test]
    fn values_arrive_in_send_order(capacity in 0usize..4, values in proptest::collection::vec(any::<u16>(), 0..32)) {
        let scheduler = Scheduler::new();
        let chan = Chan::new(capacity);

        let producer = chan.clone();
        let expected = values.clone();
        scheduler.spawn(async move {
            for value in values {
                producer.send(value).await.unwrap();
            }
            producer.close();
        });

        let received = scheduler.block_on(async move {
            let mut received = Vec::new();
            while let Some(value) = chan.recv().await.unwrap() {
                received.push(value);
            }
            received
        }).unwrap();

        prop_assert_eq!(received, expected);
    }
}
