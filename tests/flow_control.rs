mod common;

use common::{wait_until, Cluster};
use hop_shuffle::{QueueClass, ShuffleBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn in_flight_rpcs_never_exceed_max_rpc() {
    // Tiny byte target: every message seals its own batch.
    let cluster = Cluster::with_builder(1, 2, |_| ShuffleBuilder::new().with_origin_queues(2, 1));
    let sender = &cluster.shuffles[0];

    cluster.fabric.hold(1);
    for i in 0..5u8 {
        sender.enqueue(1, 0, &[i]).unwrap();
    }

    let link = cluster.fabric.link(0, 1);
    assert_eq!(link.rpcs_issued, 2);
    assert_eq!(link.in_flight, 2);
    let dump = sender.dump_state();
    let queue = dump.queues_of(QueueClass::Origin).next().unwrap();
    assert_eq!(queue.waiting, 3);
    assert_eq!(queue.inflight, 2);

    cluster.fabric.release(1);
    sender.flush_origin_queues().unwrap();

    let link = cluster.fabric.link(0, 1);
    assert_eq!(link.rpcs_issued, 5);
    assert_eq!(link.peak_in_flight, 2);

    cluster.shuffles[1].flush_delivery().unwrap();
    let order: Vec<u8> = cluster.inbox(1).iter().map(|m| m.payload[0]).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[test]
fn saturated_sender_limit_blocks_until_completion() {
    let cluster = Cluster::with_builder(1, 2, |_| {
        ShuffleBuilder::new()
            .with_sender_limits(2, 2)
            .with_origin_queues(1, 1 << 20)
    });
    cluster.fabric.hold(1);

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            let sender = &cluster.shuffles[0];
            for i in 0..3u8 {
                sender.enqueue(1, 0, &[i; 8]).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });

        // The second enqueue fills the limit and pushes out the partial
        // batch; the third waits.
        assert!(wait_until(PATIENCE, || cluster.fabric.link(0, 1).rpcs_issued == 1));
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        let dump = cluster.shuffles[0].dump_state();
        assert_eq!(dump.limit("local").unwrap().outstanding, 2);

        cluster.fabric.release(1);
    });
    assert!(done.load(Ordering::SeqCst));

    cluster.shuffles[0].flush_origin_queues().unwrap();
    cluster.shuffles[1].flush_delivery().unwrap();
    assert_eq!(cluster.inbox(1).len(), 3);
    assert_eq!(cluster.shuffles[0].dump_state().limit("local").unwrap().outstanding, 0);
}

#[test]
fn relayed_traffic_is_exempt_from_sender_limits() {
    // 2 x 2: 0 -> 3 travels 0 -(origin)-> 1 -(remote)-> 2 -(relay)-> 3.
    let cluster = Cluster::with_builder(2, 2, |_| {
        ShuffleBuilder::new()
            .with_sender_limits(1, 1)
            .with_origin_queues(1, 1)
            .with_remote_queues(1, 1)
            .with_relay_queues(1, 1)
    });

    for i in 0..20u8 {
        cluster.shuffles[0].enqueue(3, 5, &[i]).unwrap();
    }
    for result in cluster.quiesce() {
        result.unwrap();
    }

    let inbox = cluster.inbox(3);
    assert_eq!(inbox.len(), 20);
    assert!(inbox.iter().all(|m| m.src == 0 && m.dst == 3));

    let rep = cluster.shuffles[1].dump_state();
    assert_eq!(rep.limit("remote").unwrap().peak, 0);
    assert_eq!(rep.stats.relayed, 20);
    assert_eq!(cluster.shuffles[2].stats().relayed, 20);
    assert_eq!(cluster.shuffles[0].dump_state().limit("local").unwrap().peak, 1);
}

#[test]
fn racing_senders_on_a_single_slot_all_get_through() {
    const THREADS: u8 = 4;
    const ROUNDS: usize = 20;

    for round in 0..ROUNDS {
        let cluster = Cluster::with_builder(1, 2, |_| {
            ShuffleBuilder::new()
                .with_sender_limits(1, 1)
                .with_origin_queues(1, 1 << 20)
        });
        let sender = &cluster.shuffles[0];

        let finished = AtomicUsize::new(0);
        let unaided = thread::scope(|scope| {
            for t in 0..THREADS {
                let finished = &finished;
                scope.spawn(move || {
                    sender.enqueue(1, 0, &[t]).unwrap();
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
            // No flush until every sender has returned on its own.
            let unaided = wait_until(PATIENCE, || finished.load(Ordering::SeqCst) == THREADS as usize);
            if !unaided {
                sender.flush_origin_queues().unwrap();
            }
            unaided
        });
        assert!(unaided, "round {round}: a sender stayed blocked on the freed slot");

        sender.flush_origin_queues().unwrap();
        cluster.shuffles[1].flush_delivery().unwrap();
        let mut got: Vec<u8> = cluster.inbox(1).iter().map(|m| m.payload[0]).collect();
        got.sort_unstable();
        assert_eq!(got, (0..THREADS).collect::<Vec<_>>());
        assert_eq!(sender.dump_state().limit("local").unwrap().outstanding, 0);
    }
}
