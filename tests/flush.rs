mod common;

use common::{wait_until, Cluster};
use hop_shuffle::Core::Fault;
use hop_shuffle::{QueueClass, Rank, ShuffleBuilder, ShuffleError, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn fill(src: Rank, dst: Rank, seq: u32) -> u8 {
    (src * 31 + dst * 7 + seq) as u8
}

#[test]
fn all_to_all_loses_nothing() {
    const PER_PAIR: u32 = 25;
    let cluster = Cluster::with_builder(2, 3, |_| {
        ShuffleBuilder::new()
            .with_origin_queues(2, 512)
            .with_remote_queues(2, 1024)
            .with_relay_queues(2, 512)
            .with_sender_limits(8, 8)
    });
    let size = cluster.size() as Rank;

    let sent: Vec<u64> = cluster.on_every_rank(|shuffle| {
        let me = shuffle.rank();
        let mut rng = fastrand::Rng::with_seed(me as u64);
        let mut bytes = 0u64;
        for seq in 0..PER_PAIR {
            for dst in 0..size {
                let len = rng.usize(0..200);
                shuffle.enqueue(dst, seq, &vec![fill(me, dst, seq); len]).unwrap();
                bytes += len as u64;
            }
        }
        bytes
    });
    for result in cluster.quiesce() {
        result.unwrap();
    }

    let mut received = 0u64;
    for dst in 0..size {
        let inbox = cluster.inbox(dst);
        assert_eq!(inbox.len(), (PER_PAIR * size) as usize, "rank {dst}");

        let mut per_src: HashMap<Rank, u32> = HashMap::new();
        for msg in &inbox {
            assert_eq!(msg.dst, dst);
            assert!(msg.payload.iter().all(|&b| b == fill(msg.src, dst, msg.msg_type)));
            *per_src.entry(msg.src).or_default() += 1;
            received += msg.len() as u64;
        }
        assert!(per_src.values().all(|&n| n == PER_PAIR));
    }
    assert_eq!(received, sent.iter().sum::<u64>());

    let total: u64 = cluster.shuffles.iter().map(|s| s.stats().delivered).sum();
    assert_eq!(total, (PER_PAIR * size * size) as u64);
}

#[test]
fn self_send_needs_no_rpc() {
    let cluster = Cluster::new(1, 2);
    let shuffle = &cluster.shuffles[0];

    shuffle.enqueue(0, 9, b"me").unwrap();
    shuffle.flush_all().unwrap();

    assert_eq!(cluster.fabric.rpcs_from(0), 0);
    let inbox = cluster.inbox(0);
    assert_eq!(inbox.len(), 1);
    assert_eq!((inbox[0].src, inbox[0].dst, inbox[0].msg_type), (0, 0, 9));
}

#[test]
fn flush_waits_only_for_its_own_class() {
    // One rank per node: rank 0 is its own representative, so 0 -> 1 is a
    // single remote hop.
    let cluster = Cluster::new(2, 1);
    let sender = &cluster.shuffles[0];
    cluster.fabric.hold(1);

    sender.enqueue(1, 4, b"over the wire").unwrap();
    sender.flush_origin_queues().unwrap();
    sender.flush_relay_queues().unwrap();
    assert_eq!(cluster.fabric.total_rpcs(), 0);

    let done = AtomicBool::new(false);
    thread::scope(|scope| {
        let flusher = scope.spawn(|| {
            let result = sender.flush_remote_queues();
            done.store(true, Ordering::SeqCst);
            result
        });

        assert!(wait_until(Duration::from_secs(5), || cluster.fabric.held_count(1) == 1));
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        cluster.fabric.release(1);
        flusher.join().unwrap().unwrap();
    });

    let link = cluster.fabric.link(0, 1);
    assert_eq!((link.rpcs_issued, link.network, link.local), (1, 1, 0));
    cluster.shuffles[1].flush_delivery().unwrap();
    assert_eq!(cluster.inbox(1)[0].payload, b"over the wire");
}

#[test]
fn failed_rpc_is_reported_to_the_covering_flush_once() {
    let cluster = Cluster::new(2, 1);
    let sender = &cluster.shuffles[0];

    cluster.fabric.inject(Some(0), Some(1), Fault::Fail);
    sender.enqueue(1, 0, b"lost").unwrap();
    let err = sender.flush_remote_queues().unwrap_err();
    assert!(matches!(err, ShuffleError::Transport(TransportError::Failed { peer: 1, .. })));
    assert!(sender.flush_remote_queues().is_ok());

    cluster.fabric.clear_faults();
    sender.enqueue(1, 0, b"kept").unwrap();
    sender.flush_remote_queues().unwrap();
    cluster.shuffles[1].flush_delivery().unwrap();

    let inbox = cluster.inbox(1);
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].payload, b"kept");
}

#[test]
fn flush_all_reports_the_first_failure_and_keeps_going() {
    let cluster = Cluster::new(3, 2);
    let sender = &cluster.shuffles[0];

    // 0 -> 1 is an origin hop; rank 0 represents node 2, so 0 -> 4 is a
    // single remote hop.
    cluster.fabric.inject(Some(0), Some(1), Fault::Fail);
    sender.enqueue(1, 0, b"a").unwrap();
    sender.enqueue(4, 0, b"b").unwrap();

    let err = sender.flush_all().unwrap_err();
    assert!(matches!(err, ShuffleError::Transport(TransportError::Failed { peer: 1, .. })));

    // The remote stage still ran.
    assert_eq!(cluster.fabric.link(0, 4).rpcs_issued, 1);
    assert!(wait_until(Duration::from_secs(5), || cluster.inbox(4).len() == 1));
    assert!(cluster.inbox(1).is_empty());
}

#[test]
fn sends_made_during_a_flush_are_left_for_the_next_one() {
    let cluster = Cluster::new(1, 2);
    let sender = &cluster.shuffles[0];
    cluster.fabric.hold(1);

    for i in 0..2u8 {
        sender.enqueue(1, 1, &[i]).unwrap();
    }

    thread::scope(|scope| {
        let flusher = scope.spawn(|| sender.flush_origin_queues());

        // The flush has sealed and sent its batch once rank 1 parks it.
        assert!(wait_until(Duration::from_secs(5), || cluster.fabric.held_count(1) == 1));
        for i in 2..5u8 {
            sender.enqueue(1, 2, &[i]).unwrap();
        }

        cluster.fabric.release(1);
        flusher.join().unwrap().unwrap();
    });

    assert_eq!(cluster.fabric.link(0, 1).rpcs_issued, 1);
    let dump = sender.dump_state();
    let buffered: u32 = dump
        .queues_of(QueueClass::Origin)
        .map(|q| q.buffered_messages)
        .sum();
    assert_eq!(buffered, 3);

    cluster.shuffles[1].flush_delivery().unwrap();
    let first: Vec<u8> = cluster.inbox(1).iter().map(|m| m.payload[0]).collect();
    assert_eq!(first, vec![0, 1]);

    sender.flush_origin_queues().unwrap();
    cluster.shuffles[1].flush_delivery().unwrap();
    let all: Vec<u8> = cluster.inbox(1).iter().map(|m| m.payload[0]).collect();
    assert_eq!(all, vec![0, 1, 2, 3, 4]);
}
