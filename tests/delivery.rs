mod common;

use common::{init_tracing, wait_until, Gate, Inbox};
use hop_shuffle::Core::LoopbackFabric;
use hop_shuffle::{Message, Rank, Shuffle, ShuffleBuilder};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

/// Rank `gated` blocks in its handler until its gate opens; everyone else
/// collects straight away.
struct GatedJob {
    shuffles: Vec<Shuffle>,
    inboxes: Vec<Inbox>,
    gate: Gate,
    fabric: LoopbackFabric,
}

impl GatedJob {
    fn new(nodes: usize, ppn: usize, gated: Rank, builder: impl Fn(Rank) -> ShuffleBuilder) -> Self {
        init_tracing();
        let fabric = LoopbackFabric::new(nodes, ppn).unwrap();
        let gate = Gate::default();
        let mut shuffles = Vec::new();
        let mut inboxes = Vec::new();
        for rank in 0..fabric.size() as Rank {
            let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
            let sink = inbox.clone();
            let gate = (rank == gated).then(|| gate.clone());
            let endpoint = fabric.fabric(rank);
            let shuffle = builder(rank)
                .build(endpoint.topology, endpoint.transport, move |m: Message| {
                    if let Some(gate) = &gate {
                        gate.wait();
                    }
                    sink.lock().push(m);
                })
                .unwrap();
            shuffles.push(shuffle);
            inboxes.push(inbox);
        }
        Self {
            shuffles,
            inboxes,
            gate,
            fabric,
        }
    }

    fn received(&self, rank: Rank) -> Vec<u8> {
        self.inboxes[rank as usize]
            .lock()
            .iter()
            .map(|m| m.payload[0])
            .collect()
    }
}

impl Drop for GatedJob {
    fn drop(&mut self) {
        // A handler parked on the gate would block shutdown.
        self.gate.open();
    }
}

#[test]
fn slow_consumer_holds_acknowledgements() {
    let job = GatedJob::new(1, 2, 1, |rank| {
        let builder = ShuffleBuilder::new().with_origin_queues(1, 1);
        if rank == 1 {
            builder.with_delivery_queue(2, 1)
        } else {
            builder
        }
    });

    for i in 0..5u8 {
        job.shuffles[0].enqueue(1, 0, &[i]).unwrap();
    }

    // The consumer is stuck, the queue climbed past its max and one
    // acknowledgement is parked; the sender cannot get further.
    assert!(wait_until(PATIENCE, || job.shuffles[1].dump_state().delivery.held_acks == 1));
    let link = job.fabric.link(0, 1);
    assert_eq!(link.in_flight, 1);
    assert!(link.rpcs_issued < 5);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(job.fabric.link(0, 1).rpcs_issued, link.rpcs_issued);

    job.gate.open();
    job.shuffles[0].flush_origin_queues().unwrap();
    job.shuffles[1].flush_delivery().unwrap();

    assert_eq!(job.received(1), vec![0, 1, 2, 3, 4]);
    let delivery = job.shuffles[1].dump_state().delivery;
    assert_eq!(delivery.held_acks, 0);
    assert_eq!(delivery.delivered, 5);
    assert!(delivery.peak_depth >= 3);
}

#[test]
fn self_sends_never_block_on_a_full_delivery_queue() {
    let job = GatedJob::new(1, 1, 0, |_| ShuffleBuilder::new().with_delivery_queue(2, 1));
    let me = &job.shuffles[0];

    for i in 0..10u8 {
        me.enqueue(0, 0, &[i]).unwrap();
    }
    let depth = me.dump_state().delivery.depth;
    assert!(depth >= 9, "depth {depth}");

    job.gate.open();
    me.flush_delivery().unwrap();
    assert_eq!(job.received(0), (0..10).collect::<Vec<u8>>());
}

#[test]
fn delivery_waits_for_threshold_or_flush() {
    let job = GatedJob::new(1, 2, Rank::MAX, |_| ShuffleBuilder::new().with_delivery_queue(8, 8));

    for i in 0..3u8 {
        job.shuffles[0].enqueue(1, 0, &[i]).unwrap();
    }
    job.shuffles[0].flush_origin_queues().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(job.received(1).is_empty());
    assert_eq!(job.shuffles[1].dump_state().delivery.depth, 3);

    job.shuffles[1].flush_delivery().unwrap();
    assert_eq!(job.received(1), vec![0, 1, 2]);
    assert_eq!(job.shuffles[1].stats().delivered, 3);
}
