use std::fmt;

use crate::Core::Topology::Rank;
use crate::Shuffler::deliverq::DeliverySnapshot;
use crate::Shuffler::outq::{ClassQueues, OutputQueue};
use crate::Shuffler::senderlimit::SenderLimit;
use crate::Shuffler::Inner;
use crate::Shuffler::stats::StatsSnapshot;
use crate::Shuffler::Batch::BatchBuffer;
use crate::Shuffler::Structs::QueueClass;

/// Debug function for BatchBuffer
///
/// Shows the class, message counts and encoded size, never the bytes.
pub fn debug_batch_buffer(batch: &BatchBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BatchBuffer")
        .field("class", &batch.class())
        .field("messages", &batch.message_count())
        .field("app_messages", &batch.app_messages())
        .field("bytes", &batch.size())
        .finish()
}

/// Debug function for OutputQueue
///
/// Shows:
/// - Peer and class
/// - Active batch fill
/// - Wait list length and in-flight count
pub(crate) fn debug_output_queue(queue: &OutputQueue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutputQueue")
        .field("peer", &queue.peer)
        .field("class", &queue.class)
        .field("buffered_messages", &queue.buffered_messages())
        .field("buffered_bytes", &queue.buffered_bytes())
        .field("waiting", &queue.waitq.len())
        .field("inflight", &queue.inflight)
        .finish_non_exhaustive()
}

pub(crate) fn debug_class_queues(queues: &ClassQueues, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let peers = queues.queues.lock().len();
    f.debug_struct("ClassQueues")
        .field("class", &queues.class)
        .field("limits", &queues.limits)
        .field("peers", &peers)
        .finish()
}

pub(crate) fn debug_sender_limit(limit: &SenderLimit, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SenderLimit")
        .field("name", &limit.name())
        .field("limit", &limit.limit())
        .field("outstanding", &limit.outstanding())
        .finish()
}

impl fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_batch_buffer(self, f)
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_output_queue(self, f)
    }
}

impl fmt::Debug for ClassQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_class_queues(self, f)
    }
}

impl fmt::Debug for SenderLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_sender_limit(self, f)
    }
}

/// One output queue in a state dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDump {
    pub class: QueueClass,
    pub peer: Rank,
    pub buffered_messages: u32,
    pub buffered_bytes: usize,
    pub waiting: usize,
    pub inflight: usize,
    pub peak_inflight: usize,
}

/// One sender limit in a state dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitDump {
    pub name: &'static str,
    pub limit: usize,
    pub outstanding: usize,
    pub peak: usize,
}

/// Diagnostic snapshot of a shuffle. Each part is captured under its own
/// lock, so the parts need not be mutually consistent.
#[derive(Clone, Debug)]
pub struct StateDump {
    pub rank: Rank,
    pub queues: Vec<QueueDump>,
    pub delivery: DeliverySnapshot,
    pub limits: Vec<LimitDump>,
    pub stats: StatsSnapshot,
}

impl StateDump {
    pub(crate) fn capture(inner: &Inner) -> Self {
        let mut queues = Vec::new();
        for class in QueueClass::ALL {
            let guard = inner.queues(class).queues.lock();
            queues.extend(guard.values().map(|q| QueueDump {
                class,
                peer: q.peer,
                buffered_messages: q.buffered_messages(),
                buffered_bytes: q.buffered_bytes(),
                waiting: q.waitq.len(),
                inflight: q.inflight,
                peak_inflight: q.peak_inflight,
            }));
        }

        let limits = [&inner.local_limit, &inner.remote_limit]
            .into_iter()
            .map(|limit| LimitDump {
                name: limit.name(),
                limit: limit.limit(),
                outstanding: limit.outstanding(),
                peak: limit.peak(),
            })
            .collect();

        Self {
            rank: inner.me(),
            queues,
            delivery: inner.deliverq.snapshot(),
            limits,
            stats: inner.stats.snapshot(),
        }
    }

    /// Queues of one class.
    pub fn queues_of(&self, class: QueueClass) -> impl Iterator<Item = &QueueDump> + '_ {
        self.queues.iter().filter(move |q| q.class == class)
    }

    pub fn limit(&self, name: &str) -> Option<&LimitDump> {
        self.limits.iter().find(|l| l.name == name)
    }
}

impl fmt::Display for StateDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rank {}", self.rank)?;
        for class in QueueClass::ALL {
            writeln!(f, "  {class} queues:")?;
            let mut any = false;
            for q in self.queues_of(class) {
                any = true;
                writeln!(
                    f,
                    "    -> {:<5} buffered {} msgs / {} bytes, waiting {}, inflight {} (peak {})",
                    q.peer, q.buffered_messages, q.buffered_bytes, q.waiting, q.inflight, q.peak_inflight
                )?;
            }
            if !any {
                writeln!(f, "    (none)")?;
            }
        }

        let d = &self.delivery;
        writeln!(
            f,
            "  delivery: depth {} (peak {}, max {}, threshold {}), held acks {}, pushed {}, delivered {}, discarded {}",
            d.depth, d.peak_depth, d.max, d.threshold, d.held_acks, d.pushed, d.delivered, d.discarded
        )?;
        for l in &self.limits {
            writeln!(
                f,
                "  {} sender limit: {}/{} outstanding (peak {})",
                l.name, l.outstanding, l.limit, l.peak
            )?;
        }

        let s = &self.stats;
        write!(
            f,
            "  rpcs: local sent {} recv {}, remote sent {} recv {}; messages: enqueued {}, relayed {}, delivered {}",
            s.local.sends, s.local.recvs, s.remote.sends, s.remote.recvs, s.enqueued, s.relayed, s.delivered
        )
    }
}
