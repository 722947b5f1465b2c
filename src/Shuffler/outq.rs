// Output queues: one per (peer, class). Each owns the batch being filled, the
// wait list of sealed batches blocked by the per-destination RPC cap, and the
// in-flight count. All queues of a class share one lock and one condvar.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::Core::config::QueueLimits;
use crate::Core::error::{ShuffleError, ShuffleResult, TransportError};
use crate::Core::Topology::Rank;
use crate::Shuffler::Batch::{BatchBuffer, SealedBatch};
use crate::Shuffler::Structs::{MessageHeader, QueueClass};

/// Upper bound on the buffer preallocated for a new batch.
const MAX_PREALLOC: usize = 1 << 20;

/// A sealed batch leaving its queue for the transport.
pub(crate) struct Outbound {
    pub peer: Rank,
    pub class: QueueClass,
    pub seq: u64,
    pub batch: BatchBuffer,
}

pub(crate) struct OutputQueue {
    pub(crate) peer: Rank,
    pub(crate) class: QueueClass,
    pub(crate) active: Option<BatchBuffer>,
    pub(crate) waitq: VecDeque<SealedBatch>,
    pub(crate) inflight: usize,
    pub(crate) peak_inflight: usize,
    next_seq: u64,
    /// Sealed and not yet completed (waiting or in flight).
    pending: BTreeSet<u64>,
    /// Failed batches not yet reported to a flush.
    failures: BTreeMap<u64, TransportError>,
}

impl OutputQueue {
    pub(crate) fn new(peer: Rank, class: QueueClass) -> Self {
        Self {
            peer,
            class,
            active: None,
            waitq: VecDeque::new(),
            inflight: 0,
            peak_inflight: 0,
            next_seq: 0,
            pending: BTreeSet::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Copy one message into the active batch, sealing it once it reaches
    /// `target` bytes. Returns true if a batch was sealed.
    pub(crate) fn append(
        &mut self,
        sender: Rank,
        header: &MessageHeader,
        payload: &[u8],
        from_app: bool,
        target: usize,
    ) -> bool {
        let class = self.class;
        let batch = self
            .active
            .get_or_insert_with(|| BatchBuffer::new(class, sender, target.min(MAX_PREALLOC)));
        batch.push(header, payload, from_app);
        if batch.size() >= target {
            self.seal().is_some()
        } else {
            false
        }
    }

    /// Move the active batch (if any) to the wait list.
    pub(crate) fn seal(&mut self) -> Option<u64> {
        let batch = self.active.take()?;
        if batch.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq);
        self.waitq.push_back(SealedBatch { seq, batch });
        Some(seq)
    }

    pub(crate) fn holds_app_messages(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |batch| batch.app_messages() > 0)
    }

    /// Pop wait-list entries, oldest first, while the RPC cap allows.
    pub(crate) fn take_ready(&mut self, max_rpc: usize, out: &mut Vec<Outbound>) {
        while self.inflight < max_rpc {
            let Some(sealed) = self.waitq.pop_front() else {
                break;
            };
            self.inflight += 1;
            self.peak_inflight = self.peak_inflight.max(self.inflight);
            out.push(Outbound {
                peer: self.peer,
                class: self.class,
                seq: sealed.seq,
                batch: sealed.batch,
            });
        }
    }

    pub(crate) fn complete(&mut self, seq: u64, result: &Result<(), TransportError>) {
        self.inflight = self.inflight.saturating_sub(1);
        self.pending.remove(&seq);
        if let Err(err) = result {
            self.failures.insert(seq, err.clone());
        }
    }

    /// Sequence of the newest sealed batch.
    pub(crate) fn last_sealed(&self) -> Option<u64> {
        self.next_seq.checked_sub(1)
    }

    /// True once every batch up to `seq` completed.
    pub(crate) fn drained_through(&self, seq: u64) -> bool {
        self.pending.range(..=seq).next().is_none()
    }

    /// Remove and return the first failure recorded at or below `seq`.
    pub(crate) fn take_failure_through(&mut self, seq: u64) -> Option<TransportError> {
        let failed: Vec<u64> = self.failures.range(..=seq).map(|(&s, _)| s).collect();
        let mut first = None;
        for s in failed {
            if let Some(err) = self.failures.remove(&s) {
                first.get_or_insert(err);
            }
        }
        first
    }

    pub(crate) fn buffered_messages(&self) -> u32 {
        self.active.as_ref().map_or(0, BatchBuffer::message_count)
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.active.as_ref().map_or(0, BatchBuffer::size)
    }
}

/// All output queues of one class.
pub(crate) struct ClassQueues {
    pub(crate) class: QueueClass,
    pub(crate) limits: QueueLimits,
    pub(crate) queues: Mutex<BTreeMap<Rank, OutputQueue>>,
    /// Signalled on every completion; flush waits here.
    pub(crate) drained: Condvar,
}

impl ClassQueues {
    pub(crate) fn new(class: QueueClass, limits: QueueLimits) -> Self {
        Self {
            class,
            limits,
            queues: Mutex::new(BTreeMap::new()),
            drained: Condvar::new(),
        }
    }

    /// Append a message for `peer` and collect the batches that may now be
    /// dispatched. The lock is released before anything is sent.
    pub(crate) fn enqueue(
        &self,
        sender: Rank,
        peer: Rank,
        header: &MessageHeader,
        payload: &[u8],
        from_app: bool,
    ) -> Vec<Outbound> {
        let mut ready = Vec::new();
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(peer)
            .or_insert_with(|| OutputQueue::new(peer, self.class));
        if queue.append(sender, header, payload, from_app, self.limits.buf_target) {
            tracing::trace!(class = %self.class, peer, "batch reached byte target");
        }
        queue.take_ready(self.limits.max_rpc, &mut ready);
        ready
    }

    /// Seal partially filled batches that carry application messages.
    pub(crate) fn seal_app_batches(&self) -> Vec<Outbound> {
        let mut ready = Vec::new();
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            if queue.holds_app_messages() {
                queue.seal();
            }
            queue.take_ready(self.limits.max_rpc, &mut ready);
        }
        ready
    }

    /// Seal every active batch. Returns the per-queue flush targets and the
    /// batches that may go out now.
    pub(crate) fn seal_all(&self) -> (Vec<(Rank, u64)>, Vec<Outbound>) {
        let mut targets = Vec::new();
        let mut ready = Vec::new();
        let mut queues = self.queues.lock();
        for queue in queues.values_mut() {
            queue.seal();
            if let Some(last) = queue.last_sealed() {
                if !queue.drained_through(last) {
                    targets.push((queue.peer, last));
                }
            }
            queue.take_ready(self.limits.max_rpc, &mut ready);
        }
        (targets, ready)
    }

    /// Record a completion and pop whatever the freed slot lets through.
    pub(crate) fn complete(
        &self,
        peer: Rank,
        seq: u64,
        result: &Result<(), TransportError>,
    ) -> Vec<Outbound> {
        let mut ready = Vec::new();
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(&peer) {
                queue.complete(seq, result);
                queue.take_ready(self.limits.max_rpc, &mut ready);
            }
            self.drained.notify_all();
        }
        ready
    }

    /// Block until every target is drained, then report the first failure
    /// among the covered batches.
    pub(crate) fn wait_drained(&self, targets: &[(Rank, u64)], closed: &AtomicBool) -> ShuffleResult<()> {
        let mut queues = self.queues.lock();
        loop {
            let done = targets.iter().all(|&(peer, seq)| {
                queues
                    .get(&peer)
                    .map_or(true, |queue| queue.drained_through(seq))
            });
            if done {
                break;
            }
            if closed.load(Ordering::Acquire) {
                return Err(ShuffleError::Shutdown);
            }
            self.drained.wait(&mut queues);
        }

        let mut first = None;
        for &(peer, seq) in targets {
            if let Some(err) = queues
                .get_mut(&peer)
                .and_then(|queue| queue.take_failure_through(seq))
            {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Drop every queue and the batches it holds. Returns the number of
    /// messages discarded (buffered or waiting).
    pub(crate) fn clear(&self) -> u64 {
        let mut queues = self.queues.lock();
        let discarded = queues
            .values()
            .map(|queue| {
                queue.buffered_messages() as u64
                    + queue
                        .waitq
                        .iter()
                        .map(|sealed| sealed.batch.message_count() as u64)
                        .sum::<u64>()
            })
            .sum();
        queues.clear();
        self.drained.notify_all();
        discarded
    }

    pub(crate) fn wake_all(&self) {
        let _queues = self.queues.lock();
        self.drained.notify_all();
    }
}
