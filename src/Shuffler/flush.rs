// Flush and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Shuffler::shuffle::{Inner, Shuffle};
use crate::Shuffler::Structs::QueueClass;

/// What a flush call waits for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushScope {
    Origin,
    Relay,
    Remote,
    Delivery,
    /// Origin, remote, relay, then delivery.
    All,
}

impl FlushScope {
    /// Stage order used by `All` and by `quiesce`.
    pub const STAGES: [FlushScope; 4] = [
        FlushScope::Origin,
        FlushScope::Remote,
        FlushScope::Relay,
        FlushScope::Delivery,
    ];
}

impl From<QueueClass> for FlushScope {
    fn from(class: QueueClass) -> Self {
        match class {
            QueueClass::Origin => FlushScope::Origin,
            QueueClass::Relay => FlushScope::Relay,
            QueueClass::Remote => FlushScope::Remote,
        }
    }
}

/// What shutdown threw away.
pub(crate) struct CloseSummary {
    /// Messages still sitting in output queues.
    pub queued: u64,
    /// Messages in the delivery queue.
    pub undelivered: u64,
}

impl Inner {
    /// Seal every batch of `class`, push out what the RPC cap allows and wait
    /// until all of them completed. Reports (and consumes) the first failure
    /// among those batches.
    pub(crate) fn flush_class(self: &Arc<Self>, class: QueueClass) -> ShuffleResult<()> {
        self.check_open()?;
        let queues = self.queues(class);
        let (targets, ready) = queues.seal_all();
        tracing::debug!(%class, queues = targets.len(), "flush");
        // Send failures are recorded per batch and come back from the wait.
        let _ = self.dispatch(ready);
        queues.wait_drained(&targets, &self.closed)
    }

    pub(crate) fn flush_scope(self: &Arc<Self>, scope: FlushScope) -> ShuffleResult<()> {
        match scope {
            FlushScope::Origin => self.flush_class(QueueClass::Origin),
            FlushScope::Relay => self.flush_class(QueueClass::Relay),
            FlushScope::Remote => self.flush_class(QueueClass::Remote),
            FlushScope::Delivery => {
                self.check_open()?;
                self.deliverq.flush()
            }
            FlushScope::All => {
                let mut first = None;
                for stage in FlushScope::STAGES {
                    if let Err(err) = self.flush_scope(stage) {
                        if matches!(err, ShuffleError::Shutdown) {
                            return Err(err);
                        }
                        first.get_or_insert(err);
                    }
                }
                first.map_or(Ok(()), Err)
            }
        }
    }

    /// Stop accepting work and drop every queue. Returns `None` if the
    /// shuffle was already closed.
    pub(crate) fn close(&self) -> Option<CloseSummary> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.transport.deregister(&self.config.rpc_name);
        self.local_limit.close();
        self.remote_limit.close();

        let queued: u64 = QueueClass::ALL
            .iter()
            .map(|&class| self.queues(class).clear())
            .sum();
        let undelivered = self.deliverq.close();
        if queued > 0 || undelivered > 0 {
            tracing::warn!(rank = self.me(), queued, undelivered, "shutdown discarded messages");
        }
        Some(CloseSummary { queued, undelivered })
    }
}

impl Shuffle {
    /// Block until everything in `scope` that existed at the call has
    /// completed.
    pub fn flush(&self, scope: FlushScope) -> ShuffleResult<()> {
        self.inner.flush_scope(scope)
    }

    pub fn flush_origin_queues(&self) -> ShuffleResult<()> {
        self.flush(FlushScope::Origin)
    }

    pub fn flush_relay_queues(&self) -> ShuffleResult<()> {
        self.flush(FlushScope::Relay)
    }

    pub fn flush_remote_queues(&self) -> ShuffleResult<()> {
        self.flush(FlushScope::Remote)
    }

    /// Wait until every message in the delivery queue at the time of the call
    /// has been handed to the application. Must not be called from inside
    /// the delivery handler.
    pub fn flush_delivery(&self) -> ShuffleResult<()> {
        self.flush(FlushScope::Delivery)
    }

    /// Flush every stage on this process only.
    pub fn flush_all(&self) -> ShuffleResult<()> {
        self.flush(FlushScope::All)
    }

    /// Job-wide quiescence: every stage is flushed and followed by a global
    /// barrier, so once every rank returns, every message enqueued before the
    /// call has been delivered. All ranks must call it.
    pub fn quiesce(&self) -> ShuffleResult<()> {
        let mut first = None;
        for stage in FlushScope::STAGES {
            if let Err(err) = self.inner.flush_scope(stage) {
                tracing::warn!(rank = self.rank(), ?stage, error = %err, "quiesce stage failed");
                first.get_or_insert(err);
            }
            // Barrier even after a failed stage; every rank makes the same calls.
            self.inner.topology.global_barrier()?;
        }
        first.map_or(Ok(()), Err)
    }
}
