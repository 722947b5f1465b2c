use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::Core::config::ShuffleConfig;
use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::{Rank, Topology};
use crate::Core::Transport::Transport;
use crate::Debug::StructDebug::StateDump;
use crate::Shuffler::broadcast::BroadcastFlags;
use crate::Shuffler::deliverq::DeliveryQueue;
use crate::Shuffler::outq::ClassQueues;
use crate::Shuffler::routing::{NextHop, Router};
use crate::Shuffler::senderlimit::SenderLimit;
use crate::Shuffler::stats::{ShuffleStats, StatsSnapshot};
use crate::Shuffler::Structs::{Message, MessageHeader, QueueClass, BROADCAST_BIT};

/// State shared between the handle, transport completions, the incoming RPC
/// handler and the delivery thread.
pub(crate) struct Inner {
    pub(crate) config: ShuffleConfig,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) router: Router,
    pub(crate) origin: ClassQueues,
    pub(crate) relay: ClassQueues,
    pub(crate) remote: ClassQueues,
    pub(crate) local_limit: SenderLimit,
    pub(crate) remote_limit: SenderLimit,
    pub(crate) deliverq: DeliveryQueue,
    pub(crate) stats: ShuffleStats,
    pub(crate) closed: AtomicBool,
    /// Set when the fabric was bootstrapped for this shuffle.
    pub(crate) owns_fabric: bool,
}

impl Inner {
    pub(crate) fn new(
        config: ShuffleConfig,
        topology: Arc<dyn Topology>,
        transport: Arc<dyn Transport>,
        router: Router,
        owns_fabric: bool,
    ) -> Self {
        Self {
            origin: ClassQueues::new(QueueClass::Origin, config.origin),
            relay: ClassQueues::new(QueueClass::Relay, config.relay),
            remote: ClassQueues::new(QueueClass::Remote, config.remote),
            local_limit: SenderLimit::new("local", config.local_sender_limit),
            remote_limit: SenderLimit::new("remote", config.remote_sender_limit),
            deliverq: DeliveryQueue::new(config.deliverq_max, config.deliverq_threshold),
            stats: ShuffleStats::default(),
            closed: AtomicBool::new(false),
            config,
            topology,
            transport,
            router,
            owns_fabric,
        }
    }

    pub(crate) fn me(&self) -> Rank {
        self.router.me()
    }

    pub(crate) fn queues(&self, class: QueueClass) -> &ClassQueues {
        match class {
            QueueClass::Origin => &self.origin,
            QueueClass::Relay => &self.relay,
            QueueClass::Remote => &self.remote,
        }
    }

    /// The limit application sends of `class` count against. Relay queues
    /// only ever carry forwarded traffic.
    pub(crate) fn sender_limit(&self, class: QueueClass) -> Option<&SenderLimit> {
        match class {
            QueueClass::Origin => Some(&self.local_limit),
            QueueClass::Remote => Some(&self.remote_limit),
            QueueClass::Relay => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> ShuffleResult<()> {
        if self.is_closed() {
            Err(ShuffleError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Put one message on the output queue for (`peer`, `class`).
    ///
    /// Application sends take a sender-limit slot first and block while the
    /// class is saturated; the send that fills the last slot seals the
    /// class's partial batches. Returns the first synchronous dispatch failure.
    pub(crate) fn enqueue_hop(
        self: &Arc<Self>,
        peer: Rank,
        class: QueueClass,
        header: &MessageHeader,
        payload: &[u8],
        from_app: bool,
    ) -> ShuffleResult<()> {
        let queues = self.queues(class);
        if from_app {
            if let Some(limit) = self.sender_limit(class) {
                limit
                    .acquire(|| {
                        let ready = queues.seal_app_batches();
                        if let Err(err) = self.dispatch(ready) {
                            tracing::debug!(%class, error = %err, "dispatch under sender pressure failed");
                        }
                    })
                    .map_err(|_| ShuffleError::Shutdown)?;
                if self.is_closed() {
                    limit.release(1);
                    return Err(ShuffleError::Shutdown);
                }
            }
        }

        let mut ready = queues.enqueue(self.me(), peer, header, payload, from_app);
        // The send holding the last slot seals too: waiters only seal
        // before they sleep, not after a slot changes hands.
        if from_app && self.sender_limit(class).is_some_and(SenderLimit::is_saturated) {
            ready.extend(queues.seal_app_batches());
        }
        self.dispatch(ready)
    }

    /// Route an application message one hop closer to its destination.
    pub(crate) fn send_app(self: &Arc<Self>, header: MessageHeader, payload: &[u8]) -> ShuffleResult<()> {
        match self.router.next_hop(header.dst, true)? {
            NextHop::Deliver => {
                self.deliver_local(vec![Message {
                    src: header.src,
                    dst: header.dst,
                    msg_type: header.msg_type,
                    payload: payload.to_vec(),
                }]);
                Ok(())
            }
            NextHop::Forward { peer, class } => {
                tracing::trace!(dst = header.dst, peer, %class, "enqueue");
                self.enqueue_hop(peer, class, &header, payload, true)
            }
        }
    }

    /// Push straight into the delivery queue. Never blocks.
    pub(crate) fn deliver_local(&self, messages: Vec<Message>) {
        if !self.deliverq.push(messages) {
            tracing::debug!("delivery queue closed, local messages dropped");
        }
    }
}

/// Checks shared by every application send.
pub(crate) fn check_payload(msg_type: u32, data: &[u8]) -> ShuffleResult<u32> {
    if msg_type & BROADCAST_BIT != 0 {
        return Err(ShuffleError::InvalidMessage {
            message: format!("type {msg_type:#x} uses the reserved broadcast bit"),
        });
    }
    u32::try_from(data.len()).map_err(|_| ShuffleError::InvalidMessage {
        message: format!("payload of {} bytes does not fit a message header", data.len()),
    })
}

/// Handle to a running shuffle.
///
/// Created by [`ShuffleBuilder`](crate::Shuffler::ShuffleBuilder). Enqueue
/// calls may come from any thread. Dropping the handle shuts the shuffle down
/// without flushing.
pub struct Shuffle {
    pub(crate) inner: Arc<Inner>,
    pub(crate) deliverer: Option<JoinHandle<()>>,
}

impl Shuffle {
    /// Send `data` to `dst`.
    ///
    /// Success means the bytes were copied into a local queue; the caller may
    /// reuse `data` immediately. Blocks while the sender limit of the first
    /// hop's class is saturated.
    pub fn enqueue(&self, dst: Rank, msg_type: u32, data: &[u8]) -> ShuffleResult<()> {
        self.inner.check_open()?;
        let payload_len = check_payload(msg_type, data)?;
        let header = MessageHeader {
            src: self.inner.me(),
            dst,
            msg_type,
            payload_len,
        };
        self.inner.stats.record_enqueued();
        self.inner.send_app(header, data)
    }

    /// Send `data` to every process in the job.
    ///
    /// The delivered type carries the broadcast bit. Only first-hop failures
    /// are reported; branches fail independently.
    pub fn enqueue_broadcast(&self, msg_type: u32, data: &[u8], flags: BroadcastFlags) -> ShuffleResult<()> {
        self.inner.check_open()?;
        self.inner.enqueue_broadcast(msg_type, data, flags)
    }

    pub fn rank(&self) -> Rank {
        self.inner.me()
    }

    pub fn size(&self) -> usize {
        self.inner.topology.global_size()
    }

    pub fn local_rank(&self) -> usize {
        self.inner.topology.local_rank()
    }

    pub fn local_size(&self) -> usize {
        self.inner.topology.local_size()
    }

    /// Global barrier through the topology layer.
    pub fn barrier(&self) -> ShuffleResult<()> {
        self.inner.topology.global_barrier()
    }

    pub fn local_barrier(&self) -> ShuffleResult<()> {
        self.inner.topology.local_barrier()
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Snapshot of every queue, the delivery queue and the sender limits.
    pub fn dump_state(&self) -> StateDump {
        StateDump::capture(&self.inner)
    }

    /// Emit [`dump_state`](Self::dump_state) through `tracing` at info level.
    pub fn log_state(&self) {
        let dump = self.dump_state();
        tracing::info!(rank = dump.rank, "shuffle state\n{dump}");
    }

    /// Stop accepting sends and release every queue.
    ///
    /// Nothing still queued is guaranteed to arrive; flush first if it
    /// matters. Fails with [`ShuffleError::DeliveryPanicked`] if the delivery
    /// callback panicked; the shuffle is torn down either way.
    pub fn shutdown(mut self) -> ShuffleResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> ShuffleResult<()> {
        let summary = self.inner.close();
        let mut result = Ok(());
        if let Some(handle) = self.deliverer.take() {
            if handle.join().is_err() {
                tracing::warn!(rank = self.inner.me(), "delivery thread panicked");
                result = Err(ShuffleError::DeliveryPanicked { rank: self.inner.me() });
            }
        }
        if let Some(summary) = summary {
            if self.inner.owns_fabric {
                self.inner.transport.finalize();
            }
            tracing::info!(
                rank = self.inner.me(),
                discarded_queued = summary.queued,
                discarded_undelivered = summary.undelivered,
                "shuffle shut down"
            );
        }
        result
    }
}

impl Drop for Shuffle {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
