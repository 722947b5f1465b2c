// RPC dispatch and completion.
//
// Sealed batches are handed to the transport with no queue lock held. The
// completion callback only keeps a weak reference so in-flight RPCs never keep
// a shut-down shuffle alive.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::Core::error::{ShuffleResult, TransportError};
use crate::Core::Topology::Rank;
use crate::Core::Transport::RpcCallback;
use crate::Shuffler::outq::Outbound;
use crate::Shuffler::routing::link_for;
use crate::Shuffler::shuffle::Inner;
use crate::Shuffler::Structs::QueueClass;

impl Inner {
    /// Issue one RPC per batch, in order. A synchronous send failure is
    /// recorded against the batch (so a flush sees it), frees its slot and is
    /// returned; the remaining batches are still sent.
    pub(crate) fn dispatch(self: &Arc<Self>, ready: Vec<Outbound>) -> ShuffleResult<()> {
        let mut work: VecDeque<Outbound> = ready.into();
        let mut first_err: Option<TransportError> = None;

        while let Some(Outbound {
            peer,
            class,
            seq,
            batch,
        }) = work.pop_front()
        {
            let app_messages = batch.app_messages() as usize;
            let messages = batch.message_count();
            let link = link_for(class);
            let payload = batch.into_payload();
            let bytes = payload.len();

            let weak = Arc::downgrade(self);
            let done: RpcCallback = Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.complete(peer, class, seq, app_messages, result);
                }
            });

            tracing::debug!(%class, peer, seq, messages, bytes, "dispatching batch");
            match self
                .transport
                .send(&self.config.rpc_name, peer, link, payload, done)
            {
                Ok(()) => self.stats.record_send(link),
                Err(err) => {
                    tracing::warn!(%class, peer, seq, error = %err, "rpc send failed");
                    let failed = Err(err.clone());
                    work.extend(self.settle(peer, class, seq, app_messages, &failed));
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Completion path, run on a transport progress thread.
    pub(crate) fn complete(
        self: &Arc<Self>,
        peer: Rank,
        class: QueueClass,
        seq: u64,
        app_messages: usize,
        result: Result<(), TransportError>,
    ) {
        if let Err(err) = &result {
            tracing::warn!(%class, peer, seq, error = %err, "rpc completed with failure");
        }
        let ready = self.settle(peer, class, seq, app_messages, &result);
        if ready.is_empty() {
            return;
        }
        // Failures here are already recorded per batch for flush.
        let _ = self.dispatch(ready);
    }

    /// Retire a batch: give back sender capacity, free its RPC slot, wake
    /// flushers. Returns the waiting batches the freed slot lets through.
    fn settle(
        &self,
        peer: Rank,
        class: QueueClass,
        seq: u64,
        app_messages: usize,
        result: &Result<(), TransportError>,
    ) -> Vec<Outbound> {
        if let Some(limit) = self.sender_limit(class) {
            limit.release(app_messages);
        }
        self.queues(class).complete(peer, seq, result)
    }
}
