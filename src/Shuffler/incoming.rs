// Receive path for the shuffle RPC: unpack a batch, deliver what is mine,
// forward the rest, then acknowledge (or hold the acknowledgement while the
// delivery queue is over its max).

use std::sync::{Arc, Weak};

use crate::Core::error::TransportError;
use crate::Core::Topology::Rank;
use crate::Core::Transport::{IncomingHandler, Responder};
use crate::Shuffler::routing::{link_for, NextHop};
use crate::Shuffler::shuffle::Inner;
use crate::Shuffler::Batch::BatchReader;
use crate::Shuffler::Structs::Message;

/// Handler registered with the transport under the configured RPC name.
pub(crate) struct RpcEndpoint {
    pub(crate) inner: Weak<Inner>,
}

impl IncomingHandler for RpcEndpoint {
    fn on_rpc(&self, from: Rank, payload: Vec<u8>, reply: Responder) {
        match self.inner.upgrade() {
            Some(inner) => inner.receive(from, &payload, reply),
            None => reply(Err(TransportError::Closed)),
        }
    }
}

impl Inner {
    pub(crate) fn receive(self: &Arc<Self>, from: Rank, payload: &[u8], reply: Responder) {
        if self.is_closed() {
            reply(Err(TransportError::Closed));
            return;
        }

        let decoded = BatchReader::new(payload).and_then(|(header, reader)| {
            reader.collect_all().map(|messages| (header, messages))
        });
        let (header, messages) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(from, bytes = payload.len(), error = %err, "dropping malformed batch");
                reply(Err(TransportError::Malformed {
                    message: err.to_string(),
                }));
                return;
            }
        };

        self.stats.record_recv(link_for(header.class));
        tracing::debug!(from, class = %header.class, count = header.count, "batch received");

        let mut local = Vec::new();
        for (mh, body) in messages {
            if mh.is_broadcast() {
                self.fan_out_broadcast(header.class, &mh, body, &mut local);
                continue;
            }
            match self.router.next_hop(mh.dst, false) {
                Ok(NextHop::Deliver) => local.push(Message {
                    src: mh.src,
                    dst: mh.dst,
                    msg_type: mh.msg_type,
                    payload: body.to_vec(),
                }),
                Ok(NextHop::Forward { peer, class }) => {
                    self.stats.record_relayed();
                    if let Err(err) = self.enqueue_hop(peer, class, &mh, body, false) {
                        tracing::warn!(src = mh.src, dst = mh.dst, peer, error = %err, "forwarding failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(src = mh.src, dst = mh.dst, from, error = %err, "dropping unroutable message");
                }
            }
        }

        self.deliver_local(local);
        if self.deliverq.acknowledge(reply) {
            tracing::debug!(from, "acknowledgement held for delivery backpressure");
        }
    }
}
