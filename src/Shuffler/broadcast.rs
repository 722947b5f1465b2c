//! Broadcast fan-out over the 3-hop topology.
//!
//! The origin sends one copy to each local peer and one copy to the far-side
//! representative of every node it represents. A local peer that receives an
//! origin-class copy forwards it to the nodes *it* represents; a
//! representative that receives a remote-class copy relays it to its local
//! group. Relay-class copies are only delivered. Every process therefore sees
//! exactly one copy, and each inter-node link carries one RPC per batch.

use std::sync::Arc;

use bitflags::bitflags;

use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::Rank;
use crate::Shuffler::shuffle::{check_payload, Inner};
use crate::Shuffler::Structs::{Message, MessageHeader, QueueClass, BROADCAST_BIT};

bitflags! {
    /// Options for [`Shuffle::enqueue_broadcast`](crate::Shuffler::Shuffle::enqueue_broadcast).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BroadcastFlags: u32 {
        /// Also deliver the message to the calling process.
        const SELF_DELIVER = 1 << 0;
    }
}

impl Inner {
    pub(crate) fn enqueue_broadcast(
        self: &Arc<Self>,
        msg_type: u32,
        data: &[u8],
        flags: BroadcastFlags,
    ) -> ShuffleResult<()> {
        let payload_len = check_payload(msg_type, data)?;
        let me = self.me();
        let msg_type = msg_type | BROADCAST_BIT;

        if flags.contains(BroadcastFlags::SELF_DELIVER) {
            self.deliver_local(vec![Message {
                src: me,
                dst: me,
                msg_type,
                payload: data.to_vec(),
            }]);
        }

        let mut first_err: Option<ShuffleError> = None;
        let mut branches = 0usize;
        let mut send = |peer: Rank, class: QueueClass| {
            let header = MessageHeader {
                src: me,
                dst: peer,
                msg_type,
                payload_len,
            };
            self.stats.record_enqueued();
            branches += 1;
            if let Err(err) = self.enqueue_hop(peer, class, &header, data, true) {
                tracing::warn!(peer, %class, error = %err, "broadcast branch failed");
                if matches!(err, ShuffleError::Shutdown) {
                    return Err(err);
                }
                first_err.get_or_insert(err);
            }
            Ok(())
        };

        for &peer in self.router.local_peers() {
            send(peer, QueueClass::Origin)?;
        }
        for (_, rep) in self.router.represented_nodes() {
            send(rep, QueueClass::Remote)?;
        }

        tracing::debug!(msg_type, branches, "broadcast enqueued");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Deliver an arriving broadcast copy here and pass it on according to
    /// the hop it travelled.
    pub(crate) fn fan_out_broadcast(
        self: &Arc<Self>,
        arrived: QueueClass,
        header: &MessageHeader,
        payload: &[u8],
        local: &mut Vec<Message>,
    ) {
        let me = self.me();
        local.push(Message {
            src: header.src,
            dst: me,
            msg_type: header.msg_type,
            payload: payload.to_vec(),
        });

        let next: Vec<(Rank, QueueClass)> = match arrived {
            QueueClass::Origin => self
                .router
                .represented_nodes()
                .map(|(_, rep)| (rep, QueueClass::Remote))
                .collect(),
            QueueClass::Remote => self
                .router
                .local_peers()
                .iter()
                .map(|&peer| (peer, QueueClass::Relay))
                .collect(),
            QueueClass::Relay => Vec::new(),
        };

        for (peer, class) in next {
            let forwarded = MessageHeader { dst: peer, ..*header };
            self.stats.record_relayed();
            if let Err(err) = self.enqueue_hop(peer, class, &forwarded, payload, false) {
                tracing::warn!(src = header.src, peer, %class, error = %err, "broadcast forward failed");
            }
        }
    }
}
