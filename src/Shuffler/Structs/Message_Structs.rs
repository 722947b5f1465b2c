// Message types carried by the shuffle

use crate::Core::Topology::Rank;

/// Top bit of the message type marks a broadcast. Application types must
/// leave it clear.
pub const BROADCAST_BIT: u32 = 1 << 31;

/// Per-message header as it appears inside a batch.
/// Encoded little-endian; see `Batch::layout`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: Rank,
    pub dst: Rank,
    pub msg_type: u32,
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn is_broadcast(&self) -> bool {
        self.msg_type & BROADCAST_BIT != 0
    }
}

/// A message handed to the application's delivery callback.
///
/// For broadcasts `dst` is the receiving rank and `msg_type` keeps the
/// broadcast bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub src: Rank,
    pub dst: Rank,
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_broadcast(&self) -> bool {
        self.msg_type & BROADCAST_BIT != 0
    }

    /// Application type with the broadcast bit stripped.
    pub fn app_type(&self) -> u32 {
        self.msg_type & !BROADCAST_BIT
    }
}

/// Hop role of an output queue (and of the batches it sends).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueClass {
    /// Application traffic leaving this process over a same-node hop.
    Origin,
    /// Forwarded traffic from this node's representative to a local peer.
    Relay,
    /// Traffic crossing nodes, representative to representative.
    Remote,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Origin, QueueClass::Relay, QueueClass::Remote];

    pub fn as_u8(self) -> u8 {
        match self {
            QueueClass::Origin => 0,
            QueueClass::Relay => 1,
            QueueClass::Remote => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QueueClass::Origin),
            1 => Some(QueueClass::Relay),
            2 => Some(QueueClass::Remote),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueClass::Origin => "origin",
            QueueClass::Relay => "relay",
            QueueClass::Remote => "remote",
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
