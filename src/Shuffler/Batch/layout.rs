use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::Rank;
use crate::Shuffler::Structs::{MessageHeader, QueueClass};

/// Identifies a shuffle batch ("SH").
pub const BATCH_MAGIC: u16 = 0x5348;

/// The version of the batch layout.
pub const BATCH_VERSION: u8 = 1;

/// Batch header: magic u16, version u8, class u8, sender u32, count u32.
pub const BATCH_HEADER_LEN: usize = 12;

/// Message header: src u32, dst u32, type u32, payload length u32.
pub const MESSAGE_HEADER_LEN: usize = 16;

/// Byte offset of the message count inside the batch header.
pub(crate) const COUNT_OFFSET: usize = 8;

/// The header that opens every batch payload.
///
/// The class says which hop the batch travelled; receivers use it to decide
/// how a broadcast fans out from here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BatchHeader {
    pub class: QueueClass,
    pub sender: Rank,
    pub count: u32,
}

impl BatchHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&BATCH_MAGIC.to_le_bytes());
        out.push(BATCH_VERSION);
        out.push(self.class.as_u8());
        out.extend_from_slice(&self.sender.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> ShuffleResult<Self> {
        if bytes.len() < BATCH_HEADER_LEN {
            return Err(ShuffleError::malformed(format!(
                "batch of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != BATCH_MAGIC {
            return Err(ShuffleError::malformed(format!("bad magic 0x{magic:04x}")));
        }
        if bytes[2] != BATCH_VERSION {
            return Err(ShuffleError::malformed(format!("unsupported version {}", bytes[2])));
        }
        let class = QueueClass::from_u8(bytes[3])
            .ok_or_else(|| ShuffleError::malformed(format!("unknown queue class {}", bytes[3])))?;

        Ok(Self {
            class,
            sender: read_u32(bytes, 4),
            count: read_u32(bytes, COUNT_OFFSET),
        })
    }
}

pub(crate) fn encode_message_header(header: &MessageHeader, out: &mut Vec<u8>) {
    out.extend_from_slice(&header.src.to_le_bytes());
    out.extend_from_slice(&header.dst.to_le_bytes());
    out.extend_from_slice(&header.msg_type.to_le_bytes());
    out.extend_from_slice(&header.payload_len.to_le_bytes());
}

/// Caller guarantees `bytes` holds at least `MESSAGE_HEADER_LEN` bytes.
pub(crate) fn decode_message_header(bytes: &[u8]) -> MessageHeader {
    MessageHeader {
        src: read_u32(bytes, 0),
        dst: read_u32(bytes, 4),
        msg_type: read_u32(bytes, 8),
        payload_len: read_u32(bytes, 12),
    }
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
