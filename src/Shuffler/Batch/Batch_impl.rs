use super::layout::{
    decode_message_header, encode_message_header, BatchHeader, BATCH_HEADER_LEN, COUNT_OFFSET,
    MESSAGE_HEADER_LEN,
};
use super::Batch::BatchBuffer;
use crate::Core::error::{ShuffleError, ShuffleResult};
use crate::Core::Topology::Rank;
use crate::Shuffler::Structs::{MessageHeader, QueueClass};

impl BatchBuffer {
    /// Start an empty batch sent by `sender` on a `class` queue.
    pub fn new(class: QueueClass, sender: Rank, capacity_hint: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity_hint.max(BATCH_HEADER_LEN));
        BatchHeader {
            class,
            sender,
            count: 0,
        }
        .encode(&mut buf);

        Self {
            class,
            buf,
            messages: 0,
            app_messages: 0,
        }
    }

    /// Append one framed message. The payload is copied.
    pub fn push(&mut self, header: &MessageHeader, payload: &[u8], from_app: bool) {
        debug_assert_eq!(header.payload_len as usize, payload.len());
        encode_message_header(header, &mut self.buf);
        self.buf.extend_from_slice(payload);
        self.messages += 1;
        if from_app {
            self.app_messages += 1;
        }
    }

    /// Bytes the batch would put on the wire, framing included.
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    #[inline]
    pub fn message_count(&self) -> u32 {
        self.messages
    }

    #[inline]
    pub fn app_messages(&self) -> u32 {
        self.app_messages
    }

    #[inline]
    pub fn class(&self) -> QueueClass {
        self.class
    }

    /// Finish the header and give up the bytes.
    pub fn into_payload(mut self) -> Vec<u8> {
        self.buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&self.messages.to_le_bytes());
        self.buf
    }
}

/// Walks the messages of a received batch without copying payloads.
pub struct BatchReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> BatchReader<'a> {
    /// Validate the header and position the reader on the first message.
    pub fn new(bytes: &'a [u8]) -> ShuffleResult<(BatchHeader, Self)> {
        let header = BatchHeader::decode(bytes)?;
        let body = bytes.len().saturating_sub(BATCH_HEADER_LEN);
        if header.count as usize > body / MESSAGE_HEADER_LEN {
            return Err(ShuffleError::malformed(format!(
                "header claims {} messages but only {body} bytes follow",
                header.count
            )));
        }
        Ok((
            header,
            Self {
                bytes,
                offset: BATCH_HEADER_LEN,
                remaining: header.count,
            },
        ))
    }

    /// Decode everything up front so a truncated batch is rejected whole.
    pub fn collect_all(self) -> ShuffleResult<Vec<(MessageHeader, &'a [u8])>> {
        let mut out = Vec::with_capacity(self.remaining as usize);
        for item in self {
            out.push(item?);
        }
        Ok(out)
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = ShuffleResult<(MessageHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if self.offset != self.bytes.len() {
                let trailing = self.bytes.len() - self.offset;
                self.offset = self.bytes.len();
                return Some(Err(ShuffleError::malformed(format!(
                    "{trailing} trailing bytes after last message"
                ))));
            }
            return None;
        }

        let bytes = self.bytes;
        let rest = &bytes[self.offset..];
        if rest.len() < MESSAGE_HEADER_LEN {
            self.remaining = 0;
            self.offset = self.bytes.len();
            return Some(Err(ShuffleError::malformed("truncated message header")));
        }
        let header = decode_message_header(rest);
        let end = MESSAGE_HEADER_LEN + header.payload_len as usize;
        if rest.len() < end {
            self.remaining = 0;
            self.offset = self.bytes.len();
            return Some(Err(ShuffleError::malformed(format!(
                "message payload of {} bytes runs past end of batch",
                header.payload_len
            ))));
        }

        self.offset += end;
        self.remaining -= 1;
        Some(Ok((header, &rest[MESSAGE_HEADER_LEN..end])))
    }
}
