// A batch is the unit of one RPC: messages for the same next-hop peer,
// serialized back to back behind a batch header.

use crate::Shuffler::Structs::QueueClass;

/// A growable batch buffer being filled for one output queue.
///
/// ### Ownership:
/// - While filling, the batch belongs to its output queue.
/// - Once sealed it sits in the queue's wait list, still owned by the queue.
/// - On dispatch `into_payload` moves the bytes into the transport; the
///   in-flight RPC context keeps only the bookkeeping (sequence number and
///   application message count) needed at completion.
pub struct BatchBuffer {
    /// Hop role of the queue that owns this batch.
    pub(crate) class: QueueClass,

    /// Header followed by framed messages. The count field in the header is
    /// patched when the batch is turned into a payload.
    pub(crate) buf: Vec<u8>,

    /// Number of messages appended.
    pub(crate) messages: u32,

    /// How many of those came straight from the application (sender-limit
    /// accounting releases this many on completion).
    pub(crate) app_messages: u32,
}

/// A sealed batch waiting for an RPC slot, tagged with its queue sequence.
pub struct SealedBatch {
    pub seq: u64,
    pub batch: BatchBuffer,
}
