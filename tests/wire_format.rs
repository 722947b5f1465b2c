// Wire format conformance for batch payloads. Peers built from other
// languages decode these bytes, so the layout is pinned byte for byte.
// Observed encodings are printed to help when a mismatch shows up.
mod common;

use common::Cluster;
use hop_shuffle::Core::config::DEFAULT_RPC_NAME;
use hop_shuffle::Shuffler::Batch::layout::{BATCH_HEADER_LEN, BATCH_MAGIC, BATCH_VERSION, MESSAGE_HEADER_LEN};
use hop_shuffle::Shuffler::Batch::{BatchBuffer, BatchHeader, BatchReader};
use hop_shuffle::Shuffler::Structs::MessageHeader;
use hop_shuffle::{Link, QueueClass, Transport, TransportError};
use std::sync::mpsc;

#[test]
fn test_batch_layout() {
    let mut batch = BatchBuffer::new(QueueClass::Remote, 0x0102_0304, 0);
    batch.push(
        &MessageHeader {
            src: 7,
            dst: 9,
            msg_type: 0x8000_0001,
            payload_len: 3,
        },
        b"abc",
        true,
    );
    let bytes = batch.into_payload();
    println!("batch => len: {}, bytes: {:02x?}", bytes.len(), bytes);

    assert_eq!(BATCH_HEADER_LEN, 12);
    assert_eq!(MESSAGE_HEADER_LEN, 16);
    assert_eq!(bytes.len(), BATCH_HEADER_LEN + MESSAGE_HEADER_LEN + 3);

    let mut expected = Vec::new();
    expected.extend_from_slice(&[0x48, 0x53]); // magic, little-endian
    expected.push(BATCH_VERSION);
    expected.push(2); // remote
    expected.extend_from_slice(&[0x04, 0x03, 0x02, 0x01]); // sender
    expected.extend_from_slice(&[1, 0, 0, 0]); // count
    expected.extend_from_slice(&[7, 0, 0, 0, 9, 0, 0, 0]);
    expected.extend_from_slice(&[0x01, 0x00, 0x00, 0x80]);
    expected.extend_from_slice(&[3, 0, 0, 0]);
    expected.extend_from_slice(b"abc");
    assert_eq!(bytes, expected);
    assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), BATCH_MAGIC);

    let (header, _) = BatchReader::new(&bytes).unwrap();
    assert_eq!(
        header,
        BatchHeader {
            class: QueueClass::Remote,
            sender: 0x0102_0304,
            count: 1
        }
    );
}

#[test]
fn test_queue_class_codes() {
    for class in QueueClass::ALL {
        println!("{class} => {}", class.as_u8());
        assert_eq!(QueueClass::from_u8(class.as_u8()), Some(class));
    }
    assert_eq!(QueueClass::Origin.as_u8(), 0);
    assert_eq!(QueueClass::Relay.as_u8(), 1);
    assert_eq!(QueueClass::Remote.as_u8(), 2);
    assert_eq!(QueueClass::from_u8(3), None);
}

#[test]
fn malformed_batch_is_refused_and_nothing_delivered() {
    let cluster = Cluster::new(1, 2);
    let raw = cluster.fabric.endpoint(0);

    let mut batch = BatchBuffer::new(QueueClass::Origin, 0, 0);
    batch.push(
        &MessageHeader {
            src: 0,
            dst: 1,
            msg_type: 0,
            payload_len: 4,
        },
        b"good",
        true,
    );
    let mut truncated = batch.into_payload();
    truncated.pop();

    // A header claiming far more messages than the bytes can hold.
    let mut inflated = BatchBuffer::new(QueueClass::Origin, 0, 0).into_payload();
    inflated[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(BatchReader::new(&inflated).is_err());

    for payload in [b"junk".to_vec(), truncated, inflated] {
        let (tx, rx) = mpsc::channel();
        raw.send(
            DEFAULT_RPC_NAME,
            1,
            Link::Local,
            payload,
            Box::new(move |result| tx.send(result).unwrap()),
        )
        .unwrap();
        assert!(matches!(rx.recv().unwrap(), Err(TransportError::Malformed { .. })));
    }

    cluster.shuffles[1].flush_delivery().unwrap();
    assert!(cluster.inbox(1).is_empty());
    assert_eq!(cluster.shuffles[1].stats().delivered, 0);
}
