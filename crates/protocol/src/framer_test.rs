//! Tests for fragmentation and reassembly

use bytes::{Bytes, BytesMut};

use crate::frame::{Command, Frame};
use crate::framer::{Framer, Message, Reassembler};
use crate::{DEFAULT_TUS, HEADER_SIZE, MAX_MESSAGE_SIZE};

fn set_message(payload: Vec<u8>) -> Message {
    Message::new(Command::Set, 9, 1_000_000, 4, Bytes::from(payload))
}

// =============================================================================
// Fragmentation
// =============================================================================

#[test]
fn test_small_message_is_one_last_frame() {
    let msg = set_message(b"small".to_vec());
    let mut buf = BytesMut::new();
    msg.encode_into(DEFAULT_TUS, &mut buf);

    let frame = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
    assert!(frame.flags.is_last());
    assert_eq!(frame.payload, msg.payload);
    assert!(buf.is_empty());
}

#[test]
fn test_empty_message_still_emits_a_frame() {
    let msg = Message::new(Command::Get, 3, 0, 0, Bytes::new());
    let mut buf = BytesMut::new();
    msg.encode_into(DEFAULT_TUS, &mut buf);

    let frame = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
    assert!(frame.flags.is_last());
    assert!(frame.payload.is_empty());
}

#[test]
fn test_fragment_flags_and_sizes() {
    // TUS of 100 leaves 82 payload bytes per frame; 200 bytes -> 3 frames
    let tus = 100;
    let cap = tus - HEADER_SIZE;
    let payload: Vec<u8> = (0..200u8).collect();
    let msg = set_message(payload.clone());

    assert_eq!(msg.frame_count(tus), 3);

    let mut buf = BytesMut::new();
    msg.encode_into(tus, &mut buf);

    let mut frames = Vec::new();
    while let Some(frame) = Frame::decode(&mut buf, tus).unwrap() {
        frames.push(frame);
    }
    assert_eq!(frames.len(), 3);
    assert!(frames[0].flags.is_continuation());
    assert!(frames[1].flags.is_continuation());
    assert!(frames[2].flags.is_last());
    assert_eq!(frames[0].payload.len(), cap);
    assert_eq!(frames[1].payload.len(), cap);
    assert_eq!(frames[2].payload.len(), 200 - 2 * cap);

    // All fragments share the message header fields
    for frame in &frames {
        assert_eq!(frame.tag_id, 9);
        assert_eq!(frame.time_us, 1_000_000);
        assert_eq!(frame.bus_id, 4);
    }
}

// =============================================================================
// Reassembly
// =============================================================================

#[test]
fn test_reassembler_restores_fragmented_payload() {
    let tus = 64;
    let payload: Vec<u8> = (0..255u8).cycle().take(1000).collect();
    let msg = set_message(payload.clone());

    let mut buf = BytesMut::new();
    msg.encode_into(tus, &mut buf);

    let mut reassembler = Reassembler::new();
    let mut out = None;
    while let Some(frame) = Frame::decode(&mut buf, tus).unwrap() {
        if let Some(message) = reassembler.push(frame).unwrap() {
            assert!(out.is_none(), "more than one message produced");
            out = Some(message);
        }
    }

    let out = out.expect("no message produced");
    assert_eq!(out, msg);
    assert_eq!(reassembler.buffered(), 0);
}

#[test]
fn test_reassembler_interleaves_different_tags() {
    let tus = 64;
    let a = set_message((0..200u8).collect());
    let b = Message::new(Command::Set, 10, 2_000_000, 5, Bytes::from(vec![9u8; 150]));

    let mut buf_a = BytesMut::new();
    let mut buf_b = BytesMut::new();
    a.encode_into(tus, &mut buf_a);
    b.encode_into(tus, &mut buf_b);

    let mut frames = Vec::new();
    while let Some(f) = Frame::decode(&mut buf_a, tus).unwrap() {
        frames.push(f);
    }
    let mut i = 0;
    while let Some(f) = Frame::decode(&mut buf_b, tus).unwrap() {
        // interleave b's frames between a's
        frames.insert(i * 2 + 1, f);
        i += 1;
    }

    let mut reassembler = Reassembler::new();
    let mut out = Vec::new();
    for frame in frames {
        if let Some(m) = reassembler.push(frame).unwrap() {
            out.push(m);
        }
    }
    assert_eq!(out.len(), 2);
    assert!(out.contains(&a));
    assert!(out.contains(&b));
}

#[test]
fn test_reassembler_enforces_message_cap() {
    let huge = Frame {
        command: Command::Set,
        tag_id: 1,
        flags: crate::FrameFlags::CONTINUATION,
        time_us: 0,
        bus_id: 0,
        payload: Bytes::from(vec![0u8; DEFAULT_TUS - HEADER_SIZE]),
    };

    let mut reassembler = Reassembler::new();
    let mut pushed = 0usize;
    let fragment = DEFAULT_TUS - HEADER_SIZE;
    loop {
        match reassembler.push(huge.clone()) {
            Ok(None) => {
                pushed += fragment;
                assert!(pushed <= MAX_MESSAGE_SIZE + fragment, "cap never hit");
            }
            Err(crate::ProtocolError::MessageTooLarge { .. }) => break,
            other => panic!("unexpected result {other:?}"),
        }
    }
    // Partial state is discarded after the violation
    assert_eq!(reassembler.buffered(), 0);
}

// =============================================================================
// Framer (stream level)
// =============================================================================

#[test]
fn test_framer_yields_messages_across_reads() {
    let msg = set_message((0..100u8).collect());
    let mut wire = BytesMut::new();
    msg.encode_into(DEFAULT_TUS, &mut wire);
    let wire = wire.freeze();

    let mut framer = Framer::new(DEFAULT_TUS);
    let mut buf = BytesMut::new();

    // Deliver the stream in 7-byte slices like a miserly socket
    let mut got = None;
    for chunk in wire.chunks(7) {
        buf.extend_from_slice(chunk);
        if let Some(m) = framer.next(&mut buf).unwrap() {
            assert!(got.is_none());
            got = Some(m);
        }
    }
    assert_eq!(got.unwrap(), msg);
}

#[test]
fn test_framer_large_message_roundtrip() {
    // 2 MiB payload fragments and reassembles byte-for-byte
    let payload: Vec<u8> = (0..(2 * 1024 * 1024)).map(|i| (i % 251) as u8).collect();
    let msg = set_message(payload);

    let mut wire = BytesMut::new();
    msg.encode_into(DEFAULT_TUS, &mut wire);
    assert_eq!(
        msg.frame_count(DEFAULT_TUS),
        (2 * 1024 * 1024usize).div_ceil(DEFAULT_TUS - HEADER_SIZE)
    );

    let mut framer = Framer::new(DEFAULT_TUS);
    let got = framer.next(&mut wire).unwrap().expect("message incomplete");
    assert_eq!(got, msg);
    assert!(framer.next(&mut wire).unwrap().is_none());
}
