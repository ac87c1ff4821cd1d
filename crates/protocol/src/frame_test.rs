//! Tests for the frame header codec

use bytes::{Bytes, BytesMut};

use crate::frame::{Command, Frame, FrameFlags};
use crate::{ProtocolError, DEFAULT_TUS, HEADER_SIZE};

fn sample_frame() -> Frame {
    Frame {
        command: Command::Set,
        tag_id: 42,
        flags: FrameFlags::LAST,
        time_us: 1_000_000,
        bus_id: 7,
        payload: Bytes::from_static(b"\x00\x00\x00\x00\x00\x00\x00\x00\x07"),
    }
}

// =============================================================================
// Round-trip
// =============================================================================

#[test]
fn test_frame_roundtrip() {
    let frame = sample_frame();
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf);

    assert_eq!(buf.len(), HEADER_SIZE + frame.payload.len());

    let decoded = Frame::decode(&mut buf, DEFAULT_TUS)
        .expect("decode failed")
        .expect("frame incomplete");
    assert_eq!(decoded, frame);
    assert!(buf.is_empty());
}

#[test]
fn test_frame_roundtrip_empty_payload() {
    let frame = Frame {
        command: Command::Get,
        tag_id: 3,
        flags: FrameFlags::LAST,
        time_us: 0,
        bus_id: 0,
        payload: Bytes::new(),
    };
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf);

    assert_eq!(buf.len(), HEADER_SIZE);
    let decoded = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn test_frame_roundtrip_all_commands() {
    for command in [
        Command::Id,
        Command::Set,
        Command::Get,
        Command::Rta,
        Command::Sub,
        Command::Err,
    ] {
        let frame = Frame {
            command,
            ..sample_frame()
        };
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf);
        let decoded = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
        assert_eq!(decoded.command, command);
    }
}

// =============================================================================
// Incomplete input
// =============================================================================

#[test]
fn test_decode_partial_header_returns_none() {
    let frame = sample_frame();
    let mut full = BytesMut::new();
    frame.encode_into(&mut full);

    for take in 0..HEADER_SIZE {
        let mut buf = BytesMut::from(&full[..take]);
        let result = Frame::decode(&mut buf, DEFAULT_TUS).unwrap();
        assert!(result.is_none(), "short header of {take} bytes decoded");
        assert_eq!(buf.len(), take, "short buffer must not be consumed");
    }
}

#[test]
fn test_decode_partial_payload_returns_none() {
    let frame = sample_frame();
    let mut full = BytesMut::new();
    frame.encode_into(&mut full);

    let mut buf = BytesMut::from(&full[..full.len() - 1]);
    assert!(Frame::decode(&mut buf, DEFAULT_TUS).unwrap().is_none());
}

#[test]
fn test_decode_two_frames_back_to_back() {
    let first = sample_frame();
    let second = Frame {
        tag_id: 43,
        ..sample_frame()
    };
    let mut buf = BytesMut::new();
    first.encode_into(&mut buf);
    second.encode_into(&mut buf);

    let a = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
    let b = Frame::decode(&mut buf, DEFAULT_TUS).unwrap().unwrap();
    assert_eq!(a.tag_id, 42);
    assert_eq!(b.tag_id, 43);
    assert!(Frame::decode(&mut buf, DEFAULT_TUS).unwrap().is_none());
}

// =============================================================================
// Malformed input
// =============================================================================

#[test]
fn test_decode_unknown_command() {
    let frame = sample_frame();
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf);
    buf[0] = 0x7f;

    match Frame::decode(&mut buf, DEFAULT_TUS) {
        Err(ProtocolError::UnknownCommand(0x7f)) => {}
        other => panic!("expected UnknownCommand, got {other:?}"),
    }
}

#[test]
fn test_decode_bad_flags() {
    let frame = sample_frame();
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf);

    // CONTINUATION and LAST together is not a legal combination
    buf[3] = 0b11;
    match Frame::decode(&mut buf, DEFAULT_TUS) {
        Err(ProtocolError::InvalidFlags(0b11)) => {}
        other => panic!("expected InvalidFlags, got {other:?}"),
    }
}

#[test]
fn test_decode_overlong_length_field() {
    let frame = sample_frame();
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf);

    // Length far beyond the TUS must fail immediately, even though the
    // buffer does not hold that many bytes yet.
    buf[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
    match Frame::decode(&mut buf, DEFAULT_TUS) {
        Err(ProtocolError::FrameTooLarge { .. }) => {}
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[test]
fn test_command_from_u8_rejects_zero() {
    assert!(Command::from_u8(0).is_err());
}

#[test]
fn test_flags_require_exactly_one_bit() {
    assert!(FrameFlags::from_u8(0).is_err());
    assert!(FrameFlags::from_u8(0b100).is_err());
    assert!(FrameFlags::from_u8(0b01).unwrap().is_continuation());
    assert!(FrameFlags::from_u8(0b10).unwrap().is_last());
}
