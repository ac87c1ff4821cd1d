//! Frame header codec
//!
//! A [`Frame`] is one wire unit: header plus at most TUS worth of payload.
//! Logical messages larger than that are carried by several frames and put
//! back together by the [`Reassembler`](crate::Reassembler).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProtocolError, Result, HEADER_SIZE};

// Header field offsets
const OFF_COMMAND: usize = 0;
const OFF_TAG_ID: usize = 1;
const OFF_FLAGS: usize = 3;
const OFF_LENGTH: usize = 4;
const OFF_TIME_US: usize = 8;
const OFF_BUS_ID: usize = 16;

/// The six bus message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Query or announce a tag's bus-wide id; payload is the tag name
    Id = 0x01,
    /// Publish a tag value; payload is a type-tagged value
    Set = 0x02,
    /// Ask the server for a tag's current value; empty payload
    Get = 0x03,
    /// Request-to-author: routed to the connection that last set the tag
    Rta = 0x04,
    /// Subscribe to a tag's updates; empty payload
    Sub = 0x05,
    /// Diagnostic text from the server
    Err = 0x06,
}

impl Command {
    /// Parse a command byte
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Id),
            0x02 => Ok(Self::Set),
            0x03 => Ok(Self::Get),
            0x04 => Ok(Self::Rta),
            0x05 => Ok(Self::Sub),
            0x06 => Ok(Self::Err),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Id => "ID",
            Self::Set => "SET",
            Self::Get => "GET",
            Self::Rta => "RTA",
            Self::Sub => "SUB",
            Self::Err => "ERR",
        };
        f.write_str(name)
    }
}

/// Frame flags: exactly one of CONTINUATION or LAST is set on every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    const CONTINUATION_BIT: u8 = 0b01;
    const LAST_BIT: u8 = 0b10;

    /// A non-final fragment of a larger message
    pub const CONTINUATION: Self = Self(Self::CONTINUATION_BIT);

    /// The final (or only) frame of a message
    pub const LAST: Self = Self(Self::LAST_BIT);

    /// Parse a flags byte, rejecting anything but exactly one known bit
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            Self::CONTINUATION_BIT => Ok(Self::CONTINUATION),
            Self::LAST_BIT => Ok(Self::LAST),
            other => Err(ProtocolError::InvalidFlags(other)),
        }
    }

    /// True for a non-final fragment
    #[inline]
    pub fn is_continuation(self) -> bool {
        self.0 & Self::CONTINUATION_BIT != 0
    }

    /// True for the final frame of a message
    #[inline]
    pub fn is_last(self) -> bool {
        self.0 & Self::LAST_BIT != 0
    }

    /// Raw flags byte
    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// One wire frame: fixed header plus fragment payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Message kind
    pub command: Command,
    /// Bus-wide tag id, 0 for ID requests
    pub tag_id: u16,
    /// CONTINUATION or LAST
    pub flags: FrameFlags,
    /// Microseconds since the Unix epoch, 0 when not applicable
    pub time_us: u64,
    /// Authoring connection id, 0 when not applicable
    pub bus_id: u16,
    /// Fragment payload
    pub payload: Bytes,
}

impl Frame {
    /// Append this frame to `buf` in wire format
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.command as u8);
        buf.put_u16(self.tag_id);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u64(self.time_us);
        buf.put_u16(self.bus_id);
        buf.put_slice(&self.payload);
    }

    /// Decode one frame from the front of `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame, so
    /// the caller knows to read more from the socket before trying again.
    /// `max_payload` bounds a single frame's payload (the connection's TUS
    /// minus the header); a larger length field is a protocol violation.
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            buf[OFF_LENGTH],
            buf[OFF_LENGTH + 1],
            buf[OFF_LENGTH + 2],
            buf[OFF_LENGTH + 3],
        ]) as usize;

        // Validate the header before waiting for the payload: an absurd
        // length field must fail now, not stall the connection.
        let command = Command::from_u8(buf[OFF_COMMAND])?;
        let flags = FrameFlags::from_u8(buf[OFF_FLAGS])?;
        if length > max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: max_payload,
            });
        }

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let tag_id = u16::from_be_bytes([buf[OFF_TAG_ID], buf[OFF_TAG_ID + 1]]);
        let time_us = u64::from_be_bytes([
            buf[OFF_TIME_US],
            buf[OFF_TIME_US + 1],
            buf[OFF_TIME_US + 2],
            buf[OFF_TIME_US + 3],
            buf[OFF_TIME_US + 4],
            buf[OFF_TIME_US + 5],
            buf[OFF_TIME_US + 6],
            buf[OFF_TIME_US + 7],
        ]);
        let bus_id = u16::from_be_bytes([buf[OFF_BUS_ID], buf[OFF_BUS_ID + 1]]);

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Frame {
            command,
            tag_id,
            flags,
            time_us,
            bus_id,
            payload,
        }))
    }
}
