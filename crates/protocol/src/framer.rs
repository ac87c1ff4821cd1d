//! Message framing: fragmentation and reassembly
//!
//! [`Message`] is a whole logical bus message. On the way out it is cut
//! into frames no larger than the connection's TUS; on the way in the
//! [`Framer`] consumes a raw byte stream and yields whole messages again.
//!
//! Fragments of one message share (command, tag_id, time_us, bus_id), so
//! reassembly is keyed by (command, tag_id): interleaving two in-flight
//! messages for the same tag and command on one connection is not legal.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::{
    Command, Frame, FrameFlags, ProtocolError, Result, HEADER_SIZE, MAX_MESSAGE_SIZE,
};

/// A whole logical bus message, independent of how it was framed
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind
    pub command: Command,
    /// Bus-wide tag id, 0 for ID requests
    pub tag_id: u16,
    /// Microseconds since the Unix epoch, 0 when not applicable
    pub time_us: u64,
    /// Authoring connection id, 0 when not applicable
    pub bus_id: u16,
    /// Assembled payload
    pub payload: Bytes,
}

impl Message {
    /// Create a message
    pub fn new(
        command: Command,
        tag_id: u16,
        time_us: u64,
        bus_id: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            command,
            tag_id,
            time_us,
            bus_id,
            payload,
        }
    }

    /// Number of frames this message occupies at the given TUS
    pub fn frame_count(&self, tus: usize) -> usize {
        let cap = payload_capacity(tus);
        if self.payload.is_empty() {
            1
        } else {
            self.payload.len().div_ceil(cap)
        }
    }

    /// Append this message to `buf` as one or more wire frames.
    ///
    /// Every frame but the final one carries CONTINUATION; the final frame
    /// carries LAST. An empty payload still produces one LAST frame.
    pub fn encode_into(&self, tus: usize, buf: &mut BytesMut) {
        let cap = payload_capacity(tus);
        let total = self.payload.len();

        if total == 0 {
            self.frame(FrameFlags::LAST, Bytes::new()).encode_into(buf);
            return;
        }

        let mut offset = 0;
        while offset < total {
            let end = (offset + cap).min(total);
            let flags = if end == total {
                FrameFlags::LAST
            } else {
                FrameFlags::CONTINUATION
            };
            self.frame(flags, self.payload.slice(offset..end))
                .encode_into(buf);
            offset = end;
        }
    }

    fn frame(&self, flags: FrameFlags, payload: Bytes) -> Frame {
        Frame {
            command: self.command,
            tag_id: self.tag_id,
            flags,
            time_us: self.time_us,
            bus_id: self.bus_id,
            payload,
        }
    }
}

/// Largest payload one frame can carry at the given TUS
fn payload_capacity(tus: usize) -> usize {
    tus.saturating_sub(HEADER_SIZE).max(1)
}

/// Puts fragmented messages back together.
///
/// One per connection. Continuation payloads accumulate per
/// (command, tag_id) until the LAST frame arrives; the assembled message
/// takes its time_us and bus_id from the final frame, which by contract
/// match every fragment.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<(Command, u16), BytesMut>,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns a message once its final frame arrives
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let key = (frame.command, frame.tag_id);

        if frame.flags.is_continuation() {
            let pending = self.pending.entry(key).or_default();
            pending.extend_from_slice(&frame.payload);
            if pending.len() > MAX_MESSAGE_SIZE {
                let size = pending.len();
                self.pending.remove(&key);
                return Err(ProtocolError::MessageTooLarge {
                    size,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            return Ok(None);
        }

        let payload = match self.pending.remove(&key) {
            Some(mut pending) => {
                pending.extend_from_slice(&frame.payload);
                if pending.len() > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::MessageTooLarge {
                        size: pending.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                pending.freeze()
            }
            None => frame.payload,
        };

        Ok(Some(Message {
            command: frame.command,
            tag_id: frame.tag_id,
            time_us: frame.time_us,
            bus_id: frame.bus_id,
            payload,
        }))
    }

    /// Bytes currently buffered across all partial messages
    pub fn buffered(&self) -> usize {
        self.pending.values().map(BytesMut::len).sum()
    }

    /// Drop all partial messages (connection reset)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Stream-to-message decoder: frame decoding plus reassembly.
///
/// Owns the per-connection receive state. The read loop appends socket
/// bytes to its own `BytesMut` and calls [`Framer::next`] until it returns
/// `None`, exactly like a length-prefix peek loop.
#[derive(Debug)]
pub struct Framer {
    reassembler: Reassembler,
    max_payload: usize,
}

impl Framer {
    /// Create a framer accepting frames up to `tus` bytes
    pub fn new(tus: usize) -> Self {
        Self {
            reassembler: Reassembler::new(),
            max_payload: payload_capacity(tus),
        }
    }

    /// Adjust the accepted frame size after TUS negotiation
    pub fn set_tus(&mut self, tus: usize) {
        self.max_payload = payload_capacity(tus);
    }

    /// Decode the next whole message out of `buf`, if one is complete
    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        while let Some(frame) = Frame::decode(buf, self.max_payload)? {
            if let Some(message) = self.reassembler.push(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Drop partial state (reconnect)
    pub fn reset(&mut self) {
        self.reassembler.clear();
    }
}
