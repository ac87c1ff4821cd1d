//! Tagbus Protocol - wire codec and framing for the tag bus
//!
//! This crate provides the types shared by the bus server and every bus
//! client: the frame header codec, the type-tagged value encoding, and the
//! fragmentation/reassembly layer that lets tiny scalar updates and
//! multi-megabyte payloads share one TCP stream.
//!
//! # Protocol
//!
//! A connection carries frames with a fixed 18-byte big-endian header:
//!
//! ```text
//! [1: command][2: tag_id][1: flags][4: length][8: time_us][2: bus_id][length: payload]
//! ```
//!
//! * `command` - one of ID, SET, GET, RTA, SUB, ERR (see [`Command`])
//! * `tag_id`  - 16-bit bus-wide tag identifier, 0 for ID requests
//! * `flags`   - bit0 CONTINUATION, bit1 LAST (see [`FrameFlags`])
//! * `length`  - payload bytes carried in this frame
//! * `time_us` - microseconds since the Unix epoch, 0 when not applicable
//! * `bus_id`  - authoring connection id, 0 when not applicable
//!
//! A logical message whose payload exceeds the connection's transmit-unit
//! size (TUS) is split across frames sharing the same command, tag_id,
//! time_us and bus_id; every frame but the final one carries CONTINUATION,
//! the final one carries LAST. [`Framer`] performs the inverse: it turns an
//! ordered byte stream back into whole [`Message`]s.
//!
//! # Value encoding
//!
//! SET and RTA payloads are type-tagged: a kind byte followed by the body.
//! Kind 0 is int64, 1 is float64, 2 text, 3 bytes, 4 mapping/sequence as
//! canonical JSON. A zero-length payload is the null value ("not set yet").
//!
//! # Design
//!
//! - **Zero-copy**: payloads ride in `bytes::Bytes`; reassembly appends
//!   into a single growing buffer and freezes it once.
//! - **Stateless codec**: [`Frame`] encode/decode hold no state; only
//!   [`Reassembler`] buffers, per connection.

mod error;
mod frame;
mod framer;
mod value;

pub use error::ProtocolError;
pub use frame::{Command, Frame, FrameFlags};
pub use framer::{Framer, Message, Reassembler};
pub use value::{decode_value, encode_value, value_payload, TagKind, TagValue};

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Size of the fixed frame header in bytes
pub const HEADER_SIZE: usize = 18;

/// Default transmit-unit size: the largest frame (header + payload) either
/// side will emit before fragmenting. Also the server's negotiation cap.
pub const DEFAULT_TUS: usize = 55_000;

/// Smallest TUS a peer may negotiate down to
pub const MIN_TUS: usize = 256;

/// Hard cap on a reassembled message (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Reserved tag used for the connection hello and as the heartbeat target
pub const BUS_TAG: &str = "__bus__";

/// Key carrying the requester cookie in mapping-shaped RTA values
pub const RTA_ID_KEY: &str = "__rta_id__";

/// Default bus server port
pub const DEFAULT_PORT: u16 = 1324;

// Test modules - only compiled during testing
#[cfg(test)]
mod frame_test;
#[cfg(test)]
mod framer_test;
