//! Client-side error types
//!
//! [`TagError`] covers programming errors on the in-process tag surface:
//! they are raised to the caller and never recovered from internally.
//! [`ClientError`] covers the transient I/O and protocol failures of the
//! bus connection, which the client answers with a reconnect.

use std::time::Duration;

use thiserror::Error;

use tagbus_protocol::{ProtocolError, TagKind};

/// Programming errors on the Tag surface
#[derive(Debug, Error)]
pub enum TagError {
    /// A tag was re-created under the same name with a different type
    #[error("tag '{tag}' is declared {existing}, cannot recast to {requested}")]
    Redeclared {
        tag: String,
        existing: TagKind,
        requested: TagKind,
    },

    /// A value of the wrong kind was offered to a typed tag
    #[error("tag '{tag}' is {declared}, refusing {offered} value")]
    TypeMismatch {
        tag: String,
        declared: TagKind,
        offered: &'static str,
    },

    /// A callback attempted to write the tag it is firing for
    #[error("tag '{tag}' set from within its own callback")]
    ReentrantSet { tag: String },

    /// A second RTA handler was installed on the same tag
    #[error("tag '{tag}' already has an RTA handler")]
    RtaHandlerInstalled { tag: String },

    /// Deadband configured on a tag that is not int or float
    #[error("tag '{tag}' is not numeric, deadband is invalid")]
    DeadbandNotNumeric { tag: String },

    /// An RTA was requested with no bus client attached to the registry
    #[error("no bus client attached")]
    NotConnected,
}

/// Transient bus-connection errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// A bus client is already attached to this registry
    #[error("registry already has a bus client")]
    AlreadyAttached,

    /// TCP connect failed
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect did not complete within the dial timeout
    #[error("connect to {address} timed out")]
    DialTimeout { address: String },

    /// I/O error on the established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Nothing read from the server for too long
    #[error("no traffic from server for {idle:?}")]
    ReadSilence { idle: Duration },

    /// The server sent something the codec rejects
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
