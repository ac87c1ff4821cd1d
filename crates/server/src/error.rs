//! Server error types

use thiserror::Error;

/// Errors that stop the bus server
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listening socket
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on the listener
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The 16-bit connection id space wrapped. Connection ids are never
    /// reused within a bus lifetime, so this is fatal by design - the
    /// supervisor restarts the process.
    #[error("connection id space exhausted")]
    ConnectionIdsExhausted,
}
