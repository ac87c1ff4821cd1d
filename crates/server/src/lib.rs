//! Tagbus Server
//!
//! The bus server is the hub every tagbus process connects to: an
//! in-memory last-value store plus a publish/subscribe fabric over TCP.
//! It assigns 16-bit ids to tag names, fans SET updates out to every
//! subscriber except the author, answers GET and SUB with the stored
//! value, and routes request-to-author messages to whichever connection
//! most recently set the tag.
//!
//! # Design
//!
//! - **Per-connection tasks**: a reader task framing inbound bytes and a
//!   writer task draining a bounded queue, so one slow subscriber only
//!   blocks itself.
//! - **One state mutex**: every guarded operation is pure in-memory work;
//!   nothing suspends while holding it.
//! - **No persistence**: tag values live exactly as long as the process.
//!   Stale tags accumulate until restart; there is no delete.
//!
//! # Example
//!
//! ```no_run
//! use tagbus_server::{BusServer, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), tagbus_server::ServerError> {
//! let server = BusServer::new(ServerConfig::default());
//! server.run(CancellationToken::new()).await
//! # }
//! ```

mod error;
mod server;
mod state;

pub use error::ServerError;
pub use server::{BusServer, ServerConfig, ServerMetricsHandle, ServerMetricsSnapshot};
