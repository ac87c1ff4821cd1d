//! Tagbus Client Library
//!
//! Everything a process needs to live on the tag bus: the [`Tag`]
//! abstraction, the per-process [`Registry`] of tag singletons, the
//! [`BusClient`] that keeps one TCP connection to the bus server, and the
//! [`Periodic`] scheduler for polled drivers and heartbeats.
//!
//! # Architecture
//!
//! - [`Registry`] - name -> [`Tag`] singletons, explicitly constructed and
//!   threaded through, never a process global
//! - [`Tag`] - typed value holder with timestamp, authorship, ordered
//!   change callbacks and an optional request-to-author handler
//! - [`BusClient`] - registers tags, publishes locally authored changes,
//!   applies remote changes, routes RTA both ways, reconnects with
//!   full-jitter backoff
//! - [`Periodic`] - fixed-period async scheduler with drift correction
//!
//! # Quick Start
//!
//! ```no_run
//! use tagbus_client::{BusClient, ClientConfig, Registry};
//! use tagbus_protocol::TagKind;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new();
//! let level = registry.tag("LakeLevel", TagKind::Float)?;
//! level.add_callback(0, |tag| {
//!     println!("{} = {:?}", tag.name(), tag.value());
//! });
//!
//! let client = BusClient::new(&registry, ClientConfig::default())?;
//! let cancel = CancellationToken::new();
//! tokio::spawn(client.run(cancel.clone()));
//!
//! level.set(402.5)?; // published to the bus by exception
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod periodic;
mod queue;
mod tag;

pub use client::{BusClient, ClientConfig, ClientMetricsHandle, ClientMetricsSnapshot};
pub use error::{ClientError, TagError};
pub use periodic::Periodic;
pub use tag::{now_us, CallbackId, Registry, Tag, TagMeta};

// Re-export the value types every consumer touches
pub use tagbus_protocol::{TagKind, TagValue};
