//! Tagbus Configuration
//!
//! YAML-based configuration with sensible defaults: the bus address and
//! the tag declaration file every module loads at startup. Declarations
//! are validated here, once, so the hot path never second-guesses them.
//!
//! # Parsing
//!
//! Both types implement `FromStr` as well as file loading:
//!
//! ```
//! use tagbus_config::{BusConfig, TagsFile};
//!
//! let bus: BusConfig = "port: 1324".parse().unwrap();
//! assert_eq!(bus.port, 1324);
//!
//! let tags: TagsFile = "Level:\n  desc: lake level\n".parse().unwrap();
//! assert_eq!(tags.defs().len(), 1);
//! ```

mod bus;
mod error;
mod tags;

pub use bus::BusConfig;
pub use error::{ConfigError, Result};
pub use tags::{TagDef, TagSpec, TagsFile};
