//! Bus connection settings
//!
//! Where the bus server lives. Loopback on the default port unless told
//! otherwise; TLS and authentication are an external proxy's problem.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use tagbus_protocol::DEFAULT_PORT;

use crate::error::{ConfigError, Result};

/// Bus server address settings
///
/// # Example
///
/// ```yaml
/// address: 127.0.0.1
/// port: 1324
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Bus server host
    pub address: String,

    /// Bus server port
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl BusConfig {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        contents.parse()
    }
}

impl FromStr for BusConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config: BusConfig = "{}".parse().unwrap();
        assert_eq!(config, BusConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let config: BusConfig = "address: 10.0.0.5\nport: 2000\n".parse().unwrap();
        assert_eq!(config.address, "10.0.0.5");
        assert_eq!(config.port, 2000);
    }
}
