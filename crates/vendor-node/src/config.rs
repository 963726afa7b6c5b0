//! Node configuration loaded from YAML.
//!
//! ```yaml
//! nodes:
//!   - name: gateway
//!     address: 1
//!     serial_number: 0x0A0B0C0D0E0F
//!     publish_jitter_secs: 0
//!   - name: meter
//!     address: 2
//!     capacity: 3
//!     quality: 200
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vendor_protocol::{MeshAddress, SerialNumber};

/// Configuration of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Name used in logs and metric labels.
    pub name: String,
    /// Own unicast address.
    pub address: MeshAddress,
    /// Publish (group) address for announcements and context-less requests.
    pub publish_address: MeshAddress,
    /// Deadline of acknowledged requests in milliseconds.
    pub request_timeout_ms: u64,
    /// Number of directory slots.
    pub directory_capacity: usize,
    /// Directory entries older than this are purged.
    pub node_max_age_secs: u64,
    /// Time between announcements.
    pub publish_interval_secs: u64,
    /// Upper bound of the random start-up delay.
    pub publish_jitter_secs: u64,
    /// Announced capacity.
    pub capacity: u8,
    /// Announced quality.
    pub quality: u8,
    /// Serial number stored on first start when none is persisted.
    pub serial_number: Option<SerialNumber>,
    /// JSON settings file. In-memory settings when absent.
    pub settings_path: Option<PathBuf>,
    /// Seed for the start-up delay. Random when absent.
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "node".to_string(),
            address: MeshAddress(0x0001),
            publish_address: MeshAddress(0xC000),
            request_timeout_ms: 5000,
            directory_capacity: 10,
            node_max_age_secs: 3600,
            publish_interval_secs: 3600,
            publish_jitter_secs: 100,
            capacity: 0,
            quality: 0,
            serial_number: None,
            settings_path: None,
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    /// A default configuration with the given name and address.
    pub fn new(name: impl Into<String>, address: u16) -> Self {
        NodeConfig {
            name: name.into(),
            address: MeshAddress(address),
            ..Default::default()
        }
    }

    /// Parse from a YAML string and validate.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.address.is_unicast() {
            return Err(ConfigError::invalid(
                "address",
                format!("{} is not a unicast address", self.address),
            ));
        }
        if self.publish_address.is_unassigned() {
            return Err(ConfigError::invalid("publish_address", "must be assigned"));
        }
        if self.directory_capacity == 0 {
            return Err(ConfigError::invalid("directory_capacity", "must be at least 1"));
        }
        if self.publish_interval_secs == 0 {
            return Err(ConfigError::invalid("publish_interval_secs", "must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms", "must be at least 1"));
        }
        if let Some(serial) = self.serial_number {
            if !serial.fits_device_sn() {
                return Err(ConfigError::invalid(
                    "serial_number",
                    format!("{} does not fit the 6-byte device serial", serial),
                ));
            }
        }
        Ok(())
    }

    /// Deadline of acknowledged requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Purge threshold.
    pub fn node_max_age(&self) -> Duration {
        Duration::from_secs(self.node_max_age_secs)
    }

    /// Time between announcements.
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    /// Upper bound of the start-up delay.
    pub fn publish_jitter(&self) -> Duration {
        Duration::from_secs(self.publish_jitter_secs)
    }
}

/// A set of nodes sharing one mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Node configurations.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl NetworkConfig {
    /// Parse from a YAML string and validate every node.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Validate every node and reject duplicate addresses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.address) {
                return Err(ConfigError::invalid(
                    "address",
                    format!("{} is used by more than one node", node.address),
                ));
            }
        }
        Ok(())
    }
}
