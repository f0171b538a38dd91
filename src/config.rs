//! # Configuration Management
//!
//! Centralized configuration for a NIC, its endpoints and the pull engine.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Sizing Considerations
//! - Message size classes (tiny/small/medium) pick the eager path; anything
//!   larger goes through rendezvous and pull
//! - Medium fragments and pull replies must fit in one frame, so both are
//!   checked against the MTU
//! - Pull handles reserve 16 bits for the context slot, capping outstanding
//!   pull contexts per endpoint

use crate::core::packet::{
    MacAddr, MAX_BODY_PAYLOAD, MEDIUM_HEADER_LEN, MSG_HEADER_LEN, PULL_REPLY_HEADER_LEN,
};
use crate::error::{MxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Default MTU: jumbo frames, so a 4 KiB page fits in one reply
pub const DEFAULT_MTU: usize = 9000;

/// Largest number of outstanding pull contexts an endpoint can address
pub const MAX_PULL_CONTEXTS: usize = 1 << 16;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MxConfig {
    /// Interface-level configuration
    #[serde(default)]
    pub nic: NicConfig,

    /// Message path and pull engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MxConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| MxError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| MxError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| MxError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(mac) = std::env::var("MX_ETHER_MAC") {
            config.nic.mac = mac;
        }

        if let Ok(hostname) = std::env::var("MX_ETHER_HOSTNAME") {
            config.nic.hostname = hostname;
        }

        if let Ok(mtu) = std::env::var("MX_ETHER_MTU") {
            if let Ok(val) = mtu.parse::<usize>() {
                config.nic.mtu = val;
            }
        }

        if let Ok(chunk) = std::env::var("MX_ETHER_MAX_PULL_CHUNK") {
            if let Ok(val) = chunk.parse::<u32>() {
                config.engine.max_pull_chunk = val;
            }
        }

        if let Ok(timeout) = std::env::var("MX_ETHER_PULL_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.engine.pull_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("MX_ETHER_LOG_LEVEL") {
            config.logging.log_level = Level::from_str(&level)
                .map_err(|_| MxError::Config(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MxError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| MxError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.nic.validate());
        errors.extend(self.engine.validate());
        errors.extend(self.engine.validate_against_mtu(self.nic.mtu));
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MxError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Interface-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NicConfig {
    /// Hostname advertised in host query replies
    pub hostname: String,

    /// Hardware address of this interface (e.g., "02:00:00:00:00:01")
    pub mac: String,

    /// Largest frame body the link carries, excluding the Ethernet header
    pub mtu: usize,

    /// Number of endpoint slots on this interface
    pub max_endpoints: usize,

    /// Region slots per endpoint
    pub max_regions: usize,

    /// Key a peer must present to connect
    pub app_key: u32,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            hostname: String::from("localhost"),
            mac: String::from("02:00:00:00:00:01"),
            mtu: DEFAULT_MTU,
            max_endpoints: 32,
            max_regions: 64,
            app_key: 0,
        }
    }
}

impl NicConfig {
    /// Parsed hardware address
    pub fn mac_addr(&self) -> Result<MacAddr> {
        MacAddr::from_str(&self.mac)
    }

    /// Validate interface configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hostname.is_empty() {
            errors.push("Hostname cannot be empty".to_string());
        } else if self.hostname.len() > 255 {
            errors.push(format!(
                "Hostname too long: {} bytes (maximum: 255)",
                self.hostname.len()
            ));
        }

        match self.mac_addr() {
            Ok(mac) if mac.is_broadcast() => {
                errors.push("MAC address cannot be the broadcast address".to_string())
            }
            Ok(_) => {}
            Err(_) => errors.push(format!(
                "Invalid MAC address format: '{}' (expected format: '02:00:00:00:00:01')",
                self.mac
            )),
        }

        if self.mtu < 1500 {
            errors.push(format!("MTU too small: {} (minimum: 1500)", self.mtu));
        } else if self.mtu > 65535 {
            errors.push(format!("MTU too large: {} (maximum: 65535)", self.mtu));
        }

        if self.max_endpoints == 0 || self.max_endpoints > 256 {
            errors.push(format!(
                "Max endpoints must be between 1 and 256, got {}",
                self.max_endpoints
            ));
        }

        if self.max_regions == 0 || self.max_regions > 256 {
            errors.push(format!(
                "Max regions must be between 1 and 256, got {}",
                self.max_regions
            ));
        }

        errors
    }
}

/// Message path and pull engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Largest payload sent as a single tiny packet
    pub tiny_max: usize,

    /// Largest payload sent as a single small packet
    pub small_max: usize,

    /// Largest payload sent as medium fragments; larger messages use rendezvous
    pub medium_max: usize,

    /// Payload bytes per medium fragment
    pub medium_frag_size: usize,

    /// Bytes requested by one pull context
    pub max_pull_chunk: u32,

    /// Payload bytes per pull reply packet
    pub max_reply_payload: usize,

    /// Outstanding pull contexts per endpoint
    pub max_pull_contexts: usize,

    /// Time a pull context may wait for its remaining bytes
    #[serde(with = "duration_serde")]
    pub pull_timeout: Duration,

    /// Time a rendezvous sender waits for the receiver's notify
    #[serde(with = "duration_serde")]
    pub notify_timeout: Duration,

    /// Interval of the background timeout sweep
    #[serde(with = "duration_serde")]
    pub timeout_tick: Duration,

    /// Answer unserviceable pull requests with a negative acknowledgement
    pub send_pull_nacks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiny_max: 32,
            small_max: 128,
            medium_max: 32 * 1024,
            medium_frag_size: 4096,
            max_pull_chunk: 32 * 1024,
            max_reply_payload: 4096,
            max_pull_contexts: 1024,
            pull_timeout: Duration::from_secs(1),
            notify_timeout: Duration::from_secs(5),
            timeout_tick: Duration::from_millis(100),
            send_pull_nacks: false,
        }
    }
}

impl EngineConfig {
    /// Validate engine configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tiny_max > self.small_max || self.small_max > self.medium_max {
            errors.push(format!(
                "Size classes must be ordered: tiny ({}) <= small ({}) <= medium ({})",
                self.tiny_max, self.small_max, self.medium_max
            ));
        }

        if self.small_max > MAX_BODY_PAYLOAD {
            errors.push(format!(
                "Small message limit too large: {} (maximum: {MAX_BODY_PAYLOAD})",
                self.small_max
            ));
        }

        if self.medium_max > u32::MAX as usize {
            errors.push("Medium message limit exceeds 32-bit message length".to_string());
        }

        if self.medium_frag_size == 0 || self.medium_frag_size > MAX_BODY_PAYLOAD {
            errors.push(format!(
                "Medium fragment size must be between 1 and {MAX_BODY_PAYLOAD}, got {}",
                self.medium_frag_size
            ));
        }

        if self.max_reply_payload == 0 || self.max_reply_payload > MAX_BODY_PAYLOAD {
            errors.push(format!(
                "Pull reply payload must be between 1 and {MAX_BODY_PAYLOAD}, got {}",
                self.max_reply_payload
            ));
        }

        if self.max_pull_chunk == 0 {
            errors.push("Pull chunk cannot be 0".to_string());
        } else if (self.max_pull_chunk as usize) < self.max_reply_payload {
            errors.push(format!(
                "Pull chunk ({}) smaller than one reply payload ({})",
                self.max_pull_chunk, self.max_reply_payload
            ));
        }

        if self.max_pull_contexts == 0 || self.max_pull_contexts > MAX_PULL_CONTEXTS {
            errors.push(format!(
                "Max pull contexts must be between 1 and {MAX_PULL_CONTEXTS}, got {}",
                self.max_pull_contexts
            ));
        }

        if self.pull_timeout.as_millis() < 10 {
            errors.push("Pull timeout too short (minimum: 10ms)".to_string());
        } else if self.pull_timeout.as_secs() > 300 {
            errors.push("Pull timeout too long (maximum: 300s)".to_string());
        }

        if self.notify_timeout < self.pull_timeout {
            errors.push("Notify timeout must not be shorter than the pull timeout".to_string());
        }

        if self.timeout_tick.is_zero() {
            errors.push("Timeout tick cannot be 0".to_string());
        } else if self.timeout_tick > self.pull_timeout {
            errors.push("Timeout tick longer than the pull timeout".to_string());
        }

        errors
    }

    /// Check that every frame the engine emits fits in `mtu`
    pub fn validate_against_mtu(&self, mtu: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if MSG_HEADER_LEN + self.small_max > mtu {
            errors.push(format!(
                "Small message of {} bytes does not fit MTU {mtu}",
                self.small_max
            ));
        }

        if MEDIUM_HEADER_LEN + self.medium_frag_size > mtu {
            errors.push(format!(
                "Medium fragment of {} bytes does not fit MTU {mtu}",
                self.medium_frag_size
            ));
        }

        if PULL_REPLY_HEADER_LEN + self.max_reply_payload > mtu {
            errors.push(format!(
                "Pull reply of {} bytes does not fit MTU {mtu}",
                self.max_reply_payload
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Base log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Per-subsystem overrides keyed by target (e.g. "mx::pull" = "trace")
    #[serde(default)]
    pub subsystem_levels: BTreeMap<String, String>,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mx-ether"),
            log_level: Level::INFO,
            subsystem_levels: BTreeMap::new(),
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        for (target, level) in &self.subsystem_levels {
            if target.is_empty() {
                errors.push("Subsystem target cannot be empty".to_string());
            }
            if Level::from_str(level).is_err() {
                errors.push(format!("Invalid log level '{level}' for subsystem '{target}'"));
            }
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
