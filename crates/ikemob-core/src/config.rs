//! Session configuration
//!
//! `SessionParams` is what the owning session hands to the controller. It can
//! be built in code or loaded from TOML:
//!
//! ```toml
//! server_hostname = "vpn.example.com"
//! ip_version = "auto"
//! encap_type = "auto"
//! dscp = 0
//! natt_keepalive_delay_seconds = 120
//! skip_if_same_network = true
//!
//! [options]
//! force_port_4500 = false
//! automatic_address_family_selection = true
//! automatic_natt_keepalives = true
//! force_dns_resolution = false
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::ConfigError;
use crate::keepalive::{NATT_KEEPALIVE_DELAY_SEC_MAX, NATT_KEEPALIVE_DELAY_SEC_MIN};
use crate::logging::{LoggingConfig, VALID_LOG_LEVELS};
use crate::selector::{EncapType, IpVersion};
use ikemob_transport::NetworkHandle;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::path::Path;

/// Default NAT-T keepalive delay
pub const DEFAULT_NATT_KEEPALIVE_DELAY_SECONDS: u32 = 10;

/// Largest DSCP value (6 bits)
pub const MAX_DSCP: u8 = 63;

/// Behaviour switches of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IkeOptions {
    /// Always talk to the server's port 4500
    pub force_port_4500: bool,
    /// Prefer IPv4 on Wi-Fi when the version is automatic
    pub automatic_address_family_selection: bool,
    /// Derive the keepalive delay from the network transport
    pub automatic_natt_keepalives: bool,
    /// Re-resolve the server on every mobility event
    pub force_dns_resolution: bool,
}

/// Parameters of one IKE session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Server hostname or literal address
    pub server_hostname: String,

    /// Network pinned by the caller. `None` follows the default network.
    #[serde(default)]
    pub configured_network: Option<NetworkHandle>,

    /// Requested IP version
    #[serde(default)]
    pub ip_version: IpVersion,

    /// Requested ESP encapsulation
    #[serde(default)]
    pub encap_type: EncapType,

    /// DSCP applied to IKE packets
    #[serde(default)]
    pub dscp: u8,

    /// Configured NAT-T keepalive delay (also the ceiling for automatic delays)
    #[serde(default = "default_keepalive_delay")]
    pub natt_keepalive_delay_seconds: u32,

    /// Behaviour switches
    #[serde(default)]
    pub options: IkeOptions,

    /// Ignore link updates that change neither network nor addresses
    #[serde(default = "default_true")]
    pub skip_if_same_network: bool,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_keepalive_delay() -> u32 {
    DEFAULT_NATT_KEEPALIVE_DELAY_SECONDS
}

fn default_true() -> bool {
    true
}

impl SessionParams {
    /// Parameters for `server_hostname` with every other field at its default
    #[must_use]
    pub fn new(server_hostname: impl Into<String>) -> Self {
        Self {
            server_hostname: server_hostname.into(),
            configured_network: None,
            ip_version: IpVersion::default(),
            encap_type: EncapType::default(),
            dscp: 0,
            natt_keepalive_delay_seconds: DEFAULT_NATT_KEEPALIVE_DELAY_SECONDS,
            options: IkeOptions::default(),
            skip_if_same_network: true,
            logging: LoggingConfig::default(),
        }
    }

    /// Load and validate parameters from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate parameters from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or fails validation.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let params: Self = toml::from_str(contents)?;
        params.validate()?;
        Ok(params)
    }

    /// Validate parameters
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_hostname.trim().is_empty() {
            return Err(ConfigError::Invalid(Cow::Borrowed(
                "server_hostname must not be empty",
            )));
        }

        if self.dscp > MAX_DSCP {
            return Err(ConfigError::Invalid(Cow::Owned(format!(
                "dscp {} exceeds {}",
                self.dscp, MAX_DSCP
            ))));
        }

        if !(NATT_KEEPALIVE_DELAY_SEC_MIN..=NATT_KEEPALIVE_DELAY_SEC_MAX)
            .contains(&self.natt_keepalive_delay_seconds)
        {
            return Err(ConfigError::Invalid(Cow::Owned(format!(
                "natt_keepalive_delay_seconds must be between {} and {}",
                NATT_KEEPALIVE_DELAY_SEC_MIN, NATT_KEEPALIVE_DELAY_SEC_MAX
            ))));
        }

        if !self.logging.is_valid() {
            return Err(ConfigError::Invalid(Cow::Owned(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ))));
        }

        Ok(())
    }
}
