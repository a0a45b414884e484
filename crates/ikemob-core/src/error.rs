//! Error types for the connection controller
//!
//! Errors are split by how the owning session should react:
//!
//! - **Recoverable**: expected failures of one attempt (DNS exhausted, no usable
//!   address, socket creation failed). The session may tear down and retry.
//! - **Unrecoverable**: programming errors or invariant violations (an operation
//!   invoked in the wrong state). These indicate a bug in the caller.

use ikemob_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the connection controller
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// DNS resolution exhausted its attempts
    #[error("DNS resolution failed: {0}")]
    ResolutionFailed(Cow<'static, str>),

    /// No address family is connectable on the current link
    #[error("No usable address: {0}")]
    NoUsableAddress(Cow<'static, str>),

    /// Socket creation or binding failed
    #[error("Socket unavailable: {0}")]
    SocketUnavailable(#[from] TransportError),

    /// Configuration not supported (NAT-T over IPv6)
    #[error("Unsupported: {0}")]
    Unsupported(Cow<'static, str>),

    /// Link properties or capabilities missing for the network
    #[error("Setup failed: {0}")]
    SetupFailed(Cow<'static, str>),

    /// Network lost while mobility is disabled
    #[error("Fatal: {0}")]
    Fatal(Cow<'static, str>),

    /// Operation invoked in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Keepalive engine failed to start or restart
    #[error("Keepalive error: {0}")]
    Keepalive(Cow<'static, str>),

    /// An established SA could not follow a mobility update
    #[error("Failed to migrate SA {spi:#018x}: {source}")]
    MigrationFailed {
        /// Local SPI of the SA
        spi: u64,
        /// Why the SA refused the new address pair
        #[source]
        source: MigrationError,
    },
}

impl ConnectionError {
    /// Returns true for expected failures the owning session may recover from
    /// by tearing down and setting up again.
    ///
    /// `InvalidState`, `Fatal` and `MigrationFailed` are not recoverable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::InvalidState(_)
                | ConnectionError::Fatal(_)
                | ConnectionError::MigrationFailed { .. }
        )
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ConnectionError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a no-usable-address error with static context (zero allocation)
    #[must_use]
    pub const fn no_usable_address(context: &'static str) -> Self {
        ConnectionError::NoUsableAddress(Cow::Borrowed(context))
    }

    /// Create an unsupported error with static context (zero allocation)
    #[must_use]
    pub const fn unsupported(context: &'static str) -> Self {
        ConnectionError::Unsupported(Cow::Borrowed(context))
    }
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors reported by an `SaRecord` asked to move to a new address pair
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Another exchange on the SA is in progress
    #[error("SA busy: {0}")]
    Busy(Cow<'static, str>),

    /// The SA does not accept the address pair
    #[error("Address pair rejected: {0}")]
    Rejected(Cow<'static, str>),
}

/// Errors loading or validating session configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for `SessionParams`
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but a value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(Cow<'static, str>),
}
