//! Remote address selection.
//!
//! Selection is deterministic: the first candidate of the chosen family wins.
//! A family is *connectable* when there is at least one remote candidate of
//! that family and the local link can reach it (any IPv4 address for IPv4, a
//! global IPv6 address for IPv6).

use crate::error::{ConnectionError, Result};
use crate::network::{NetworkCapabilities, TransportKind};
use crate::resolver::AddressSet;
use ikemob_transport::IpFamily;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// IP version of the session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// Chosen from the available candidates
    #[default]
    Auto,
    /// IPv4 required
    V4,
    /// IPv6 required
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// ESP encapsulation of the session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncapType {
    /// Decided by NAT detection
    #[default]
    Auto,
    /// Plain ESP
    None,
    /// ESP in UDP
    Udp,
}

impl fmt::Display for EncapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::None => write!(f, "none"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Pin the IP version implied by the encapsulation.
///
/// Plain ESP is only used over IPv6 and UDP encapsulation only over IPv4, so an
/// `Auto` version is narrowed accordingly. Explicit versions are returned as is.
#[must_use]
pub fn adjust_ip_version(version: IpVersion, encap: EncapType) -> IpVersion {
    match (version, encap) {
        (IpVersion::Auto, EncapType::None) => IpVersion::V6,
        (IpVersion::Auto, EncapType::Udp) => IpVersion::V4,
        (version, _) => version,
    }
}

/// Whether IPv4 should win over IPv6 when both are connectable
#[must_use]
pub fn prefers_ipv4(
    version: IpVersion,
    automatic_address_family_selection: bool,
    caps: &NetworkCapabilities,
) -> bool {
    matches!(version, IpVersion::Auto | IpVersion::V4)
        && automatic_address_family_selection
        && caps.has_transport(TransportKind::Wifi)
}

/// Result of address selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectedAddress {
    /// Family of the pair
    pub family: IpFamily,
    /// Remote address
    pub remote: IpAddr,
}

impl SelectedAddress {
    fn v4(candidates: &AddressSet) -> Option<Self> {
        candidates.v4.first().map(|addr| Self {
            family: IpFamily::V4,
            remote: IpAddr::V4(*addr),
        })
    }

    fn v6(candidates: &AddressSet) -> Option<Self> {
        candidates.v6.first().map(|c| Self {
            family: IpFamily::V6,
            remote: IpAddr::V6(c.address),
        })
    }
}

/// Pick the remote address.
///
/// 1. A required version must be connectable, else `NoUsableAddress`.
/// 2. IPv4 if preferred and connectable.
/// 3. IPv6 if connectable.
/// 4. IPv4 if connectable.
/// 5. `NoUsableAddress`.
///
/// # Errors
/// Returns `NoUsableAddress` when no acceptable family is connectable
pub fn select(
    candidates: &AddressSet,
    link_has_ipv4: bool,
    link_has_global_ipv6: bool,
    required: IpVersion,
    prefer_ipv4: bool,
) -> Result<SelectedAddress> {
    let ipv4 = if link_has_ipv4 {
        SelectedAddress::v4(candidates)
    } else {
        None
    };
    let ipv6 = if link_has_global_ipv6 {
        SelectedAddress::v6(candidates)
    } else {
        None
    };

    match required {
        IpVersion::V4 => {
            ipv4.ok_or_else(|| ConnectionError::no_usable_address("IPv4 required but not available"))
        }
        IpVersion::V6 => ipv6.ok_or_else(|| {
            ConnectionError::no_usable_address("IPv6 required but no global IPv6 address available")
        }),
        IpVersion::Auto => {
            let preferred = if prefer_ipv4 { ipv4 } else { None };
            preferred.or(ipv6).or(ipv4).ok_or_else(|| {
                ConnectionError::no_usable_address("No valid IPv4 or IPv6 addresses for peer")
            })
        }
    }
}
