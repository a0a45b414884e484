//! Remote hostname resolution with a fixed retry budget.

use crate::error::{ConnectionError, Result};
use crate::network::{LinkProperties, NetworkInfoProvider};
use ikemob_transport::{IpFamily, NetworkHandle};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Number of lookups attempted before resolution fails
pub const MAX_DNS_RESOLUTION_ATTEMPTS: u32 = 3;

/// Resolved IPv6 address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6Candidate {
    /// Address
    pub address: Ipv6Addr,
    /// Whether the address was synthesized from the link's NAT64 prefix
    pub is_nat64: bool,
}

/// Remote candidates from one resolution. Both families are always replaced
/// together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    /// IPv4 candidates, in resolver order
    pub v4: Vec<Ipv4Addr>,
    /// IPv6 candidates, in resolver order
    pub v6: Vec<Ipv6Candidate>,
}

impl AddressSet {
    /// Split resolver output by family, flagging NAT64 addresses of `link`
    #[must_use]
    pub fn from_addresses(addresses: &[IpAddr], link: &LinkProperties) -> Self {
        let mut set = Self::default();
        for addr in addresses {
            match addr {
                IpAddr::V4(v4) => set.v4.push(*v4),
                IpAddr::V6(v6) => set.v6.push(Ipv6Candidate {
                    address: *v6,
                    is_nat64: link.is_nat64(v6),
                }),
            }
        }
        set
    }

    /// Whether no candidate exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Families with at least one candidate
    #[must_use]
    pub fn families(&self) -> BTreeSet<IpFamily> {
        let mut families = BTreeSet::new();
        if !self.v4.is_empty() {
            families.insert(IpFamily::V4);
        }
        if !self.v6.is_empty() {
            families.insert(IpFamily::V6);
        }
        families
    }

    /// Drop NAT64 candidates; they may be stale after a network change
    pub fn remove_nat64(&mut self) {
        self.v6.retain(|candidate| !candidate.is_nat64);
    }

    /// IPv6 candidate addresses
    #[must_use]
    pub fn v6_addresses(&self) -> Vec<Ipv6Addr> {
        self.v6.iter().map(|c| c.address).collect()
    }
}

/// Resolve `hostname` on `network`.
///
/// Up to `MAX_DNS_RESOLUTION_ATTEMPTS` lookups are issued back to back. A lookup
/// that errors and one that returns no address both count as failed. Blocks
/// the calling thread.
///
/// # Errors
/// Returns `ResolutionFailed` when every attempt failed
pub fn resolve(
    provider: &dyn NetworkInfoProvider,
    network: NetworkHandle,
    hostname: &str,
    link: &LinkProperties,
) -> Result<AddressSet> {
    for attempt in 1..=MAX_DNS_RESOLUTION_ATTEMPTS {
        let will_retry = attempt < MAX_DNS_RESOLUTION_ATTEMPTS;
        match provider.all_addresses_for(network, hostname) {
            Ok(addresses) if !addresses.is_empty() => {
                let set = AddressSet::from_addresses(&addresses, link);
                tracing::debug!(
                    "Resolved {} on {}: v4={:?} v6={:?}",
                    hostname,
                    network,
                    set.v4,
                    set.v6_addresses()
                );
                return Ok(set);
            }
            Ok(_) => {
                tracing::debug!(
                    "No address for {} on attempt {}, retrying: {}",
                    hostname,
                    attempt,
                    will_retry
                );
            }
            Err(e) => {
                tracing::debug!(
                    "Failed to look up {} on attempt {}: {}, retrying: {}",
                    hostname,
                    attempt,
                    e,
                    will_retry
                );
            }
        }
    }

    Err(ConnectionError::ResolutionFailed(Cow::Owned(format!(
        "DNS resolution for {hostname} failed after {MAX_DNS_RESOLUTION_ATTEMPTS} attempts"
    ))))
}
