//! Network state as reported by the OS, and the traits through which the
//! controller queries and subscribes to it.

use crate::events::EventSink;
use ikemob_transport::NetworkHandle;
use std::io;
use std::net::{IpAddr, Ipv6Addr};

/// Link-layer transport of a network
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Wi-Fi
    Wifi,
    /// Cellular
    Cellular,
    /// Wired Ethernet
    Ethernet,
    /// Anything else (VPN, Bluetooth, ...)
    Other,
}

/// Capabilities of a network
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkCapabilities {
    transports: Vec<TransportKind>,
}

impl NetworkCapabilities {
    /// Capabilities with the given transports
    #[must_use]
    pub fn new(transports: impl IntoIterator<Item = TransportKind>) -> Self {
        let mut caps = Self::default();
        for transport in transports {
            if !caps.transports.contains(&transport) {
                caps.transports.push(transport);
            }
        }
        caps
    }

    /// Wi-Fi only
    #[must_use]
    pub fn wifi() -> Self {
        Self::new([TransportKind::Wifi])
    }

    /// Cellular only
    #[must_use]
    pub fn cellular() -> Self {
        Self::new([TransportKind::Cellular])
    }

    /// Whether the network uses `transport`
    #[must_use]
    pub fn has_transport(&self, transport: TransportKind) -> bool {
        self.transports.contains(&transport)
    }

    /// All transports
    #[must_use]
    pub fn transports(&self) -> &[TransportKind] {
        &self.transports
    }
}

/// NAT64 prefix advertised on a link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nat64Prefix {
    prefix: Ipv6Addr,
    len: u8,
}

impl Nat64Prefix {
    /// Create a prefix. `len` is clamped to 128.
    #[must_use]
    pub fn new(prefix: Ipv6Addr, len: u8) -> Self {
        Self {
            prefix,
            len: len.min(128),
        }
    }

    /// Whether `addr` lies inside the prefix
    #[must_use]
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u128::MAX << (128 - u32::from(self.len));
        (u128::from(*addr) & mask) == (u128::from(self.prefix) & mask)
    }
}

/// Link properties of a network
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkProperties {
    /// Interface name, used to bind sockets to the network
    pub interface_name: Option<String>,
    /// Local addresses on the link
    pub addresses: Vec<IpAddr>,
    /// NAT64 prefix, if the link does 464XLAT
    pub nat64_prefix: Option<Nat64Prefix>,
}

impl LinkProperties {
    /// Link with the given interface and addresses
    #[must_use]
    pub fn new(interface_name: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            interface_name: Some(interface_name.into()),
            addresses,
            nat64_prefix: None,
        }
    }

    /// Whether the link has any IPv4 address
    #[must_use]
    pub fn has_ipv4_address(&self) -> bool {
        self.addresses.iter().any(IpAddr::is_ipv4)
    }

    /// Whether the link has a globally routable IPv6 address
    #[must_use]
    pub fn has_global_ipv6_address(&self) -> bool {
        self.addresses.iter().any(|addr| match addr {
            IpAddr::V6(v6) => is_global_ipv6(v6),
            IpAddr::V4(_) => false,
        })
    }

    /// Whether the link has an address the session can use
    #[must_use]
    pub fn has_usable_address(&self) -> bool {
        self.has_ipv4_address() || self.has_global_ipv6_address()
    }

    /// Whether `addr` lies inside the link's NAT64 prefix
    #[must_use]
    pub fn is_nat64(&self, addr: &Ipv6Addr) -> bool {
        self.nat64_prefix
            .is_some_and(|prefix| prefix.contains(addr))
    }
}

/// Whether an IPv6 address is globally routable: not loopback, unspecified,
/// link-local (`fe80::/10`), unique-local (`fc00::/7`) or multicast.
#[must_use]
pub fn is_global_ipv6(addr: &Ipv6Addr) -> bool {
    let first = addr.segments()[0];
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00)
}

/// Read-only view of the OS network state
pub trait NetworkInfoProvider: Send + Sync {
    /// Current default network
    fn active_network(&self) -> Option<NetworkHandle>;

    /// Link properties of `network`, or `None` if the network is gone
    fn link_properties(&self, network: NetworkHandle) -> Option<LinkProperties>;

    /// Capabilities of `network`, or `None` if the network is gone
    fn capabilities(&self, network: NetworkHandle) -> Option<NetworkCapabilities>;

    /// Resolve `hostname` using the DNS servers of `network`. Blocks.
    ///
    /// # Errors
    /// Returns the resolver's I/O error
    fn all_addresses_for(
        &self,
        network: NetworkHandle,
        hostname: &str,
    ) -> io::Result<Vec<IpAddr>>;
}

/// Filter for network subscriptions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Required transports. Empty matches every network.
    pub transports: Vec<TransportKind>,
}

impl NetworkRequest {
    /// Request matching every network
    #[must_use]
    pub fn wildcard() -> Self {
        Self::default()
    }

    /// Whether a network with `caps` satisfies the request
    #[must_use]
    pub fn matches(&self, caps: &NetworkCapabilities) -> bool {
        self.transports.iter().all(|t| caps.has_transport(*t))
    }
}

/// Handle of a registered network subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// OS network-change subscription service.
///
/// Implementations deliver `ControllerEvent::Network` events through the
/// provided sink from whatever thread the OS calls back on.
pub trait NetworkSubscriber: Send + Sync {
    /// Subscribe to every network matching `request`
    fn register_for_network(&self, request: &NetworkRequest, sink: EventSink) -> SubscriptionId;

    /// Subscribe to changes of the default network
    fn register_for_default_network(&self, sink: EventSink) -> SubscriptionId;

    /// Cancel a subscription
    fn unregister(&self, id: SubscriptionId);
}
