//! The four IKE socket variants.
//!
//! A socket is distinguished by address family and by whether it talks to the
//! server's NAT-T port (4500) or the plain IKE port (500):
//!
//! ```text
//!                 port 500         port 4500
//!   IPv4          Udp4             Udp4Encap (NAT-encapsulated, keepalive-capable)
//!   IPv6          Udp6             Udp6WithEncapPort
//! ```

use crate::IpFamily;
use std::fmt;

/// Server port for IKE without UDP encapsulation
pub const SERVER_PORT_NON_UDP_ENCAPSULATED: u16 = 500;

/// Server port for IKE with UDP encapsulation (NAT-T)
pub const SERVER_PORT_UDP_ENCAPSULATED: u16 = 4500;

/// Non-ESP marker prepended to IKE messages sent on port 4500
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Payload of a NAT-keepalive datagram (RFC 3948)
pub const NAT_KEEPALIVE_PAYLOAD: [u8; 1] = [0xFF];

/// Socket variant selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketVariant {
    /// IPv4, server port 500
    Udp4,
    /// IPv6, server port 500
    Udp6,
    /// IPv6, server port 4500
    Udp6WithEncapPort,
    /// IPv4 UDP-encapsulation socket, server port 4500
    Udp4Encap,
}

impl SocketVariant {
    /// Pick the variant for a family and port requirement
    #[must_use]
    pub fn select(family: IpFamily, use_encap_port: bool) -> Self {
        match (family, use_encap_port) {
            (IpFamily::V4, false) => Self::Udp4,
            (IpFamily::V4, true) => Self::Udp4Encap,
            (IpFamily::V6, false) => Self::Udp6,
            (IpFamily::V6, true) => Self::Udp6WithEncapPort,
        }
    }

    /// Address family of the socket
    #[must_use]
    pub fn family(self) -> IpFamily {
        match self {
            Self::Udp4 | Self::Udp4Encap => IpFamily::V4,
            Self::Udp6 | Self::Udp6WithEncapPort => IpFamily::V6,
        }
    }

    /// Whether the socket talks to the server's NAT-T port
    #[must_use]
    pub fn uses_encap_port(self) -> bool {
        matches!(self, Self::Udp4Encap | Self::Udp6WithEncapPort)
    }

    /// Whether the socket is a UDP-encapsulation socket (the only keepalive target)
    #[must_use]
    pub fn is_nat_encapsulated(self) -> bool {
        self == Self::Udp4Encap
    }

    /// Remote (server) port
    #[must_use]
    pub fn server_port(self) -> u16 {
        if self.uses_encap_port() {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        }
    }
}

impl fmt::Display for SocketVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Udp6WithEncapPort => "udp6-encap-port",
            Self::Udp4Encap => "udp4-encap",
        };
        f.write_str(name)
    }
}
