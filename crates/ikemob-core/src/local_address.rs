//! Local address discovery.
//!
//! The local address of a session is whatever source address the kernel picks
//! for the remote on the session's network. `RouteProbeAddressGenerator`
//! finds it by connecting a throwaway UDP socket (no packet is sent) and
//! reading back its local address.

use crate::error::Result;
use ikemob_transport::{IpFamily, NetworkHandle, TransportError, udp::bind_to_interface};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Source of the local address for a remote on a network
pub trait LocalAddressGenerator: Send + Sync {
    /// Local address used to reach `remote:remote_port` on `network`
    ///
    /// # Errors
    /// Returns `SocketUnavailable` if no route exists
    fn generate_local_address(
        &self,
        network: NetworkHandle,
        interface: Option<&str>,
        remote: IpAddr,
        remote_port: u16,
    ) -> Result<IpAddr>;
}

/// Generator asking the kernel routing table
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteProbeAddressGenerator;

impl LocalAddressGenerator for RouteProbeAddressGenerator {
    fn generate_local_address(
        &self,
        network: NetworkHandle,
        interface: Option<&str>,
        remote: IpAddr,
        remote_port: u16,
    ) -> Result<IpAddr> {
        let (domain, unspecified) = match IpFamily::of(&remote) {
            IpFamily::V4 => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpFamily::V6 => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };

        let probe = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::Io)?;
        if let Some(interface) = interface {
            bind_to_interface(&probe, interface).map_err(|e| {
                TransportError::NetworkBindFailed {
                    network,
                    reason: e.to_string(),
                }
            })?;
        }
        probe
            .bind(&SocketAddr::new(unspecified, 0).into())
            .map_err(TransportError::Io)?;
        probe
            .connect(&SocketAddr::new(remote, remote_port).into())
            .map_err(TransportError::Io)?;

        let local = probe
            .local_addr()
            .map_err(TransportError::Io)?
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| TransportError::Other("probe socket has no IP address".to_string()))?;

        tracing::trace!("Local address for {} on {}: {}", remote, network, local);
        Ok(local)
    }
}
