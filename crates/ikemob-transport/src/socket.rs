//! IKE socket abstraction.
//!
//! This module defines the `IkeSocket` trait implemented by every socket
//! backend, the handle type the controller holds, and the `SocketProvider`
//! trait through which sockets are acquired and released.

use crate::transport::TransportResult;
use crate::{NetworkHandle, SocketVariant};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Length of the two SPI fields at the start of every IKE header
pub const SPI_HEADER_LEN: usize = 16;

/// SPI pair read from the fixed part of an inbound IKE header.
///
/// Only the SPIs are needed to route a packet to its session; the rest of the
/// header is parsed by the message layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Initiator SPI
    pub initiator_spi: u64,
    /// Responder SPI
    pub responder_spi: u64,
}

impl PacketHeader {
    /// Read the SPI pair, or `None` if the packet is too short
    #[must_use]
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < SPI_HEADER_LEN {
            return None;
        }
        let mut initiator = [0u8; 8];
        let mut responder = [0u8; 8];
        initiator.copy_from_slice(&packet[0..8]);
        responder.copy_from_slice(&packet[8..16]);
        Some(Self {
            initiator_spi: u64::from_be_bytes(initiator),
            responder_spi: u64::from_be_bytes(responder),
        })
    }
}

/// Receiver of demultiplexed inbound IKE packets
pub trait PacketReceiver: Send + Sync {
    /// Called from the socket's receive thread. Implementations must not block.
    fn on_packet_received(&self, header: PacketHeader, packet: Vec<u8>);
}

/// An IKE socket bound to one network.
pub trait IkeSocket: Send + Sync {
    /// Variant of this socket
    fn variant(&self) -> SocketVariant;

    /// Network the socket is bound to
    fn network(&self) -> NetworkHandle;

    /// Send an IKE packet to the server port of `remote`
    ///
    /// # Errors
    /// Returns `TransportError` if the socket is closed, the family does not
    /// match, or the send fails
    fn send_packet(&self, packet: &[u8], remote: IpAddr) -> TransportResult<usize>;

    /// Send a one-byte NAT-keepalive to the server port of `remote`, unframed
    ///
    /// # Errors
    /// Returns `TransportError` if the socket is closed or the send fails
    fn send_keepalive(&self, remote: IpAddr) -> TransportResult<()>;

    /// Route packets carrying `spi` to `receiver`
    fn register_spi(&self, spi: u64, receiver: Arc<dyn PacketReceiver>);

    /// Stop routing packets carrying `spi`
    fn unregister_spi(&self, spi: u64);

    /// SPIs currently registered on this socket
    fn registered_spis(&self) -> Vec<u64>;

    /// Local port of the socket
    ///
    /// # Errors
    /// Returns `TransportError` if the port cannot be determined
    fn local_port(&self) -> TransportResult<u16>;

    /// Remote (server) port the socket sends to
    fn remote_port(&self) -> u16 {
        self.variant().server_port()
    }

    /// Close the socket. Called by the arena when the last reference goes away.
    fn close(&self);
}

/// Identifier of a socket slot in a `SocketArena`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl SocketId {
    /// Raw id, for logging
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Identity of an entity holding socket references (one per controller)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// A referenced socket.
///
/// Cloning the handle does not add a reference; references are only added by
/// `SocketProvider::acquire` and removed by `SocketProvider::release`.
#[derive(Clone)]
pub struct SocketHandle {
    id: SocketId,
    socket: Arc<dyn IkeSocket>,
}

impl SocketHandle {
    /// Create a handle. Only socket providers should call this.
    #[must_use]
    pub fn new(id: SocketId, socket: Arc<dyn IkeSocket>) -> Self {
        Self { id, socket }
    }

    /// Arena id
    #[must_use]
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Underlying socket
    #[must_use]
    pub fn socket(&self) -> &Arc<dyn IkeSocket> {
        &self.socket
    }

    /// Variant of the underlying socket
    #[must_use]
    pub fn variant(&self) -> SocketVariant {
        self.socket.variant()
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.id)
            .field("variant", &self.socket.variant())
            .field("network", &self.socket.network())
            .finish()
    }
}

/// Parameters for acquiring a socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketRequest {
    /// Network to bind to
    pub network: NetworkHandle,
    /// Interface name of the network, if known
    pub interface: Option<String>,
    /// Socket variant
    pub variant: SocketVariant,
    /// DSCP value applied to outbound packets
    pub dscp: u8,
}

/// Source of IKE sockets.
///
/// Sockets are shared: acquiring the same variant on the same network with the
/// same DSCP returns the same socket id. Each owner holds at most one reference
/// per socket.
pub trait SocketProvider: Send + Sync {
    /// Acquire a reference to the socket matching `request` on behalf of `owner`
    ///
    /// # Errors
    /// Returns `TransportError` if the socket cannot be created or bound
    fn acquire(&self, request: &SocketRequest, owner: OwnerId) -> TransportResult<SocketHandle>;

    /// Release `owner`'s reference to `handle`
    fn release(&self, handle: &SocketHandle, owner: OwnerId);
}

/// Move one SPI registration from `old` to `new`.
///
/// The SPI is registered on the new socket before it is removed from the old
/// one so inbound packets are never dropped mid-switch.
pub fn migrate_spi(
    spi: u64,
    old: &SocketHandle,
    new: &SocketHandle,
    receiver: Arc<dyn PacketReceiver>,
) {
    new.socket().register_spi(spi, receiver);
    old.socket().unregister_spi(spi);
    tracing::trace!("Migrated SPI {:#018x} from {} to {}", spi, old.id(), new.id());
}
