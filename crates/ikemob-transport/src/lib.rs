//! # IKEMOB Transport
//!
//! Socket layer for the IKEMOB connection controller.
//!
//! This crate provides:
//! - The four IKE socket variants (IPv4/IPv6, port 500/4500)
//! - A reference-counted socket arena shared by all sessions
//! - UDP sockets bound to a network, with DSCP marking
//! - SPI-based demultiplexing of inbound IKE packets

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod factory;
pub mod network;
pub mod socket;
pub mod transport;
pub mod udp;
pub mod variant;

pub use arena::{SocketArena, SocketKey};
pub use factory::UdpSocketProvider;
pub use network::{IpFamily, NetworkHandle};
pub use socket::{
    IkeSocket, OwnerId, PacketHeader, PacketReceiver, SocketHandle, SocketId, SocketProvider,
    SocketRequest, migrate_spi,
};
pub use transport::{TransportError, TransportResult};
pub use variant::{
    NAT_KEEPALIVE_PAYLOAD, NON_ESP_MARKER, SERVER_PORT_NON_UDP_ENCAPSULATED,
    SERVER_PORT_UDP_ENCAPSULATED, SocketVariant,
};
