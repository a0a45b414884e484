//! UDP implementation of the IKE socket variants.
//!
//! Every variant is a plain UDP socket on an ephemeral local port. The variants
//! differ in address family and in the server port they talk to; sockets using
//! the NAT-T port frame IKE messages with the non-ESP marker.
//!
//! Features:
//! - Binding to a network interface (`SO_BINDTODEVICE`) on Linux/Android
//! - DSCP marking (`IP_TOS` / `IPV6_TCLASS`)
//! - Background receive thread with SPI demultiplexing

use crate::socket::{IkeSocket, PacketHeader, PacketReceiver, SocketRequest};
use crate::transport::{TransportError, TransportResult};
use crate::variant::{NAT_KEEPALIVE_PAYLOAD, NON_ESP_MARKER};
use crate::{IpFamily, NetworkHandle, SocketVariant};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Socket buffer size requested for IKE sockets
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Largest datagram the receive thread accepts
const MAX_DATAGRAM_SIZE: usize = 65536;

/// How often the receive thread checks whether the socket was closed
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

type ReceiverMap = DashMap<u64, Arc<dyn PacketReceiver>>;

/// UDP-backed IKE socket
pub struct UdpIkeSocket {
    socket: UdpSocket,
    variant: SocketVariant,
    network: NetworkHandle,
    receivers: Arc<ReceiverMap>,
    closed: Arc<AtomicBool>,
}

impl UdpIkeSocket {
    /// Create a socket for `request` and start its receive thread
    ///
    /// # Errors
    /// Returns `TransportError` if the socket cannot be created, configured or
    /// bound to the requested network
    pub fn open(request: &SocketRequest) -> TransportResult<Arc<Self>> {
        let family = request.variant.family();
        let (domain, unspecified) = match family {
            IpFamily::V4 => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpFamily::V6 => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };

        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        if family == IpFamily::V6 {
            socket2
                .set_only_v6(true)
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        }

        socket2
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        apply_dscp(&socket2, family, request.dscp)
            .map_err(|e| TransportError::BindFailed(format!("DSCP: {e}")))?;

        if let Some(interface) = &request.interface {
            bind_to_interface(&socket2, interface).map_err(|e| {
                TransportError::NetworkBindFailed {
                    network: request.network,
                    reason: e.to_string(),
                }
            })?;
        }

        socket2
            .bind(&SocketAddr::new(unspecified, 0).into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let socket: UdpSocket = socket2.into();
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        let this = Arc::new(Self {
            socket,
            variant: request.variant,
            network: request.network,
            receivers: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        });
        this.spawn_receiver()?;

        tracing::debug!(
            "Opened {} socket on {} (local port {:?})",
            request.variant,
            request.network,
            this.socket.local_addr().map(|a| a.port()).ok()
        );
        Ok(this)
    }

    fn spawn_receiver(&self) -> TransportResult<()> {
        let socket = self.socket.try_clone()?;
        let receivers = Arc::clone(&self.receivers);
        let closed = Arc::clone(&self.closed);
        let variant = self.variant;

        thread::Builder::new()
            .name(format!("ikemob-recv-{variant}"))
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                while !closed.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((size, from)) => {
                            tracing::trace!("Received {} bytes from {}", size, from);
                            dispatch(variant, &receivers, &buf[..size]);
                        }
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut
                                || e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            if !closed.load(Ordering::Acquire) {
                                tracing::warn!("Error receiving on {} socket: {}", variant, e);
                            }
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }
}

/// Route one inbound datagram to the receiver registered for its SPI
fn dispatch(variant: SocketVariant, receivers: &ReceiverMap, datagram: &[u8]) {
    let packet = if variant.uses_encap_port() {
        // Without the marker the datagram is ESP or a NAT-keepalive; neither is ours.
        match datagram.strip_prefix(&NON_ESP_MARKER[..]) {
            Some(ike) => ike,
            None => return,
        }
    } else {
        datagram
    };

    let Some(header) = PacketHeader::parse(packet) else {
        tracing::debug!("Dropping short packet ({} bytes)", packet.len());
        return;
    };

    let receiver = receivers
        .get(&header.initiator_spi)
        .or_else(|| receivers.get(&header.responder_spi))
        .map(|entry| Arc::clone(entry.value()));

    match receiver {
        Some(receiver) => receiver.on_packet_received(header, packet.to_vec()),
        None => tracing::debug!(
            "No session for SPIs {:#018x}/{:#018x}",
            header.initiator_spi,
            header.responder_spi
        ),
    }
}

impl IkeSocket for UdpIkeSocket {
    fn variant(&self) -> SocketVariant {
        self.variant
    }

    fn network(&self) -> NetworkHandle {
        self.network
    }

    fn send_packet(&self, packet: &[u8], remote: IpAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let destination = IpFamily::of(&remote);
        if destination != self.variant.family() {
            return Err(TransportError::FamilyMismatch {
                socket: self.variant.family(),
                destination,
            });
        }

        let addr = SocketAddr::new(remote, self.variant.server_port());
        if self.variant.uses_encap_port() {
            let mut framed = Vec::with_capacity(NON_ESP_MARKER.len() + packet.len());
            framed.extend_from_slice(&NON_ESP_MARKER);
            framed.extend_from_slice(packet);
            Ok(self.socket.send_to(&framed, addr)?)
        } else {
            Ok(self.socket.send_to(packet, addr)?)
        }
    }

    fn send_keepalive(&self, remote: IpAddr) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let addr = SocketAddr::new(remote, self.variant.server_port());
        self.socket.send_to(&NAT_KEEPALIVE_PAYLOAD, addr)?;
        Ok(())
    }

    fn register_spi(&self, spi: u64, receiver: Arc<dyn PacketReceiver>) {
        self.receivers.insert(spi, receiver);
    }

    fn unregister_spi(&self, spi: u64) {
        self.receivers.remove(&spi);
    }

    fn registered_spis(&self) -> Vec<u64> {
        self.receivers.iter().map(|entry| *entry.key()).collect()
    }

    fn local_port(&self) -> TransportResult<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.receivers.clear();
    }
}

impl Drop for UdpIkeSocket {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Bind a socket to a network interface
///
/// # Errors
/// Returns the OS error if the interface does not exist or the caller lacks
/// the required privilege
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn bind_to_interface(socket: &Socket, interface: &str) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let name = interface.as_bytes();
    // SAFETY: `name` is valid for `name.len()` bytes for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr().cast::<libc::c_void>(),
            name.len() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Bind a socket to a network interface (no-op on this platform)
///
/// # Errors
/// Never fails on this platform
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn bind_to_interface(_socket: &Socket, interface: &str) -> io::Result<()> {
    tracing::debug!("Interface binding unsupported here, ignoring {}", interface);
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn apply_dscp(socket: &Socket, family: IpFamily, dscp: u8) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    if dscp == 0 {
        return Ok(());
    }

    let tos: libc::c_int = libc::c_int::from(dscp) << 2;
    let (level, name) = match family {
        IpFamily::V4 => (libc::IPPROTO_IP, libc::IP_TOS),
        IpFamily::V6 => (libc::IPPROTO_IPV6, libc::IPV6_TCLASS),
    };
    // SAFETY: `tos` lives on the stack for the duration of the call and its size is passed.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&tos as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn apply_dscp(_socket: &Socket, _family: IpFamily, dscp: u8) -> io::Result<()> {
    if dscp != 0 {
        tracing::debug!("DSCP marking unsupported here, ignoring {}", dscp);
    }
    Ok(())
}
