//! Connection controller
//!
//! `ConnectionController` owns everything that ties one IKE session to the
//! network: the active network, the remote candidates and the selected address
//! pair, the active socket, the NAT status, the keepalive and the network
//! watcher. It drives setup, teardown, NAT detection and mobility.
//!
//! # Invariants
//!
//! - Local and remote addresses always belong to the same family.
//! - Every registered SPI is registered on exactly the active socket. On a
//!   socket switch every SPI is moved to the new socket before the old
//!   reference is released.
//! - Each acquired socket reference is released exactly once.
//!
//! # Threading
//!
//! The controller is not thread-safe. All entry points take `&mut self` and
//! must run on one session thread; asynchronous inputs (network callbacks,
//! inbound packets, keepalive alarms) arrive as `ControllerEvent`s through the
//! session's queue. See `crate::actor`.

use crate::config::SessionParams;
use crate::error::{ConnectionError, Result};
use crate::events::{ControllerEvent, EventSink};
use crate::keepalive::{
    CONFIG_USE_CACHED_ADDRS, DeviceConfig, KeepaliveDelay, KeepaliveEngine, KeepaliveScheduler,
    keepalive_delay_seconds,
};
use crate::local_address::LocalAddressGenerator;
use crate::network::{
    LinkProperties, NetworkCapabilities, NetworkInfoProvider, NetworkSubscriber, TransportKind,
};
use crate::record::{Registration, SaRecord};
use crate::resolver::{self, AddressSet};
use crate::selector::{self, EncapType, IpVersion, SelectedAddress};
use crate::watcher::{NetworkWatcher, WatcherAction};
use ikemob_transport::{
    IpFamily, NetworkHandle, OwnerId, PacketHeader, PacketReceiver, SERVER_PORT_NON_UDP_ENCAPSULATED,
    SERVER_PORT_UDP_ENCAPSULATED, SocketHandle, SocketProvider, SocketRequest, SocketVariant,
    migrate_spi,
};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `set_up` not yet called
    Unset,
    /// `set_up` in progress
    SettingUp,
    /// Socket and watcher in place
    Active,
    /// Resources released; `set_up` may be called again
    TornDown,
}

/// What is known about NAT between this end and the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatStatus {
    /// No NAT detection has happened yet
    NotChecked,
    /// The server does not support NAT-T
    Unsupported,
    /// NAT-T supported, no NAT on the path
    NotDetected,
    /// NAT-T supported, NAT on the path
    Detected,
}

impl NatStatus {
    /// Whether the server is known to support NAT-T
    #[must_use]
    pub fn is_natt_supported(self) -> bool {
        matches!(self, NatStatus::NotDetected | NatStatus::Detected)
    }
}

impl fmt::Display for NatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatStatus::NotChecked => "NAT_TRAVERSAL_SUPPORT_NOT_CHECKED",
            NatStatus::Unsupported => "NAT_TRAVERSAL_UNSUPPORTED",
            NatStatus::NotDetected => "NAT_NOT_DETECTED",
            NatStatus::Detected => "NAT_DETECTED",
        };
        f.write_str(s)
    }
}

/// Underlying network type, for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Wi-Fi
    Wifi,
    /// Cellular
    Cellular,
    /// Anything else
    Unspecified,
}

/// Address pair and network of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Local address
    pub local: IpAddr,
    /// Remote address
    pub remote: IpAddr,
    /// Network
    pub network: NetworkHandle,
}

/// Address pair installed by a mobility update
struct AddressPair {
    local: IpAddr,
    remote: IpAddr,
}

/// Path state as it was before a mobility update
struct PathSnapshot {
    network: NetworkHandle,
    capabilities: NetworkCapabilities,
    interface: Option<String>,
    remote_addresses: AddressSet,
    local_address: Option<IpAddr>,
    remote_address: Option<IpAddr>,
}

/// Notifications from the controller to the owning session
pub trait ConnectionCallback: Send + Sync {
    /// Network or addresses changed; the session can continue
    fn on_underlying_network_updated(&self);

    /// `network` is gone and mobility could not handle it
    fn on_underlying_network_died(&self, network: NetworkHandle);

    /// Inbound IKE packet for this session
    fn on_packet_received(&self, header: PacketHeader, packet: Vec<u8>);

    /// A failure with no synchronous caller (asynchronous mobility handling)
    fn on_fatal_error(&self, error: ConnectionError);
}

/// External services a controller is built on
pub struct Collaborators {
    /// OS network state and DNS
    pub network_info: Arc<dyn NetworkInfoProvider>,
    /// OS network-change subscriptions
    pub subscriber: Arc<dyn NetworkSubscriber>,
    /// Shared socket provider
    pub sockets: Arc<dyn SocketProvider>,
    /// Keepalive timer
    pub keepalive: Box<dyn KeepaliveEngine>,
    /// Device configuration
    pub device_config: Arc<dyn DeviceConfig>,
    /// Local address discovery
    pub local_address: Arc<dyn LocalAddressGenerator>,
}

/// Connectivity and mobility controller of one IKE session
pub struct ConnectionController {
    owner: OwnerId,
    params: SessionParams,
    network_info: Arc<dyn NetworkInfoProvider>,
    subscriber: Arc<dyn NetworkSubscriber>,
    sockets: Arc<dyn SocketProvider>,
    device_config: Arc<dyn DeviceConfig>,
    local_address_generator: Arc<dyn LocalAddressGenerator>,
    callback: Arc<dyn ConnectionCallback>,
    sink: EventSink,
    receiver: Arc<dyn PacketReceiver>,

    state: ControllerState,
    use_caller_configured_network: bool,
    network: NetworkHandle,
    underpinned_network: Option<NetworkHandle>,
    capabilities: NetworkCapabilities,
    interface: Option<String>,
    ip_version: IpVersion,
    encap_type: EncapType,

    remote_addresses: AddressSet,
    local_address: Option<IpAddr>,
    remote_address: Option<IpAddr>,

    socket: Option<SocketHandle>,
    registrations: BTreeMap<u64, Registration>,
    keepalive: KeepaliveScheduler,
    keepalive_delay_seconds: u32,
    watcher: Option<NetworkWatcher>,

    nat_status: NatStatus,
    mobility_enabled: bool,
}

impl ConnectionController {
    /// Create a controller bound to the configured network, or to the current
    /// default network if none is configured.
    ///
    /// # Errors
    /// Returns `SetupFailed` if the parameters are invalid or there is no
    /// network to bind to
    pub fn new(
        params: SessionParams,
        collaborators: Collaborators,
        callback: Arc<dyn ConnectionCallback>,
        sink: EventSink,
    ) -> Result<Self> {
        params
            .validate()
            .map_err(|e| ConnectionError::SetupFailed(Cow::Owned(e.to_string())))?;

        let use_caller_configured_network = params.configured_network.is_some();
        let network = params
            .configured_network
            .or_else(|| collaborators.network_info.active_network())
            .ok_or(ConnectionError::SetupFailed(Cow::Borrowed(
                "No network configured and no active network",
            )))?;

        let owner = OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Controller {:?} bound to {}", owner, network);

        Ok(Self {
            owner,
            ip_version: params.ip_version,
            encap_type: params.encap_type,
            keepalive_delay_seconds: params.natt_keepalive_delay_seconds,
            params,
            network_info: collaborators.network_info,
            subscriber: collaborators.subscriber,
            sockets: collaborators.sockets,
            device_config: collaborators.device_config,
            local_address_generator: collaborators.local_address,
            callback,
            receiver: Arc::new(sink.clone()),
            sink,
            state: ControllerState::Unset,
            use_caller_configured_network,
            network,
            underpinned_network: None,
            capabilities: NetworkCapabilities::default(),
            interface: None,
            remote_addresses: AddressSet::default(),
            local_address: None,
            remote_address: None,
            socket: None,
            registrations: BTreeMap::new(),
            keepalive: KeepaliveScheduler::new(collaborators.keepalive),
            watcher: None,
            nat_status: NatStatus::NotChecked,
            mobility_enabled: false,
        })
    }

    // ============ Lifecycle ============

    /// Resolve the server, select addresses, acquire the socket, start the
    /// keepalive and subscribe to network changes.
    ///
    /// Any leftovers of a previous setup are released first. On failure
    /// nothing acquired here is kept.
    ///
    /// # Errors
    /// `SetupFailed` if link properties or capabilities are missing,
    /// `ResolutionFailed`, `NoUsableAddress` or `SocketUnavailable` otherwise
    pub fn set_up(&mut self) -> Result<()> {
        self.release_resources();
        self.state = ControllerState::SettingUp;

        match self.try_set_up() {
            Ok(()) => {
                self.state = ControllerState::Active;
                tracing::info!(
                    "Set up on {}: {:?} -> {:?} via {:?}",
                    self.network,
                    self.local_address,
                    self.remote_address,
                    self.socket
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Setup on {} failed: {}", self.network, e);
                self.release_resources();
                self.state = ControllerState::TornDown;
                Err(e)
            }
        }
    }

    fn try_set_up(&mut self) -> Result<()> {
        let (link, capabilities) = match (
            self.network_info.link_properties(self.network),
            self.network_info.capabilities(self.network),
        ) {
            (Some(link), Some(caps)) => (link, caps),
            _ => {
                return Err(ConnectionError::SetupFailed(Cow::Owned(format!(
                    "Missing link properties or capabilities for {}",
                    self.network
                ))));
            }
        };

        self.capabilities = capabilities;
        self.interface = link.interface_name.clone();
        self.keepalive_delay_seconds =
            keepalive_delay_seconds(&self.params, &self.capabilities, self.device_config.as_ref());

        self.remote_addresses = resolver::resolve(
            self.network_info.as_ref(),
            self.network,
            &self.params.server_hostname,
            &link,
        )?;
        let selected = self.select_remote_address(&link)?;

        let force_port_4500 = self.params.options.force_port_4500;
        let remote_port = if force_port_4500 {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        };
        let local = self.generate_local_address(&link, selected.remote, remote_port)?;
        self.install_address_pair(local, selected.remote)?;

        let socket = self.acquire_socket(selected.family, force_port_4500)?;
        // Stored before the keepalive so a failure below still releases it.
        self.socket = Some(socket.clone());
        self.refresh_keepalive(&socket)?;

        let mut watcher = if self.use_caller_configured_network {
            NetworkWatcher::specific_network(
                self.network,
                Some(local),
                link,
                self.capabilities.clone(),
            )
        } else {
            NetworkWatcher::default_network(
                self.network,
                Some(local),
                link,
                self.capabilities.clone(),
            )
        };
        watcher.register(self.subscriber.as_ref(), self.sink.clone());
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Release the socket, stop the keepalive, unsubscribe and forget every
    /// registered SPI. Safe to call in any state, any number of times.
    pub fn tear_down(&mut self) {
        self.release_resources();
        if self.state != ControllerState::TornDown {
            tracing::debug!("Controller {:?} torn down", self.owner);
        }
        self.state = ControllerState::TornDown;
    }

    fn release_resources(&mut self) {
        if let Some(socket) = self.socket.take() {
            for spi in self.registrations.keys() {
                socket.socket().unregister_spi(*spi);
            }
            self.sockets.release(&socket, self.owner);
        }

        self.keepalive.stop();

        if let Some(mut watcher) = self.watcher.take() {
            watcher.unregister(self.subscriber.as_ref());
        }

        self.registrations.clear();
    }

    // ============ Address selection ============

    fn select_remote_address(&mut self, link: &LinkProperties) -> Result<SelectedAddress> {
        let adjusted = selector::adjust_ip_version(self.ip_version, self.encap_type);
        if adjusted != self.ip_version {
            tracing::info!(
                "IP version preference is overridden from {} to {}",
                self.ip_version,
                adjusted
            );
            self.ip_version = adjusted;
        }

        let prefer_ipv4 = selector::prefers_ipv4(
            self.ip_version,
            self.params.options.automatic_address_family_selection,
            &self.capabilities,
        );
        selector::select(
            &self.remote_addresses,
            link.has_ipv4_address(),
            link.has_global_ipv6_address(),
            self.ip_version,
            prefer_ipv4,
        )
    }

    fn generate_local_address(
        &self,
        link: &LinkProperties,
        remote: IpAddr,
        remote_port: u16,
    ) -> Result<IpAddr> {
        self.local_address_generator.generate_local_address(
            self.network,
            link.interface_name.as_deref(),
            remote,
            remote_port,
        )
    }

    fn install_address_pair(&mut self, local: IpAddr, remote: IpAddr) -> Result<()> {
        debug_assert_eq!(
            IpFamily::of(&local),
            IpFamily::of(&remote),
            "mixed-family address pair"
        );
        if IpFamily::of(&local) != IpFamily::of(&remote) {
            return Err(ConnectionError::invalid_state(
                "Local and remote address families differ",
            ));
        }
        self.local_address = Some(local);
        self.remote_address = Some(remote);
        Ok(())
    }

    /// Whether a mobility event from `old_network` to `new_network` needs a
    /// fresh DNS lookup.
    ///
    /// The lookup is skipped (unless forced) when the network is unchanged and
    /// the cached remote families match the local ones, or when the device
    /// allows cached addresses and they cover every local family.
    #[must_use]
    pub fn is_dns_lookup_required(
        &self,
        old_network: NetworkHandle,
        new_network: NetworkHandle,
        link: &LinkProperties,
    ) -> bool {
        let mut local_families = BTreeSet::new();
        if link.has_ipv4_address() {
            local_families.insert(IpFamily::V4);
        }
        if link.has_global_ipv6_address() {
            local_families.insert(IpFamily::V6);
        }
        let cached_families = self.remote_addresses.families();

        tracing::debug!(
            "DNS lookup check: local families {:?}, cached remote families {:?}",
            local_families,
            cached_families
        );

        if local_families.is_empty() {
            tracing::error!("DNS lookup check with no local address on {}", new_network);
            return true;
        }

        if self.params.options.force_dns_resolution {
            return true;
        }

        if new_network == old_network && local_families == cached_families {
            return false;
        }

        if self.device_config.flag(CONFIG_USE_CACHED_ADDRS, false)
            && cached_families.is_superset(&local_families)
        {
            return false;
        }

        true
    }

    // ============ Sockets ============

    fn active_socket(&self) -> Result<SocketHandle> {
        self.socket
            .clone()
            .ok_or(ConnectionError::invalid_state("Controller is not set up"))
    }

    fn acquire_socket(&self, family: IpFamily, use_encap_port: bool) -> Result<SocketHandle> {
        let request = SocketRequest {
            network: self.network,
            interface: self.interface.clone(),
            variant: SocketVariant::select(family, use_encap_port),
            dscp: self.params.dscp,
        };
        Ok(self.sockets.acquire(&request, self.owner)?)
    }

    fn refresh_keepalive(&mut self, socket: &SocketHandle) -> Result<()> {
        let (Some(local), Some(remote)) = (self.local_address, self.remote_address) else {
            return Err(ConnectionError::invalid_state(
                "Keepalive requested without an address pair",
            ));
        };
        self.keepalive.setup_or_update(
            socket,
            local,
            remote,
            self.network,
            self.underpinned_network,
            self.keepalive_delay_seconds,
        )
    }

    fn refresh_active_keepalive(&mut self) -> Result<()> {
        let socket = self.active_socket()?;
        self.refresh_keepalive(&socket)
    }

    /// Acquire the socket for `(family, use_encap_port)` and make it active,
    /// moving every registered SPI over before releasing the old socket.
    fn switch_socket(&mut self, family: IpFamily, use_encap_port: bool) -> Result<()> {
        let old = self.active_socket()?;
        let new = self.acquire_socket(family, use_encap_port)?;

        if let Err(e) = self.refresh_keepalive(&new) {
            if new.id() != old.id() {
                self.sockets.release(&new, self.owner);
            }
            return Err(e);
        }

        if new.id() == old.id() {
            return Ok(());
        }

        for spi in self.registrations.keys() {
            migrate_spi(*spi, &old, &new, Arc::clone(&self.receiver));
        }
        self.sockets.release(&old, self.owner);
        tracing::info!(
            "Switched from {} {} to {} {}",
            old.variant(),
            old.id(),
            new.variant(),
            new.id()
        );
        self.socket = Some(new);
        Ok(())
    }

    // ============ NAT detection ============

    /// Record the NAT detection result of the IKE INIT exchange.
    ///
    /// When NAT is detected the session moves to the IPv4 encapsulation
    /// socket; `local_spi` is registered there along with every other SPI.
    ///
    /// # Errors
    /// `Unsupported` when NAT is detected on an IPv6 path (the status stays
    /// `Detected`), or the socket switch error
    pub fn handle_nat_detection_result(&mut self, detected: bool, local_spi: u64) -> Result<()> {
        self.active_socket()?;
        if !self.record_nat_detection(detected)? {
            return Ok(());
        }

        if !self.registrations.contains_key(&local_spi) {
            tracing::debug!("Tracking SPI {:#018x} for the NAT-T switch", local_spi);
            self.registrations.insert(local_spi, Registration::Pending);
            if let Some(socket) = &self.socket {
                socket
                    .socket()
                    .register_spi(local_spi, Arc::clone(&self.receiver));
            }
        }

        tracing::debug!("Switching to send to remote port 4500 if it's not already");
        self.switch_socket(IpFamily::V4, true)
    }

    /// Record the NAT detection result of a MOBIKE exchange
    ///
    /// # Errors
    /// Same as `handle_nat_detection_result`
    pub fn handle_nat_detection_result_in_mobike(&mut self, detected: bool) -> Result<()> {
        self.active_socket()?;
        if !self.record_nat_detection(detected)? {
            return Ok(());
        }

        tracing::debug!("Switching to send to remote port 4500 if it's not already");
        self.switch_socket(IpFamily::V4, true)
    }

    /// Returns whether a NAT was detected on an IPv4 path (so a switch follows)
    fn record_nat_detection(&mut self, detected: bool) -> Result<bool> {
        if !detected {
            self.nat_status = NatStatus::NotDetected;
            return Ok(false);
        }

        self.nat_status = NatStatus::Detected;
        tracing::info!("NAT detected towards {:?}", self.remote_address);
        if matches!(self.remote_address, Some(IpAddr::V6(_))) {
            return Err(ConnectionError::unsupported("IPv6 NAT-T not supported"));
        }
        Ok(true)
    }

    /// The server does not support NAT-T
    pub fn mark_server_natt_unsupported(&mut self) {
        self.nat_status = NatStatus::Unsupported;
    }

    /// Forget what is known about the server's NAT-T support
    pub fn reset_server_natt_support(&mut self) {
        self.nat_status = NatStatus::NotChecked;
    }

    /// Current NAT status
    #[must_use]
    pub fn nat_status(&self) -> NatStatus {
        self.nat_status
    }

    // ============ Mobility ============

    /// Allow the controller to follow network changes.
    ///
    /// Unless the server is known not to support NAT-T while the socket already
    /// uses port 500, the session moves to (or stays on) the port-4500 socket of
    /// the remote's family.
    ///
    /// # Errors
    /// `InvalidState` before setup, or the socket switch error
    pub fn enable_mobility(&mut self) -> Result<()> {
        let socket = self.active_socket()?;
        self.mobility_enabled = true;

        if socket.variant().uses_encap_port() {
            return Ok(());
        }
        if self.nat_status == NatStatus::Unsupported {
            tracing::debug!("Server does not support NAT-T, staying on {}", socket.variant());
            return Ok(());
        }

        let family = self
            .remote_address
            .map(|addr| IpFamily::of(&addr))
            .ok_or(ConnectionError::invalid_state("No remote address"))?;
        self.switch_socket(family, true)
    }

    /// Whether mobility is enabled
    #[must_use]
    pub fn is_mobility_enabled(&self) -> bool {
        self.mobility_enabled
    }

    /// React to a changed network or link.
    ///
    /// Failures have no synchronous caller and are reported through
    /// `ConnectionCallback::on_fatal_error`.
    pub fn on_network_updated(
        &mut self,
        network: NetworkHandle,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
        skippable: bool,
    ) {
        if let Err(e) = self.update_underlying_network(network, link, capabilities, skippable) {
            tracing::warn!("Mobility update to {} failed: {}", network, e);
            self.callback.on_fatal_error(e);
        }
    }

    fn update_underlying_network(
        &mut self,
        network: NetworkHandle,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
        skippable: bool,
    ) -> Result<()> {
        if !self.mobility_enabled {
            tracing::debug!("Unable to handle network update, mobility disabled");
            self.callback.on_underlying_network_died(self.network);
            return Ok(());
        }

        let current = self.active_socket()?;
        if !link.has_usable_address() {
            return Err(ConnectionError::NoUsableAddress(Cow::Owned(format!(
                "No local address on the network {network}"
            ))));
        }

        let snapshot = self.path_snapshot();
        let pair = match self.migrate_path(network, &link, capabilities, skippable, &current) {
            Ok(Some(pair)) => pair,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.restore_path(snapshot);
                return Err(e);
            }
        };
        let (local, remote) = (pair.local, pair.remote);

        for (spi, registration) in &self.registrations {
            if let Some(record) = registration.record() {
                record
                    .migrate(local, remote)
                    .map_err(|source| ConnectionError::MigrationFailed {
                        spi: *spi,
                        source,
                    })?;
            }
        }

        if let Some(watcher) = &mut self.watcher {
            watcher.set_address(local);
        }

        tracing::info!(
            "Underlying network updated: {} {} -> {}",
            network,
            local,
            remote
        );
        self.callback.on_underlying_network_updated();
        Ok(())
    }

    /// Move network, addresses and socket to `network`.
    ///
    /// Returns `None` for a skipped update. Nothing here is committed until
    /// the active socket is bound to `network`; the caller restores the path
    /// snapshot on error.
    fn migrate_path(
        &mut self,
        network: NetworkHandle,
        link: &LinkProperties,
        capabilities: NetworkCapabilities,
        skippable: bool,
        current: &SocketHandle,
    ) -> Result<Option<AddressPair>> {
        let old_network = self.network;
        let old_local = self.local_address;
        let old_remote = self.remote_address;

        self.network = network;
        self.capabilities = capabilities;
        self.interface = link.interface_name.clone();

        self.remote_addresses.remove_nat64();
        if self.is_dns_lookup_required(old_network, network, link) {
            self.remote_addresses = resolver::resolve(
                self.network_info.as_ref(),
                network,
                &self.params.server_hostname,
                link,
            )?;
        }

        let selected = self.select_remote_address(link)?;

        let use_encap_port = self.params.options.force_port_4500
            || self.nat_status.is_natt_supported()
            || current.variant().uses_encap_port();
        let server_port = if use_encap_port {
            SERVER_PORT_UDP_ENCAPSULATED
        } else {
            SERVER_PORT_NON_UDP_ENCAPSULATED
        };
        let local = self.generate_local_address(link, selected.remote, server_port)?;

        if skippable
            && self.params.skip_if_same_network
            && network == old_network
            && current.socket().network() == network
            && old_local == Some(local)
            && old_remote == Some(selected.remote)
        {
            tracing::debug!(
                "None of network, local or remote address has changed, and the update is skippable"
            );
            return Ok(None);
        }

        self.install_address_pair(local, selected.remote)?;

        if current.socket().network() != network || current.variant().family() != selected.family {
            self.switch_socket(selected.family, use_encap_port)?;
        } else {
            self.refresh_keepalive(current)?;
        }

        Ok(Some(AddressPair {
            local,
            remote: selected.remote,
        }))
    }

    fn path_snapshot(&self) -> PathSnapshot {
        PathSnapshot {
            network: self.network,
            capabilities: self.capabilities.clone(),
            interface: self.interface.clone(),
            remote_addresses: self.remote_addresses.clone(),
            local_address: self.local_address,
            remote_address: self.remote_address,
        }
    }

    fn restore_path(&mut self, snapshot: PathSnapshot) {
        tracing::debug!("Restoring path on {} after a failed update", snapshot.network);
        self.network = snapshot.network;
        self.capabilities = snapshot.capabilities;
        self.interface = snapshot.interface;
        self.remote_addresses = snapshot.remote_addresses;
        self.local_address = snapshot.local_address;
        self.remote_address = snapshot.remote_address;
    }

    /// Migrate the session to a network chosen by the user.
    ///
    /// The IP version, encapsulation and keepalive delay are replaced, the
    /// watcher is retargeted, and a non-skippable mobility update runs. Errors
    /// of the update itself go to `on_fatal_error`.
    ///
    /// # Errors
    /// `InvalidState` if mobility is disabled, `SetupFailed` if the network has
    /// no link properties or capabilities, or the keepalive restart error
    pub fn on_network_set_by_user(
        &mut self,
        network: NetworkHandle,
        ip_version: IpVersion,
        encap_type: EncapType,
        keepalive_delay: KeepaliveDelay,
    ) -> Result<()> {
        if !self.mobility_enabled {
            tracing::error!("Attempt to update network when mobility is disabled");
            return Err(ConnectionError::invalid_state(
                "Network set by user while mobility is disabled",
            ));
        }

        tracing::debug!(
            "Network set by user: {} ip_version {} encap_type {} keepalive {:?}",
            network,
            ip_version,
            encap_type,
            keepalive_delay
        );

        let (link, capabilities) = match (
            self.network_info.link_properties(network),
            self.network_info.capabilities(network),
        ) {
            (Some(link), Some(caps)) => (link, caps),
            _ => {
                return Err(ConnectionError::SetupFailed(Cow::Owned(format!(
                    "Attempt migrating to {network} with missing link properties or capabilities"
                ))));
            }
        };

        self.ip_version = ip_version;
        self.encap_type = encap_type;

        let delay = match keepalive_delay {
            KeepaliveDelay::Auto => keepalive_delay_seconds(
                &self.params,
                &self.capabilities,
                self.device_config.as_ref(),
            ),
            KeepaliveDelay::Seconds(seconds) => seconds,
        };
        if delay != self.keepalive_delay_seconds {
            self.keepalive_delay_seconds = delay;
            self.refresh_active_keepalive()?;
        }

        if let Some(watcher) = &mut self.watcher {
            watcher.set_network(network, link.clone(), capabilities.clone());
        }
        self.on_network_updated(network, link, capabilities, false);
        Ok(())
    }

    /// Set the underpinned network and refresh the keepalive
    ///
    /// # Errors
    /// `InvalidState` before setup, or the keepalive restart error
    pub fn on_underpinned_network_set_by_user(&mut self, network: NetworkHandle) -> Result<()> {
        self.underpinned_network = Some(network);
        self.refresh_active_keepalive()
    }

    // ============ SA records ============

    /// Register the SPI of an IKE SA awaiting its INIT response
    ///
    /// # Errors
    /// `InvalidState` before setup
    pub fn register_new_record(&mut self, spi: u64) -> Result<()> {
        let socket = self.active_socket()?;
        self.registrations.insert(spi, Registration::Pending);
        socket.socket().register_spi(spi, Arc::clone(&self.receiver));
        Ok(())
    }

    /// Register an established IKE SA
    ///
    /// # Errors
    /// `InvalidState` before setup
    pub fn register_existing_record(&mut self, record: Arc<dyn SaRecord>) -> Result<()> {
        let socket = self.active_socket()?;
        let spi = record.local_spi();
        self.registrations
            .insert(spi, Registration::Established(record));
        socket.socket().register_spi(spi, Arc::clone(&self.receiver));
        Ok(())
    }

    /// Forget an SPI (failed INIT or deleted SA)
    pub fn unregister_record(&mut self, spi: u64) {
        self.registrations.remove(&spi);
        if let Some(socket) = &self.socket {
            socket.socket().unregister_spi(spi);
        }
    }

    /// Registered SPIs, ascending
    #[must_use]
    pub fn registered_spis(&self) -> Vec<u64> {
        self.registrations.keys().copied().collect()
    }

    // ============ Data plane ============

    /// Send an IKE packet to the server on the active socket
    ///
    /// # Errors
    /// `InvalidState` before setup, `SocketUnavailable` if the send fails
    pub fn send_packet(&self, packet: &[u8]) -> Result<usize> {
        let socket = self.active_socket()?;
        let remote = self
            .remote_address
            .ok_or(ConnectionError::invalid_state("No remote address"))?;
        Ok(socket.socket().send_packet(packet, remote)?)
    }

    /// Forward a keepalive alarm. Ignored when no keepalive runs.
    pub fn fire_keepalive(&mut self) {
        self.keepalive.fire();
    }

    /// Apply one queued asynchronous event
    pub fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Network(event) => {
                let Some(watcher) = self.watcher.as_mut() else {
                    tracing::debug!("Dropping network event without a watcher: {:?}", event);
                    return;
                };
                match watcher.on_event(event) {
                    Some(WatcherAction::NetworkDied(network)) => {
                        self.callback.on_underlying_network_died(network);
                    }
                    Some(WatcherAction::NetworkUpdated {
                        network,
                        link,
                        capabilities,
                    }) => {
                        self.on_network_updated(network, link, capabilities, true);
                    }
                    Some(WatcherAction::CapabilitiesUpdated(capabilities)) => {
                        self.capabilities = capabilities;
                    }
                    None => {}
                }
            }
            ControllerEvent::Packet { header, packet } => {
                if self.socket.is_some() {
                    self.callback.on_packet_received(header, packet);
                } else {
                    tracing::debug!("Dropping packet received after teardown");
                }
            }
            ControllerEvent::KeepaliveAlarm => self.fire_keepalive(),
        }
    }

    // ============ Accessors ============

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Active network
    #[must_use]
    pub fn network(&self) -> NetworkHandle {
        self.network
    }

    /// Underpinned network
    #[must_use]
    pub fn underpinned_network(&self) -> Option<NetworkHandle> {
        self.underpinned_network
    }

    /// Local address
    #[must_use]
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// Remote address
    #[must_use]
    pub fn remote_address(&self) -> Option<IpAddr> {
        self.remote_address
    }

    /// All IPv4 remote candidates
    #[must_use]
    pub fn remote_ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        self.remote_addresses.v4.clone()
    }

    /// All IPv6 remote candidates
    #[must_use]
    pub fn remote_ipv6_addresses(&self) -> Vec<Ipv6Addr> {
        self.remote_addresses.v6_addresses()
    }

    /// Active socket
    #[must_use]
    pub fn socket(&self) -> Option<&SocketHandle> {
        self.socket.as_ref()
    }

    /// Local port of the active socket
    ///
    /// # Errors
    /// `InvalidState` before setup, `SocketUnavailable` if the port is unknown
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.active_socket()?.socket().local_port()?)
    }

    /// Server port of the active socket
    #[must_use]
    pub fn remote_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.socket().remote_port())
    }

    /// Whether the active socket is the IPv4 UDP-encapsulation socket
    #[must_use]
    pub fn uses_udp_encap_socket(&self) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.variant().is_nat_encapsulated())
    }

    /// Current IP version (after automatic adjustment)
    #[must_use]
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Current encapsulation type
    #[must_use]
    pub fn encap_type(&self) -> EncapType {
        self.encap_type
    }

    /// DSCP applied to the session's sockets
    #[must_use]
    pub fn dscp(&self) -> u8 {
        self.params.dscp
    }

    /// Keepalive delay in effect
    #[must_use]
    pub fn keepalive_delay_seconds(&self) -> u32 {
        self.keepalive_delay_seconds
    }

    /// Whether a NAT-T keepalive is running
    #[must_use]
    pub fn is_keepalive_running(&self) -> bool {
        self.keepalive.is_running()
    }

    /// Underlying network type, for metrics
    #[must_use]
    pub fn network_type(&self) -> NetworkType {
        if self.capabilities.has_transport(TransportKind::Wifi) {
            NetworkType::Wifi
        } else if self.capabilities.has_transport(TransportKind::Cellular) {
            NetworkType::Cellular
        } else {
            NetworkType::Unspecified
        }
    }

    /// Address pair and network, once set up
    #[must_use]
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        Some(ConnectionInfo {
            local: self.local_address?,
            remote: self.remote_address?,
            network: self.network,
        })
    }
}

impl fmt::Display for ConnectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show<T: fmt::Display>(value: Option<T>) -> String {
            value.map_or_else(|| "none".to_string(), |v| v.to_string())
        }

        writeln!(f, "------------------------------")?;
        writeln!(f, "ConnectionController:")?;
        writeln!(f, "  Network: {}", self.network)?;
        writeln!(f, "  Nat status: {}", self.nat_status)?;
        writeln!(f, "  Local address: {}", show(self.local_address))?;
        writeln!(f, "  Remote(Server) address: {}", show(self.remote_address))?;
        writeln!(f, "  Mobility status: {}", self.mobility_enabled)?;
        match &self.socket {
            None => {
                writeln!(f, "  Local port: null socket")?;
                writeln!(f, "  Remote(server) port: null socket")?;
            }
            Some(socket) => {
                match socket.socket().local_port() {
                    Ok(port) => writeln!(f, "  Local port: {port}")?,
                    Err(_) => writeln!(f, "  Local port: failed to get port")?,
                }
                writeln!(f, "  Remote(server) port: {}", socket.socket().remote_port())?;
            }
        }
        writeln!(f, "  Esp ip version: {}", self.ip_version)?;
        writeln!(f, "  Esp encap type: {}", self.encap_type)?;
        write!(f, "------------------------------")
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        self.release_resources();
    }
}
