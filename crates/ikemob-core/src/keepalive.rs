//! NAT-T keepalive policy and scheduling
//!
//! This module decides *whether* a keepalive runs and *how often*; the timing
//! itself belongs to a `KeepaliveEngine`. A keepalive only runs on the IPv4
//! UDP-encapsulation socket.
//!
//! # Delay computation
//!
//! With automatic keepalives enabled the delay depends on the transport:
//!
//! | transport | delay |
//! |---|---|
//! | Wi-Fi (also Wi-Fi + cellular) | `min(configured, 15)` |
//! | cellular | `min(configured, device override or 150)` |
//! | other | `configured` |
//!
//! Without automatic keepalives the configured delay is used verbatim.

use crate::config::SessionParams;
use crate::error::{ConnectionError, Result};
use crate::network::{NetworkCapabilities, TransportKind};
use ikemob_transport::{IkeSocket, NetworkHandle, SocketHandle, SocketId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Automatic keepalive delay on Wi-Fi
pub const AUTO_KEEPALIVE_DELAY_SEC_WIFI: u32 = 15;

/// Default automatic keepalive delay on cellular
pub const AUTO_KEEPALIVE_DELAY_SEC_CELL: u32 = 150;

/// Smallest accepted keepalive delay
pub const NATT_KEEPALIVE_DELAY_SEC_MIN: u32 = 10;

/// Largest accepted keepalive delay
pub const NATT_KEEPALIVE_DELAY_SEC_MAX: u32 = 3600;

/// Device config key overriding the cellular automatic delay
pub const CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS: &str =
    "config_auto_natt_keepalives_cellular_timeout_override_seconds";

/// Device config flag allowing cached remote addresses across networks
pub const CONFIG_USE_CACHED_ADDRS: &str = "config_use_cached_addrs";

/// Device-wide configuration lookups
pub trait DeviceConfig: Send + Sync {
    /// Integer property. Missing or out-of-range `[min, max]` values yield `default`.
    fn int(&self, key: &str, min: u32, max: u32, default: u32) -> u32;

    /// Boolean property, `default` when missing
    fn flag(&self, key: &str, default: bool) -> bool;
}

/// Map-backed `DeviceConfig`
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceConfig {
    ints: HashMap<String, i64>,
    flags: HashMap<String, bool>,
}

impl StaticDeviceConfig {
    /// Empty config; every lookup returns its default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an integer property
    #[must_use]
    pub fn with_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.ints.insert(key.into(), value);
        self
    }

    /// Set a boolean property
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>, value: bool) -> Self {
        self.flags.insert(key.into(), value);
        self
    }
}

impl DeviceConfig for StaticDeviceConfig {
    fn int(&self, key: &str, min: u32, max: u32, default: u32) -> u32 {
        match self.ints.get(key) {
            Some(&value) if value >= i64::from(min) && value <= i64::from(max) => {
                u32::try_from(value).unwrap_or(default)
            }
            Some(&value) => {
                tracing::debug!("{} = {} outside [{}, {}], using {}", key, value, min, max, default);
                default
            }
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.flags.get(key).copied().unwrap_or(default)
    }
}

/// Keepalive delay for the session on a network with `caps`
#[must_use]
pub fn keepalive_delay_seconds(
    params: &SessionParams,
    caps: &NetworkCapabilities,
    device: &dyn DeviceConfig,
) -> u32 {
    let configured = params.natt_keepalive_delay_seconds;
    if !params.options.automatic_natt_keepalives {
        return configured;
    }

    if caps.has_transport(TransportKind::Wifi) {
        configured.min(AUTO_KEEPALIVE_DELAY_SEC_WIFI)
    } else if caps.has_transport(TransportKind::Cellular) {
        let auto = device.int(
            CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS,
            NATT_KEEPALIVE_DELAY_SEC_MIN,
            NATT_KEEPALIVE_DELAY_SEC_MAX,
            AUTO_KEEPALIVE_DELAY_SEC_CELL,
        );
        configured.min(auto)
    } else {
        configured
    }
}

/// Keepalive delay requested by the user when migrating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveDelay {
    /// Recompute from the current network capabilities
    Auto,
    /// Fixed delay
    Seconds(u32),
}

/// Everything a running keepalive depends on. A change in any field restarts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Local IPv4 address
    pub local: Ipv4Addr,
    /// Remote IPv4 address
    pub remote: Ipv4Addr,
    /// Encapsulation socket the keepalive is sent on
    pub socket: SocketId,
    /// Network of the socket
    pub network: NetworkHandle,
    /// Underpinned network, if set by the user
    pub underpinned_network: Option<NetworkHandle>,
    /// Interval between keepalives
    pub delay: Duration,
}

/// Timer mechanics of a keepalive
pub trait KeepaliveEngine: Send {
    /// Start sending keepalives
    ///
    /// # Errors
    /// Returns `ConnectionError::Keepalive` if the engine cannot start
    fn start(&mut self, config: &KeepaliveConfig, socket: &SocketHandle) -> Result<()>;

    /// Replace the running keepalive with one for `config`
    ///
    /// # Errors
    /// Returns `ConnectionError::Keepalive` if the engine cannot restart
    fn restart(&mut self, config: &KeepaliveConfig, socket: &SocketHandle) -> Result<()>;

    /// Stop sending keepalives
    fn stop(&mut self);

    /// An external alarm for this keepalive expired
    fn on_alarm_fired(&mut self);
}

/// Starts, restarts and stops the keepalive as the active socket changes
pub struct KeepaliveScheduler {
    engine: Box<dyn KeepaliveEngine>,
    running: Option<KeepaliveConfig>,
}

impl KeepaliveScheduler {
    /// Scheduler driving `engine`
    #[must_use]
    pub fn new(engine: Box<dyn KeepaliveEngine>) -> Self {
        Self {
            engine,
            running: None,
        }
    }

    /// Bring the keepalive in line with the active socket.
    ///
    /// Non-encapsulated sockets stop any running keepalive. On the
    /// encapsulation socket the keepalive is started if idle, restarted if
    /// its configuration changed, and left alone otherwise.
    ///
    /// # Errors
    /// Returns `InvalidState` if the addresses are not IPv4, or the engine's error
    pub fn setup_or_update(
        &mut self,
        socket: &SocketHandle,
        local: IpAddr,
        remote: IpAddr,
        network: NetworkHandle,
        underpinned_network: Option<NetworkHandle>,
        delay_seconds: u32,
    ) -> Result<()> {
        if !socket.variant().is_nat_encapsulated() {
            self.stop();
            return Ok(());
        }

        let (IpAddr::V4(local), IpAddr::V4(remote)) = (local, remote) else {
            return Err(ConnectionError::invalid_state(
                "NAT-T keepalive requires an IPv4 address pair",
            ));
        };

        let config = KeepaliveConfig {
            local,
            remote,
            socket: socket.id(),
            network,
            underpinned_network,
            delay: Duration::from_secs(u64::from(delay_seconds)),
        };

        match &self.running {
            Some(current) if *current == config => Ok(()),
            Some(_) => {
                tracing::debug!("Restarting keepalive: {:?}", config);
                self.running = None;
                self.engine.restart(&config, socket)?;
                self.running = Some(config);
                Ok(())
            }
            None => {
                tracing::debug!("Starting keepalive: {:?}", config);
                self.engine.start(&config, socket)?;
                self.running = Some(config);
                Ok(())
            }
        }
    }

    /// Stop and forget the running keepalive, if any
    pub fn stop(&mut self) {
        if self.running.take().is_some() {
            tracing::debug!("Stopping keepalive");
            self.engine.stop();
        }
    }

    /// Forward an alarm to the engine. Ignored when no keepalive runs.
    pub fn fire(&mut self) {
        if self.running.is_some() {
            self.engine.on_alarm_fired();
        } else {
            tracing::debug!("Keepalive alarm fired with no keepalive running");
        }
    }

    /// Whether a keepalive is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Configuration of the running keepalive
    #[must_use]
    pub fn current(&self) -> Option<&KeepaliveConfig> {
        self.running.as_ref()
    }
}

/// Keepalive engine sending NAT-keepalive datagrams from a tokio task
pub struct SoftwareKeepalive {
    runtime: Handle,
    task: Option<JoinHandle<()>>,
    target: Option<(Arc<dyn IkeSocket>, IpAddr)>,
}

impl SoftwareKeepalive {
    /// Engine spawning its timer on `runtime`
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            task: None,
            target: None,
        }
    }

    /// Engine on the runtime of the calling thread
    ///
    /// # Errors
    /// Returns `Keepalive` if called outside a tokio runtime
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ConnectionError::Keepalive(Cow::Owned(e.to_string())))
    }

    fn send_now(socket: &Arc<dyn IkeSocket>, remote: IpAddr) {
        if let Err(e) = socket.send_keepalive(remote) {
            tracing::warn!("Failed to send NAT-T keepalive to {}: {}", remote, e);
        }
    }
}

impl KeepaliveEngine for SoftwareKeepalive {
    fn start(&mut self, config: &KeepaliveConfig, socket: &SocketHandle) -> Result<()> {
        if config.delay.is_zero() {
            return Err(ConnectionError::Keepalive(Cow::Borrowed(
                "keepalive delay must be non-zero",
            )));
        }

        let remote = IpAddr::V4(config.remote);
        let target = Arc::clone(socket.socket());
        let delay = config.delay;
        self.target = Some((Arc::clone(&target), remote));
        self.task = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                SoftwareKeepalive::send_now(&target, remote);
            }
        }));
        Ok(())
    }

    fn restart(&mut self, config: &KeepaliveConfig, socket: &SocketHandle) -> Result<()> {
        self.stop();
        self.start(config, socket)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.target = None;
    }

    fn on_alarm_fired(&mut self) {
        if let Some((socket, remote)) = &self.target {
            Self::send_now(socket, *remote);
        }
    }
}

impl Drop for SoftwareKeepalive {
    fn drop(&mut self) {
        self.stop();
    }
}
