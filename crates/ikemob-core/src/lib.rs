//! # IKEMOB Core
//!
//! Connectivity and session-mobility controller for IKEv2 sessions.
//!
//! This crate provides:
//! - Server hostname resolution with retries and NAT64 tracking
//! - Deterministic remote address selection
//! - Socket switching between port 500 and port 4500 on NAT detection
//! - NAT-T keepalive scheduling
//! - Default-network and specific-network watchers
//! - Mobility: following network and link changes (MOBIKE)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SessionActor                               │
//! │   (one thread per session, serializes commands and events)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    ConnectionController                          │
//! │   (resolver, selector, keepalive, watcher, SPI registrations)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 ikemob-transport sockets                         │
//! │   (shared, reference-counted UDP sockets per network/variant)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The OS is reached only through traits (`NetworkInfoProvider`,
//! `NetworkSubscriber`, `SocketProvider`, `KeepaliveEngine`, `DeviceConfig`,
//! `LocalAddressGenerator`), so every component can run against fakes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod local_address;
pub mod logging;
pub mod network;
pub mod record;
pub mod resolver;
pub mod selector;
pub mod watcher;

pub use actor::{SessionActor, SessionHandle, SessionStatus};
pub use config::{IkeOptions, SessionParams};
pub use controller::{
    Collaborators, ConnectionCallback, ConnectionController, ConnectionInfo, ControllerState,
    NatStatus, NetworkType,
};
pub use error::{ConfigError, ConnectionError, MigrationError, Result};
pub use events::{ControllerEvent, EventSink, NetworkEvent};
pub use keepalive::{
    DeviceConfig, KeepaliveConfig, KeepaliveDelay, KeepaliveEngine, KeepaliveScheduler,
    SoftwareKeepalive, StaticDeviceConfig,
};
pub use local_address::{LocalAddressGenerator, RouteProbeAddressGenerator};
pub use logging::{LoggingConfig, init_tracing};
pub use network::{
    LinkProperties, Nat64Prefix, NetworkCapabilities, NetworkInfoProvider, NetworkRequest,
    NetworkSubscriber, SubscriptionId, TransportKind,
};
pub use record::{Registration, SaRecord};
pub use resolver::{AddressSet, Ipv6Candidate};
pub use selector::{EncapType, IpVersion, SelectedAddress};
pub use watcher::{NetworkWatcher, WatcherAction};
