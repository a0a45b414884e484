//! Network watchers.
//!
//! A watcher normalizes raw network events into the few actions the controller
//! cares about. Two variants exist:
//!
//! - `NetworkWatcher::Default` follows whatever network the OS designates as
//!   default. An update for another network means the default changed.
//! - `NetworkWatcher::Specific` stays on one caller-chosen network. It is
//!   subscribed with a wildcard request (the OS cannot watch one arbitrary
//!   network directly) and drops events for every other network.
//!
//! Watchers only compute actions; they never touch controller state.

use crate::events::{EventSink, NetworkEvent};
use crate::network::{
    LinkProperties, NetworkCapabilities, NetworkRequest, NetworkSubscriber, SubscriptionId,
};
use ikemob_transport::NetworkHandle;
use std::net::IpAddr;

/// What the controller should do in response to a network event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatcherAction {
    /// The tracked network is gone
    NetworkDied(NetworkHandle),
    /// Network or link properties changed; run a (skippable) mobility update
    NetworkUpdated {
        /// Network to move to
        network: NetworkHandle,
        /// Its link properties
        link: LinkProperties,
        /// Its capabilities
        capabilities: NetworkCapabilities,
    },
    /// Only capabilities of the tracked network changed
    CapabilitiesUpdated(NetworkCapabilities),
}

/// State shared by both watcher variants
#[derive(Clone, Debug)]
pub struct WatcherBase {
    network: NetworkHandle,
    address: Option<IpAddr>,
    link: LinkProperties,
    capabilities: NetworkCapabilities,
    subscription: Option<SubscriptionId>,
}

impl WatcherBase {
    fn new(
        network: NetworkHandle,
        address: Option<IpAddr>,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
    ) -> Self {
        Self {
            network,
            address,
            link,
            capabilities,
            subscription: None,
        }
    }

    fn track(&mut self, network: NetworkHandle, link: LinkProperties, caps: NetworkCapabilities) {
        self.network = network;
        self.link = link;
        self.capabilities = caps;
    }
}

/// Network watcher, tracking either the default network or one specific network
#[derive(Clone, Debug)]
pub enum NetworkWatcher {
    /// Follows the OS default network
    Default(WatcherBase),
    /// Pinned to one network
    Specific(WatcherBase),
}

impl NetworkWatcher {
    /// Watcher following the default network, starting at `network`
    #[must_use]
    pub fn default_network(
        network: NetworkHandle,
        address: Option<IpAddr>,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
    ) -> Self {
        Self::Default(WatcherBase::new(network, address, link, capabilities))
    }

    /// Watcher pinned to `network`
    #[must_use]
    pub fn specific_network(
        network: NetworkHandle,
        address: Option<IpAddr>,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
    ) -> Self {
        Self::Specific(WatcherBase::new(network, address, link, capabilities))
    }

    fn base(&self) -> &WatcherBase {
        match self {
            Self::Default(base) | Self::Specific(base) => base,
        }
    }

    fn base_mut(&mut self) -> &mut WatcherBase {
        match self {
            Self::Default(base) | Self::Specific(base) => base,
        }
    }

    /// Whether this is the specific-network variant
    #[must_use]
    pub fn is_specific(&self) -> bool {
        matches!(self, Self::Specific(_))
    }

    /// Tracked network
    #[must_use]
    pub fn network(&self) -> NetworkHandle {
        self.base().network
    }

    /// Local address the session uses on the tracked network
    #[must_use]
    pub fn address(&self) -> Option<IpAddr> {
        self.base().address
    }

    /// Whether the watcher holds a live subscription
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.base().subscription.is_some()
    }

    /// Subscribe with `subscriber`, delivering events to `sink`
    pub fn register(&mut self, subscriber: &dyn NetworkSubscriber, sink: EventSink) {
        let id = match self {
            Self::Default(_) => subscriber.register_for_default_network(sink),
            Self::Specific(_) => subscriber.register_for_network(&NetworkRequest::wildcard(), sink),
        };
        tracing::debug!(
            "Registered {} watcher for {}",
            if self.is_specific() { "specific" } else { "default" },
            self.network()
        );
        self.base_mut().subscription = Some(id);
    }

    /// Cancel the subscription, if any
    pub fn unregister(&mut self, subscriber: &dyn NetworkSubscriber) {
        if let Some(id) = self.base_mut().subscription.take() {
            subscriber.unregister(id);
        }
    }

    /// Switch the tracked network without producing an action
    pub fn set_network(
        &mut self,
        network: NetworkHandle,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
    ) {
        self.base_mut().track(network, link, capabilities);
    }

    /// Record the local address in use
    pub fn set_address(&mut self, address: IpAddr) {
        self.base_mut().address = Some(address);
    }

    /// Dispatch a raw event to the matching handler
    pub fn on_event(&mut self, event: NetworkEvent) -> Option<WatcherAction> {
        match event {
            NetworkEvent::Lost(network) => self.on_lost(network),
            NetworkEvent::Updated {
                network,
                link,
                capabilities,
            } => self.on_updated(network, link, capabilities),
            NetworkEvent::CapabilitiesChanged {
                network,
                capabilities,
            } => self.on_capabilities_changed(network, capabilities),
        }
    }

    /// A network disconnected. Only the tracked network matters.
    #[must_use]
    pub fn on_lost(&self, network: NetworkHandle) -> Option<WatcherAction> {
        if network == self.network() {
            tracing::debug!("Tracked network {} lost", network);
            Some(WatcherAction::NetworkDied(network))
        } else {
            None
        }
    }

    /// A network's link properties (and capabilities) were reported
    pub fn on_updated(
        &mut self,
        network: NetworkHandle,
        link: LinkProperties,
        capabilities: NetworkCapabilities,
    ) -> Option<WatcherAction> {
        if network != self.network() {
            return match self {
                Self::Specific(_) => None,
                Self::Default(base) => {
                    tracing::debug!("Default network changed: {} -> {}", base.network, network);
                    base.track(network, link.clone(), capabilities.clone());
                    Some(WatcherAction::NetworkUpdated {
                        network,
                        link,
                        capabilities,
                    })
                }
            };
        }

        let base = self.base_mut();
        if base.link != link {
            base.track(network, link.clone(), capabilities.clone());
            Some(WatcherAction::NetworkUpdated {
                network,
                link,
                capabilities,
            })
        } else if base.capabilities != capabilities {
            base.capabilities = capabilities.clone();
            Some(WatcherAction::CapabilitiesUpdated(capabilities))
        } else {
            None
        }
    }

    /// Only the capabilities of a network changed
    pub fn on_capabilities_changed(
        &mut self,
        network: NetworkHandle,
        capabilities: NetworkCapabilities,
    ) -> Option<WatcherAction> {
        if network != self.network() {
            return None;
        }
        let base = self.base_mut();
        if base.capabilities == capabilities {
            return None;
        }
        base.capabilities = capabilities.clone();
        Some(WatcherAction::CapabilitiesUpdated(capabilities))
    }
}
