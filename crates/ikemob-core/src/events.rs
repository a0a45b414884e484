//! Events marshalled into a session's queue.
//!
//! Network callbacks, socket receive threads and keepalive alarms all run on
//! threads the controller does not own. They never touch controller state;
//! they push a `ControllerEvent` through an `EventSink`, and the session actor
//! applies it with `ConnectionController::handle_event`.

use crate::network::{LinkProperties, NetworkCapabilities};
use ikemob_transport::{NetworkHandle, PacketHeader, PacketReceiver};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

/// Raw network-change notification from the OS
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A network disconnected
    Lost(NetworkHandle),
    /// A network became available or its link properties changed
    Updated {
        /// Network
        network: NetworkHandle,
        /// Current link properties
        link: LinkProperties,
        /// Current capabilities
        capabilities: NetworkCapabilities,
    },
    /// Only the capabilities of a network changed
    CapabilitiesChanged {
        /// Network
        network: NetworkHandle,
        /// New capabilities
        capabilities: NetworkCapabilities,
    },
}

/// Anything that can arrive asynchronously for a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Network-change notification
    Network(NetworkEvent),
    /// Inbound IKE packet demultiplexed to this session
    Packet {
        /// SPI header
        header: PacketHeader,
        /// Full IKE message
        packet: Vec<u8>,
    },
    /// Keepalive alarm expired
    KeepaliveAlarm,
}

/// Cloneable sender of `ControllerEvent`s into one session's queue
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(ControllerEvent) + Send + Sync>,
}

impl EventSink {
    /// Sink calling `deliver` for every event
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(ControllerEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Sink feeding a standard channel. Useful when driving a controller
    /// without an actor.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<ControllerEvent>) {
        let (tx, rx) = mpsc::channel();
        let sink = Self::new(move |event| {
            // Receiver gone means the session is gone; nothing to deliver to.
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    /// Sink that drops every event
    #[must_use]
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Deliver an event
    pub fn send(&self, event: ControllerEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

impl PacketReceiver for EventSink {
    fn on_packet_received(&self, header: PacketHeader, packet: Vec<u8>) {
        self.send(ControllerEvent::Packet { header, packet });
    }
}
