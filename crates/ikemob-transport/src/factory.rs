//! Socket provider backed by real UDP sockets.
//!
//! `UdpSocketProvider` owns a `SocketArena` and creates `UdpIkeSocket`s on
//! demand. All controllers of one process should share a single provider so
//! sessions on the same network and DSCP reuse the same socket per variant.

use crate::arena::{SocketArena, SocketKey};
use crate::socket::{IkeSocket, OwnerId, SocketHandle, SocketProvider, SocketRequest};
use crate::transport::TransportResult;
use crate::udp::UdpIkeSocket;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared provider of UDP IKE sockets
#[derive(Default)]
pub struct UdpSocketProvider {
    arena: Mutex<SocketArena>,
}

impl UdpSocketProvider {
    /// Create a provider with an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sockets
    #[must_use]
    pub fn live_sockets(&self) -> usize {
        self.arena().len()
    }

    fn arena(&self) -> MutexGuard<'_, SocketArena> {
        // A panic while holding the lock cannot leave the arena half-updated.
        self.arena
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SocketProvider for UdpSocketProvider {
    fn acquire(&self, request: &SocketRequest, owner: OwnerId) -> TransportResult<SocketHandle> {
        self.arena()
            .acquire_with(SocketKey::from(request), owner, || {
                UdpIkeSocket::open(request).map(|socket| socket as Arc<dyn IkeSocket>)
            })
    }

    fn release(&self, handle: &SocketHandle, owner: OwnerId) {
        self.arena().release(handle.id(), owner);
    }
}
