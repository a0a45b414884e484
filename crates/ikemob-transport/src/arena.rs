//! Reference-counted socket arena.
//!
//! Sockets are stored in slots indexed by lightweight `SocketId`s and keyed by
//! `SocketKey` (network, variant and DSCP), so sessions on the same network
//! with the same DSCP share one socket per variant. Each slot records the owners currently holding a
//! reference; the socket is closed and the slot freed when the last owner
//! releases it.

use crate::socket::{IkeSocket, OwnerId, SocketHandle, SocketId, SocketRequest};
use crate::transport::TransportResult;
use crate::{NetworkHandle, SocketVariant};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identity of a shareable socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    /// Network the socket is bound to
    pub network: NetworkHandle,
    /// Socket variant
    pub variant: SocketVariant,
    /// DSCP applied to outbound packets
    pub dscp: u8,
}

impl SocketKey {
    /// Key with the default DSCP
    #[must_use]
    pub fn new(network: NetworkHandle, variant: SocketVariant) -> Self {
        Self {
            network,
            variant,
            dscp: 0,
        }
    }
}

impl From<&SocketRequest> for SocketKey {
    fn from(request: &SocketRequest) -> Self {
        Self {
            network: request.network,
            variant: request.variant,
            dscp: request.dscp,
        }
    }
}

struct Slot {
    key: SocketKey,
    socket: Arc<dyn IkeSocket>,
    owners: HashSet<OwnerId>,
}

/// Arena of shared sockets
#[derive(Default)]
pub struct SocketArena {
    next_id: u64,
    slots: HashMap<SocketId, Slot>,
    index: HashMap<SocketKey, SocketId>,
}

impl SocketArena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a reference to the socket for `key`, creating it with `create`
    /// if no slot exists yet.
    ///
    /// Acquiring twice for the same owner does not add a second reference.
    ///
    /// # Errors
    /// Returns the error produced by `create`
    pub fn acquire_with<F>(
        &mut self,
        key: SocketKey,
        owner: OwnerId,
        create: F,
    ) -> TransportResult<SocketHandle>
    where
        F: FnOnce() -> TransportResult<Arc<dyn IkeSocket>>,
    {
        if let Some(id) = self.index.get(&key).copied() {
            if let Some(slot) = self.slots.get_mut(&id) {
                slot.owners.insert(owner);
                return Ok(SocketHandle::new(id, Arc::clone(&slot.socket)));
            }
        }

        let socket = create()?;
        let id = SocketId(self.next_id);
        self.next_id += 1;

        let mut owners = HashSet::new();
        owners.insert(owner);
        self.slots.insert(
            id,
            Slot {
                key,
                socket: Arc::clone(&socket),
                owners,
            },
        );
        self.index.insert(key, id);

        tracing::debug!(
            "Created {} socket {} on {} (dscp {})",
            key.variant,
            id,
            key.network,
            key.dscp
        );
        Ok(SocketHandle::new(id, socket))
    }

    /// Release `owner`'s reference to `id`. Returns `true` if the socket was
    /// closed as a result.
    pub fn release(&mut self, id: SocketId, owner: OwnerId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            debug_assert!(false, "release of unknown socket {id}");
            tracing::error!("Release of unknown socket {}", id);
            return false;
        };

        let removed = slot.owners.remove(&owner);
        debug_assert!(removed, "owner {owner:?} released {id} without a reference");

        if !slot.owners.is_empty() {
            return false;
        }

        if let Some(slot) = self.slots.remove(&id) {
            self.index.remove(&slot.key);
            slot.socket.close();
            tracing::debug!("Closed socket {} (no remaining references)", id);
        }
        true
    }

    /// Number of owners referencing `id`
    #[must_use]
    pub fn reference_count(&self, id: SocketId) -> usize {
        self.slots.get(&id).map_or(0, |slot| slot.owners.len())
    }

    /// Number of live sockets
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no socket is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
