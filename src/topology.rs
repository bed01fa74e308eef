//! The peer store and cached world.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::Address;
use crate::identity::Identity;
use crate::peer::Peer;
use crate::world::World;

/// Shared store of known peers plus the cached root roster.
///
/// Peers enter the topology only after their identity passed local
/// validation and at least one packet from them was MAC-authenticated; the
/// HELLO and OK(WHOIS) handlers are the only writers.
pub struct Topology {
    peers: RwLock<HashMap<Address, Arc<Peer>>>,
    world: RwLock<World>,
}

impl Topology {
    /// Create a topology seeded with `world`.
    pub fn new(world: World) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            world: RwLock::new(world),
        }
    }

    /// Look up a peer by address.
    pub fn get(&self, addr: Address) -> Option<Arc<Peer>> {
        self.peers.read().get(&addr).cloned()
    }

    /// Insert a peer, returning the stored instance.
    ///
    /// If the address is already present the existing peer wins, so two
    /// threads racing on the same first contact converge on one `Peer`.
    pub fn add(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.peers
            .write()
            .entry(peer.address())
            .or_insert(peer)
            .clone()
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Is this identity one of the current world's roots?
    pub fn is_root(&self, id: &Identity) -> bool {
        self.world.read().roots.iter().any(|r| r.identity == *id)
    }

    /// Snapshot of the cached world.
    pub fn world(&self) -> World {
        self.world.read().clone()
    }

    /// Cached world ID, zero when no world is configured.
    pub fn world_id(&self) -> u64 {
        self.world.read().id
    }

    /// Cached world revision timestamp.
    pub fn world_timestamp(&self) -> u64 {
        self.world.read().timestamp
    }
}
