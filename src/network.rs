//! Virtual network membership state and policy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address::{Address, Mac};
use crate::buffer::Buffer;
use crate::cert::CertificateOfMembership;
use crate::error::ProtocolError;
use crate::packet::{Packet, Verb};
use crate::peer::Peer;
use crate::runtime::Runtime;

/// Configuration state of a joined network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Waiting for the controller to answer
    RequestingConfiguration,
    /// Configuration present and current
    Ok,
    /// Controller says this network does not exist
    NotFound,
    /// Controller refused us access
    AccessDenied,
}

/// Network configuration as issued by a controller.
///
/// Carried on the wire as an opaque length-prefixed blob; this is its
/// decoded form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Network this configuration applies to
    pub network_id: u64,
    /// Issuance timestamp (milliseconds)
    pub timestamp: u64,
    /// Public networks admit anyone without a certificate
    pub public: bool,
    /// Permitted ethertypes; empty permits everything
    pub ether_types: Vec<u16>,
    /// Members allowed to bridge foreign source MACs
    pub active_bridges: Vec<Address>,
    /// Our membership certificate, absent on public networks
    pub com: Option<CertificateOfMembership>,
}

impl NetworkConfig {
    /// True iff frames of `ether_type` may cross this network.
    pub fn permits_ether_type(&self, ether_type: u16) -> bool {
        self.ether_types.is_empty() || self.ether_types.contains(&ether_type)
    }

    /// Serialize to the opaque wire blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.append_u64(self.network_id);
        buf.append_u64(self.timestamp);
        buf.append_u8(u8::from(self.public));
        buf.append_u16(self.ether_types.len() as u16);
        for et in &self.ether_types {
            buf.append_u16(*et);
        }
        buf.append_u16(self.active_bridges.len() as u16);
        for ab in &self.active_bridges {
            ab.append_to(&mut buf);
        }
        match &self.com {
            Some(com) => {
                buf.append_u8(1);
                com.serialize(&mut buf);
            }
            None => buf.append_u8(0),
        }
        buf.as_bytes().to_vec()
    }

    /// Decode the opaque wire blob.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let buf = Buffer::from_bytes(data);
        let network_id = buf.u64_at(0)?;
        let timestamp = buf.u64_at(8)?;
        let public = buf.u8_at(16)? != 0;
        let mut ptr = 17;
        let et_count = buf.u16_at(ptr)? as usize;
        ptr += 2;
        let mut ether_types = Vec::with_capacity(et_count);
        for _ in 0..et_count {
            ether_types.push(buf.u16_at(ptr)?);
            ptr += 2;
        }
        let ab_count = buf.u16_at(ptr)? as usize;
        ptr += 2;
        let mut active_bridges = Vec::with_capacity(ab_count);
        for _ in 0..ab_count {
            active_bridges.push(Address::read_from(&buf, ptr)?);
            ptr += Address::LEN;
        }
        let com = if buf.u8_at(ptr)? != 0 {
            let (com, _) = CertificateOfMembership::deserialize(&buf, ptr + 1)?;
            Some(com)
        } else {
            None
        };
        Ok(Self { network_id, timestamp, public, ether_types, active_bridges, com })
    }
}

struct NetworkInner {
    status: NetworkStatus,
    config: Option<NetworkConfig>,
    bridge_routes: HashMap<Mac, Address>,
}

/// Membership state for one 64-bit virtual LAN.
pub struct Network {
    id: u64,
    controller: Address,
    mac: Mac,
    inner: RwLock<NetworkInner>,
}

impl Network {
    /// Join state for `id` as the member with address `local`.
    pub fn new(id: u64, local: Address) -> Self {
        Self {
            id,
            controller: Self::controller_for(id),
            mac: Mac::from_address(local, id),
            inner: RwLock::new(NetworkInner {
                status: NetworkStatus::RequestingConfiguration,
                config: None,
                bridge_routes: HashMap::new(),
            }),
        }
    }

    /// The controller of a network is encoded in the ID's top 40 bits.
    pub fn controller_for(nwid: u64) -> Address {
        Address::from_u64(nwid >> 24)
    }

    /// Network ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Controller address for this network.
    pub fn controller(&self) -> Address {
        self.controller
    }

    /// Our device MAC on this network.
    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// Current configuration state.
    pub fn status(&self) -> NetworkStatus {
        self.inner.read().status
    }

    /// Current configuration, if the controller has issued one.
    pub fn config(&self) -> Option<NetworkConfig> {
        self.inner.read().config.clone()
    }

    /// Install a configuration issued by the controller.
    pub fn set_configuration(&self, config: NetworkConfig) {
        let mut inner = self.inner.write();
        inner.config = Some(config);
        inner.status = NetworkStatus::Ok;
    }

    /// Controller reported the network as nonexistent.
    pub fn set_not_found(&self) {
        self.inner.write().status = NetworkStatus::NotFound;
    }

    /// Controller refused us access.
    pub fn set_access_denied(&self) {
        self.inner.write().status = NetworkStatus::AccessDenied;
    }

    /// May `peer` speak on this network right now?
    ///
    /// Public networks admit everyone. Private networks require the peer's
    /// cached certificate for this network to agree with ours.
    pub fn is_allowed(&self, peer: &Peer) -> bool {
        let inner = self.inner.read();
        let Some(config) = &inner.config else {
            return false;
        };
        if config.public {
            return true;
        }
        let Some(ours) = &config.com else {
            return false;
        };
        match peer.com(self.id) {
            Some(theirs) => ours.agrees_with(&theirs),
            None => false,
        }
    }

    /// Is `addr` allowed to bridge foreign source MACs into this network?
    pub fn permits_bridging(&self, addr: Address) -> bool {
        self.inner
            .read()
            .config
            .as_ref()
            .is_some_and(|c| c.active_bridges.contains(&addr))
    }

    /// Remember which member is behind a bridged source MAC.
    pub fn learn_bridge_route(&self, mac: Mac, addr: Address) {
        self.inner.write().bridge_routes.insert(mac, addr);
    }

    /// Look up the member behind a bridged MAC.
    pub fn bridge_route(&self, mac: Mac) -> Option<Address> {
        self.inner.read().bridge_routes.get(&mac).copied()
    }

    /// Ask the controller for a (new) configuration.
    pub fn request_configuration(&self, rt: &Runtime) {
        let mut outp = Packet::new(self.controller, rt.identity.address(), Verb::NetworkConfigRequest);
        outp.append_u64(self.id);
        outp.append_u16(0); // no request metadata
        rt.sw.send(outp, true, self.id);
    }
}

/// The set of networks this node has joined.
#[derive(Default)]
pub struct Networks {
    by_id: RwLock<HashMap<u64, Arc<Network>>>,
}

impl Networks {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a joined network.
    pub fn get(&self, nwid: u64) -> Option<Arc<Network>> {
        self.by_id.read().get(&nwid).cloned()
    }

    /// Join `nwid` (idempotent), returning its state.
    pub fn join(&self, nwid: u64, local: Address) -> Arc<Network> {
        self.by_id
            .write()
            .entry(nwid)
            .or_insert_with(|| Arc::new(Network::new(nwid, local)))
            .clone()
    }

    /// Leave `nwid`.
    pub fn leave(&self, nwid: u64) {
        self.by_id.write().remove(&nwid);
    }
}
