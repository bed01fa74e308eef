//! Per-peer state: shared key, direct paths, liveness and credentials.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::address::Address;
use crate::cert::CertificateOfMembership;
use crate::dispatch::build_hello;
use crate::error::ProtocolError;
use crate::identity::{Identity, LocalIdentity, PEER_KEY_LEN};
use crate::inet::InetAddress;
use crate::packet::Verb;
use crate::runtime::Runtime;

/// Maximum number of direct physical paths remembered per peer.
pub const MAX_DIRECT_PATHS: usize = 8;

// A path with no traffic for this long no longer counts as alive.
const PATH_ACTIVITY_TIMEOUT: u64 = 130_000;

/// One learned direct physical path to a peer.
#[derive(Clone, Copy, Debug)]
pub struct RemotePath {
    /// Our socket the path runs through
    pub local: InetAddress,
    /// The peer's physical endpoint
    pub remote: InetAddress,
    /// Last time we received on this path
    pub last_receive: u64,
}

/// Reject endpoints that can never be useful direct paths.
pub fn is_address_valid_for_path(a: &InetAddress) -> bool {
    if a.port() == 0 {
        return false;
    }
    match a {
        InetAddress::Nil => false,
        InetAddress::V4(ip, _) => {
            !ip.is_unspecified() && !ip.is_loopback() && !ip.is_broadcast() && !ip.is_multicast()
        }
        InetAddress::V6(ip, _) => !ip.is_unspecified() && !ip.is_loopback() && !ip.is_multicast(),
    }
}

struct PeerInner {
    paths: Vec<RemotePath>,
    coms: HashMap<u64, CertificateOfMembership>,
    last_received: u64,
    latency: u16,
    remote_version: Option<(u8, u8, u8, u16)>,
}

/// Mutable state for a remote identity.
///
/// Created on the first authenticated HELLO (or an OK(WHOIS) from a root)
/// and shared through the topology; the identity and derived key never
/// change for the life of the peer.
pub struct Peer {
    identity: Identity,
    key: [u8; PEER_KEY_LEN],
    inner: Mutex<PeerInner>,
}

impl Peer {
    /// Derive the shared key and wrap `id` as a peer.
    pub fn new(local: &LocalIdentity, id: Identity) -> Result<Self, ProtocolError> {
        let key = local.agree(&id)?;
        Ok(Self {
            identity: id,
            key,
            inner: Mutex::new(PeerInner {
                paths: Vec::new(),
                coms: HashMap::new(),
                last_received: 0,
                latency: 0,
                remote_version: None,
            }),
        })
    }

    /// The peer's address.
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// The peer's identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Shared secret used to armor traffic with this peer.
    pub fn key(&self) -> &[u8; PEER_KEY_LEN] {
        &self.key
    }

    /// Account an authenticated packet from this peer.
    ///
    /// Refreshes liveness and, for direct (zero-hop) packets, learns or
    /// refreshes the physical path it arrived on.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        &self,
        rt: &Runtime,
        local: &InetAddress,
        remote: &InetAddress,
        hops: u8,
        _packet_id: u64,
        _verb: Verb,
        _in_re_packet_id: u64,
        _in_re_verb: Verb,
    ) {
        let now = rt.host.now();
        let mut inner = self.inner.lock();
        inner.last_received = now;
        if hops == 0 && !remote.is_nil() {
            if let Some(p) = inner
                .paths
                .iter_mut()
                .find(|p| p.local == *local && p.remote == *remote)
            {
                p.last_receive = now;
            } else if inner.paths.len() < MAX_DIRECT_PATHS {
                inner.paths.push(RemotePath { local: *local, remote: *remote, last_receive: now });
            } else if let Some(stalest) =
                inner.paths.iter_mut().min_by_key(|p| p.last_receive)
            {
                *stalest = RemotePath { local: *local, remote: *remote, last_receive: now };
            }
        }
    }

    /// Time of the last authenticated packet, zero if none yet.
    pub fn last_received(&self) -> u64 {
        self.inner.lock().last_received
    }

    /// Record the version the peer advertised.
    pub fn set_remote_version(&self, proto: u8, major: u8, minor: u8, revision: u16) {
        self.inner.lock().remote_version = Some((proto, major, minor, revision));
    }

    /// Last advertised (proto, major, minor, revision), if any.
    pub fn remote_version(&self) -> Option<(u8, u8, u8, u16)> {
        self.inner.lock().remote_version
    }

    /// Record a round-trip latency sample.
    pub fn add_direct_latency_measurement(&self, latency: u16) {
        let mut inner = self.inner.lock();
        // Exponential smoothing, seeded by the first sample
        inner.latency = if inner.latency == 0 {
            latency
        } else {
            ((u32::from(inner.latency) * 3 + u32::from(latency)) / 4) as u16
        };
    }

    /// Smoothed latency in milliseconds, zero if unmeasured.
    pub fn latency(&self) -> u16 {
        self.inner.lock().latency
    }

    /// Validate a membership certificate and cache it on success.
    ///
    /// The certificate must be issued to this peer for `nwid` by the
    /// network's controller, whose identity must be known; if the signer is
    /// unknown a WHOIS is kicked off and the certificate is refused for now.
    pub fn validate_and_set_com(
        &self,
        rt: &Runtime,
        nwid: u64,
        com: CertificateOfMembership,
    ) -> bool {
        if com.network_id != nwid
            || com.issued_to != self.address()
            || com.signed_by != crate::network::Network::controller_for(nwid)
        {
            return false;
        }
        let Some(signer) = rt.topology.get(com.signed_by) else {
            rt.sw.request_whois(com.signed_by);
            return false;
        };
        if !com.verify_signature(signer.identity()) {
            return false;
        }
        self.inner.lock().coms.insert(nwid, com);
        true
    }

    /// The peer's cached membership certificate for `nwid`.
    pub fn com(&self, nwid: u64) -> Option<CertificateOfMembership> {
        self.inner.lock().coms.get(&nwid).cloned()
    }

    /// Most recently alive direct path endpoint, if any.
    pub fn get_best_path(&self, now: u64) -> Option<InetAddress> {
        self.inner
            .lock()
            .paths
            .iter()
            .filter(|p| now.saturating_sub(p.last_receive) < PATH_ACTIVITY_TIMEOUT)
            .max_by_key(|p| p.last_receive)
            .map(|p| p.remote)
    }

    /// Snapshot of the learned direct paths.
    pub fn paths(&self) -> Vec<RemotePath> {
        self.inner.lock().paths.clone()
    }

    /// Send a direct HELLO to `remote` to try to open a path.
    pub fn attempt_to_contact_at(
        &self,
        rt: &Runtime,
        local: &InetAddress,
        remote: &InetAddress,
        _now: u64,
    ) {
        let mut outp = build_hello(rt, self.address(), remote);
        outp.armor(&self.key, false);
        rt.host.put_packet(local, remote, outp.as_bytes());
    }
}
