//! The runtime environment: shared stores plus the host-side collaborators
//! the dispatcher calls out to.

use std::sync::Arc;

use crate::address::{Address, Mac};
use crate::identity::{Identity, LocalIdentity};
use crate::inet::InetAddress;
use crate::multicast::MulticastStore;
use crate::network::Networks;
use crate::packet::Packet;
use crate::peer::Peer;
use crate::topology::Topology;
use crate::world::World;

/// Process-level events surfaced to the embedding application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A root reports our address is claimed by a different identity; the
    /// node cannot continue under this identity
    FatalIdentityCollision,
}

/// Outcome of a controller configuration request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerResult {
    /// Configuration issued; the opaque blob to return
    Ok(Vec<u8>),
    /// No such network
    NotFound,
    /// Requester is not allowed on this network
    AccessDenied,
    /// Controller-side failure; no reply is sent
    InternalError,
    /// Deliberately ignore the request
    Ignore,
}

/// One parsed CIRCUIT_TEST_REPORT, handed upward as a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitTestReport {
    /// Hop that produced the report
    pub current: Address,
    /// Hop the reporter received the test from
    pub upstream: Address,
    /// Test identifier chosen by the originator
    pub test_id: u64,
    /// Originator's timestamp echoed back
    pub timestamp: u64,
    /// Reporter's local clock when it processed the test
    pub remote_timestamp: u64,
    /// Packet ID of the test packet the reporter saw
    pub source_packet_id: u64,
    /// Report flags (currently unused)
    pub flags: u64,
    /// Hops the test packet had traveled when received
    pub source_packet_hop_count: u8,
    /// Error code (currently unused)
    pub error_code: u16,
    /// Reporter's vendor identifier
    pub vendor: u8,
    /// Reporter's protocol version
    pub protocol_version: u8,
    /// Reporter's software major version
    pub major_version: u8,
    /// Reporter's software minor version
    pub minor_version: u8,
    /// Reporter's software revision
    pub revision: u16,
    /// Reporter's platform identifier
    pub platform: u16,
    /// Reporter's architecture identifier
    pub architecture: u16,
    /// Local socket the reporter received the test on
    pub received_on_local_address: InetAddress,
    /// Physical source the reporter received the test from
    pub received_from_remote_address: InetAddress,
    /// Next hops the reporter forwarded to, with their best-path endpoints
    pub next_hops: Vec<(Address, InetAddress)>,
}

/// Host-side I/O and clock, provided by the embedding node.
pub trait Host: Send + Sync {
    /// Emit an armored packet toward a physical endpoint.
    fn put_packet(&self, local: &InetAddress, remote: &InetAddress, data: &[u8]);
    /// Deliver an Ethernet frame to the virtual tap for `nwid`.
    fn put_frame(&self, nwid: u64, from: Mac, to: Mac, ether_type: u16, vlan: u16, data: &[u8]);
    /// Current time in milliseconds.
    fn now(&self) -> u64;
    /// Surface a process-level event.
    fn post_event(&self, event: Event);
    /// Surface a circuit test report.
    fn post_circuit_test_report(&self, report: &CircuitTestReport);
}

/// The switch/router owning outbound queuing, WHOIS and hole-punching.
pub trait Switch: Send + Sync {
    /// Ask the roots who owns `addr`; the caller re-queues pending work.
    fn request_whois(&self, addr: Address);
    /// A root answered that `addr` does not exist; stop asking.
    fn cancel_whois(&self, addr: Address);
    /// Begin NAT traversal toward `with` at `at`.
    fn rendezvous(&self, with: &Arc<Peer>, local: &InetAddress, at: &InetAddress);
    /// Replay work that was parked waiting for this peer to become known.
    fn do_anything_waiting_for_peer(&self, peer: &Arc<Peer>);
    /// Route an outbound packet; armoring happens on the send path.
    fn send(&self, packet: Packet, require_trust: bool, nwid: u64);
}

/// NAT-reflection bookkeeping: learns what the world thinks our external
/// addresses are.
pub trait SelfAwareness: Send + Sync {
    /// `reporter` (via `via`) says our external address is `reported`.
    fn iam(
        &self,
        reporter: Address,
        via: &InetAddress,
        reported: &InetAddress,
        trusted: bool,
        now: u64,
    );
}

/// Back-end answering network configuration requests, present only on
/// controller nodes.
pub trait NetworkController: Send + Sync {
    /// Answer a configuration request from `requestor`.
    ///
    /// `from` is the physical origin, or None if the request was relayed.
    fn do_request(
        &self,
        from: Option<InetAddress>,
        local: &Identity,
        requestor: &Identity,
        nwid: u64,
        metadata: &[u8],
    ) -> ControllerResult;
}

/// Everything a verb handler may touch, gathered in one place.
///
/// The stores are internally synchronized; handlers take at most one lock
/// at a time and never hold one across a `put_packet` call.
pub struct Runtime {
    /// Our own identity including secret keys
    pub identity: LocalIdentity,
    /// Known peers and the cached world
    pub topology: Topology,
    /// Joined virtual networks
    pub networks: Networks,
    /// Multicast subscription database
    pub mc: MulticastStore,
    /// Outbound router / WHOIS owner
    pub sw: Arc<dyn Switch>,
    /// NAT-reflection module
    pub sa: Arc<dyn SelfAwareness>,
    /// Host I/O and clock
    pub host: Arc<dyn Host>,
    /// Controller back-end, if this node is one
    pub local_network_controller: Option<Arc<dyn NetworkController>>,
}

impl Runtime {
    /// Assemble a runtime around the given collaborators.
    pub fn new(
        identity: LocalIdentity,
        world: World,
        sw: Arc<dyn Switch>,
        sa: Arc<dyn SelfAwareness>,
        host: Arc<dyn Host>,
        local_network_controller: Option<Arc<dyn NetworkController>>,
    ) -> Self {
        Self {
            identity,
            topology: Topology::new(world),
            networks: Networks::new(),
            mc: MulticastStore::new(),
            sw,
            sa,
            host,
            local_network_controller,
        }
    }
}
