use std::sync::Arc;

use parking_lot::Mutex;

use filament::address::{Address, Mac, MulticastGroup};
use filament::buffer::Buffer;
use filament::cert::CertificateOfMembership;
use filament::dispatch::IncomingPacket;
use filament::identity::{Identity, LocalIdentity};
use filament::inet::InetAddress;
use filament::network::NetworkConfig;
use filament::packet::{ErrorCode, Packet, Verb, IDX_PAYLOAD, PROTO_VERSION};
use filament::peer::Peer;
use filament::pow;
use filament::runtime::{
    CircuitTestReport, ControllerResult, Event, Host, NetworkController, Runtime, SelfAwareness,
    Switch,
};
use filament::world::{Root, World};

const NOW: u64 = 1_700_000_000_000;
const WORLD_ID: u64 = 149_604_618;
const WORLD_TS: u64 = 1_000_000;

#[derive(Default)]
struct MockSwitch {
    whois: Mutex<Vec<Address>>,
    cancels: Mutex<Vec<Address>>,
    rendezvous_calls: Mutex<Vec<(Address, InetAddress)>>,
    waiting: Mutex<Vec<Address>>,
    sent: Mutex<Vec<(Packet, bool, u64)>>,
}

impl Switch for MockSwitch {
    fn request_whois(&self, addr: Address) {
        self.whois.lock().push(addr);
    }

    fn cancel_whois(&self, addr: Address) {
        self.cancels.lock().push(addr);
    }

    fn rendezvous(&self, with: &Arc<Peer>, _local: &InetAddress, at: &InetAddress) {
        self.rendezvous_calls.lock().push((with.address(), *at));
    }

    fn do_anything_waiting_for_peer(&self, peer: &Arc<Peer>) {
        self.waiting.lock().push(peer.address());
    }

    fn send(&self, packet: Packet, require_trust: bool, nwid: u64) {
        self.sent.lock().push((packet, require_trust, nwid));
    }
}

#[derive(Default)]
struct MockHost {
    now: u64,
    packets: Mutex<Vec<(InetAddress, InetAddress, Vec<u8>)>>,
    frames: Mutex<Vec<(u64, Mac, Mac, u16, Vec<u8>)>>,
    events: Mutex<Vec<Event>>,
    reports: Mutex<Vec<CircuitTestReport>>,
}

impl Host for MockHost {
    fn put_packet(&self, local: &InetAddress, remote: &InetAddress, data: &[u8]) {
        self.packets.lock().push((*local, *remote, data.to_vec()));
    }

    fn put_frame(&self, nwid: u64, from: Mac, to: Mac, ether_type: u16, _vlan: u16, data: &[u8]) {
        self.frames.lock().push((nwid, from, to, ether_type, data.to_vec()));
    }

    fn now(&self) -> u64 {
        self.now
    }

    fn post_event(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn post_circuit_test_report(&self, report: &CircuitTestReport) {
        self.reports.lock().push(report.clone());
    }
}

#[derive(Default)]
struct MockSa {
    iams: Mutex<Vec<(Address, InetAddress, InetAddress, bool)>>,
}

impl SelfAwareness for MockSa {
    fn iam(
        &self,
        reporter: Address,
        via: &InetAddress,
        reported: &InetAddress,
        trusted: bool,
        _now: u64,
    ) {
        self.iams.lock().push((reporter, *via, *reported, trusted));
    }
}

struct MockController {
    result: ControllerResult,
}

impl NetworkController for MockController {
    fn do_request(
        &self,
        _from: Option<InetAddress>,
        _local: &Identity,
        _requestor: &Identity,
        _nwid: u64,
        _metadata: &[u8],
    ) -> ControllerResult {
        self.result.clone()
    }
}

struct Node {
    rt: Runtime,
    sw: Arc<MockSwitch>,
    host: Arc<MockHost>,
    sa: Arc<MockSa>,
}

fn make_node(roots: &[&LocalIdentity], controller: Option<Arc<dyn NetworkController>>) -> Node {
    let local = LocalIdentity::generate();
    let world = World::new_signed(
        WORLD_ID,
        WORLD_TS,
        roots
            .iter()
            .map(|r| Root { identity: r.identity().clone(), endpoints: Vec::new() })
            .collect(),
        &local,
    );
    let sw = Arc::new(MockSwitch::default());
    let host = Arc::new(MockHost { now: NOW, ..Default::default() });
    let sa = Arc::new(MockSa::default());
    let rt = Runtime::new(local, world, sw.clone(), sa.clone(), host.clone(), controller);
    Node { rt, sw, host, sa }
}

fn local_ep() -> InetAddress {
    InetAddress::v4([192, 0, 2, 1], 9993)
}

fn remote_ep() -> InetAddress {
    InetAddress::v4([203, 0, 113, 50], 31744)
}

fn add_peer(node: &Node, id: &LocalIdentity) -> Arc<Peer> {
    node.rt
        .topology
        .add(Arc::new(Peer::new(&node.rt.identity, id.identity().clone()).unwrap()))
}

fn decode(node: &Node, bytes: &[u8]) -> bool {
    let mut incoming = IncomingPacket::new(bytes, local_ep(), remote_ep()).unwrap();
    incoming.try_decode(&node.rt)
}

// Build an armored (encrypted) packet from `sender` to the node.
fn armored(
    sender: &LocalIdentity,
    node: &Node,
    verb: Verb,
    payload: impl FnOnce(&mut Packet),
) -> Vec<u8> {
    let key = sender.agree(node.rt.identity.identity()).unwrap();
    let mut p = Packet::new(node.rt.identity.address(), sender.address(), verb);
    payload(&mut p);
    p.armor(&key, true);
    p.as_bytes().to_vec()
}

// Dearmor the node's single emitted reply and hand it back for inspection.
fn single_reply(node: &Node, sender: &LocalIdentity) -> Packet {
    let packets = node.host.packets.lock();
    assert_eq!(packets.len(), 1, "expected exactly one reply");
    let mut reply = Packet::from_bytes(&packets[0].2).unwrap();
    let key = sender.agree(node.rt.identity.identity()).unwrap();
    assert!(reply.dearmor(&key), "reply must authenticate under the peer key");
    assert!(reply.uncompress());
    reply
}

fn hello_packet(
    sender: &LocalIdentity,
    node: &Node,
    world_id: u64,
    world_ts: u64,
    dest: Option<InetAddress>,
) -> Vec<u8> {
    let key = sender.agree(node.rt.identity.identity()).unwrap();
    let mut p = Packet::new(node.rt.identity.address(), sender.address(), Verb::Hello);
    p.append_u8(PROTO_VERSION);
    p.append_u8(1);
    p.append_u8(2);
    p.append_u16(0);
    p.append_u64(NOW - 50);
    sender.identity().serialize(&mut p);
    if let Some(d) = dest {
        d.serialize(&mut p);
        p.append_u64(world_id);
        p.append_u64(world_ts);
    }
    p.armor(&key, false);
    p.as_bytes().to_vec()
}

// An identity claiming `address` but carrying someone else's keys.
fn forged_identity(address: Address, donor: &LocalIdentity) -> Identity {
    let mut buf = Buffer::new();
    donor.identity().serialize(&mut buf);
    let mut bytes = buf.as_bytes().to_vec();
    bytes[..Address::LEN].copy_from_slice(&address.to_bytes());
    let (id, _) = Identity::deserialize(&Buffer::from_bytes(&bytes), 0).unwrap();
    id
}

fn private_network(node: &Node, controller: &LocalIdentity, nwn: u64) -> u64 {
    let nwid = (controller.address().to_u64() << 24) | nwn;
    let network = node.rt.networks.join(nwid, node.rt.identity.address());
    let our_com = CertificateOfMembership::issue(
        nwid,
        node.rt.identity.address(),
        NOW,
        1,
        60_000,
        controller,
    );
    network.set_configuration(NetworkConfig {
        network_id: nwid,
        timestamp: NOW,
        public: false,
        ether_types: Vec::new(),
        active_bridges: Vec::new(),
        com: Some(our_com),
    });
    nwid
}

fn public_network(node: &Node, controller: &LocalIdentity, nwn: u64) -> u64 {
    let nwid = (controller.address().to_u64() << 24) | nwn;
    let network = node.rt.networks.join(nwid, node.rt.identity.address());
    network.set_configuration(NetworkConfig {
        network_id: nwid,
        timestamp: NOW,
        public: true,
        ether_types: Vec::new(),
        active_bridges: Vec::new(),
        com: None,
    });
    nwid
}

#[test]
fn first_contact_hello_learns_identity_and_replies() {
    let node = make_node(&[], None);
    let a = LocalIdentity::generate();

    let bytes = hello_packet(&a, &node, WORLD_ID, WORLD_TS - 1, Some(local_ep()));
    assert!(decode(&node, &bytes));

    // The identity was learned
    let peer = node.rt.topology.get(a.address()).expect("peer learned");
    assert_eq!(*peer.identity(), *a.identity());
    assert_eq!(peer.remote_version(), Some((PROTO_VERSION, 1, 2, 0)));

    // Self-awareness saw the reflected address
    let iams = node.sa.iams.lock();
    assert_eq!(iams.len(), 1);
    assert_eq!(iams[0].0, a.address());
    assert_eq!(iams[0].1, remote_ep());
    assert_eq!(iams[0].2, local_ep());
    assert!(!iams[0].3);
    drop(iams);

    // OK(HELLO) echoes the timestamp, reflects their endpoint and carries
    // our newer world
    let reply = single_reply(&node, &a);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::Hello.to_u8());
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 9).unwrap(), NOW - 50);

    let (reflected, consumed) = InetAddress::deserialize(&reply, IDX_PAYLOAD + 22).unwrap();
    assert_eq!(reflected, remote_ep());

    let size_at = IDX_PAYLOAD + 22 + consumed;
    assert!(reply.u16_at(size_at).unwrap() > 0);
    let (world, _) = World::deserialize(&reply, size_at + 2).unwrap();
    assert_eq!(world.id, WORLD_ID);
    assert_eq!(world.timestamp, WORLD_TS);
}

#[test]
fn hello_same_world_but_not_newer_sends_empty_trailer() {
    let node = make_node(&[], None);
    let a = LocalIdentity::generate();

    let bytes = hello_packet(&a, &node, WORLD_ID, WORLD_TS, Some(local_ep()));
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &a);
    let (_, consumed) = InetAddress::deserialize(&reply, IDX_PAYLOAD + 22).unwrap();
    assert_eq!(reply.u16_at(IDX_PAYLOAD + 22 + consumed).unwrap(), 0);
}

#[test]
fn hello_world_mismatch_gets_no_reply_but_is_learned() {
    let node = make_node(&[], None);
    let a = LocalIdentity::generate();

    let bytes = hello_packet(&a, &node, WORLD_ID + 1, WORLD_TS, Some(local_ep()));
    assert!(decode(&node, &bytes));

    assert!(node.rt.topology.get(a.address()).is_some());
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn colliding_hello_gets_identity_collision_error() {
    let node = make_node(&[], None);
    let a = LocalIdentity::generate();
    let donor = LocalIdentity::generate();

    // Someone else already claims A's address in our topology
    let forged = forged_identity(a.address(), &donor);
    node.rt
        .topology
        .add(Arc::new(Peer::new(&node.rt.identity, forged.clone()).unwrap()));

    let bytes = hello_packet(&a, &node, WORLD_ID, WORLD_TS - 1, Some(local_ep()));
    assert!(decode(&node, &bytes));

    // Exactly one ERROR(IDENTITY_COLLISION), MACed under the ephemeral key
    let reply = single_reply(&node, &a);
    assert_eq!(reply.verb(), Verb::Error);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::Hello.to_u8());
    assert_eq!(
        ErrorCode::from_u8(reply.u8_at(IDX_PAYLOAD + 9).unwrap()),
        ErrorCode::IdentityCollision
    );

    // Topology unchanged
    assert_eq!(*node.rt.topology.get(a.address()).unwrap().identity(), forged);
}

#[test]
fn hello_with_wrong_source_address_is_dropped() {
    let node = make_node(&[], None);
    let a = LocalIdentity::generate();

    let mut bytes = hello_packet(&a, &node, WORLD_ID, WORLD_TS - 1, Some(local_ep()));
    // Corrupt the header source so it no longer matches the identity
    bytes[5] ^= 0x01;
    assert!(decode(&node, &bytes));

    assert!(node.rt.topology.get(a.address()).is_none());
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn hello_with_invalid_identity_is_dropped() {
    let node = make_node(&[], None);
    let donor = LocalIdentity::generate();
    let fake_addr = Address::from_u64(0x0505050505);
    let forged = forged_identity(fake_addr, &donor);

    // The MAC is genuine under the key the forged identity would derive,
    // but the identity's address does not bind to its keys
    let key = donor.agree(node.rt.identity.identity()).unwrap();
    let mut p = Packet::new(node.rt.identity.address(), fake_addr, Verb::Hello);
    p.append_u8(PROTO_VERSION);
    p.append_u8(1);
    p.append_u8(0);
    p.append_u16(0);
    p.append_u64(NOW - 5);
    forged.serialize(&mut p);
    local_ep().serialize(&mut p);
    p.append_u64(WORLD_ID);
    p.append_u64(WORLD_TS - 1);
    p.armor(&key, false);

    assert!(decode(&node, p.as_bytes()));
    assert!(node.rt.topology.get(fake_addr).is_none());
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn unknown_cipher_suite_is_dropped_without_whois() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();

    let mut bytes = armored(&b, &node, Verb::Echo, |_| {});
    bytes[27] = 0x7 << 5;
    assert!(decode(&node, &bytes));

    assert!(node.sw.whois.lock().is_empty());
    assert_eq!(node.rt.topology.peer_count(), 0);
}

#[test]
fn frame_from_unknown_peer_defers_and_requests_whois() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();

    let bytes = armored(&b, &node, Verb::Frame, |p| {
        p.append_u64(0x1122334455000001);
        p.append_u16(0x0800);
        p.append_bytes(&[0u8; 40]);
    });
    assert!(!decode(&node, &bytes));

    assert_eq!(node.sw.whois.lock().as_slice(), &[b.address()]);
    assert!(node.host.frames.lock().is_empty());
}

#[test]
fn frame_with_bad_mac_is_dropped() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    let peer = add_peer(&node, &b);

    let mut bytes = armored(&b, &node, Verb::Frame, |p| {
        p.append_u64(0x1122334455000001);
        p.append_u16(0x0800);
        p.append_bytes(&[0u8; 40]);
    });
    bytes[12] ^= 0xff; // corrupt the MAC
    assert!(decode(&node, &bytes));

    assert!(node.host.frames.lock().is_empty());
    assert_eq!(peer.last_received(), 0, "unauthenticated packets are not accounted");
}

#[test]
fn frame_on_public_network_is_delivered() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = public_network(&node, &controller, 7);

    let bytes = armored(&b, &node, Verb::Frame, |p| {
        p.append_u64(nwid);
        p.append_u16(0x0800);
        p.append_bytes(b"ip packet bytes");
    });
    assert!(decode(&node, &bytes));

    let frames = node.host.frames.lock();
    assert_eq!(frames.len(), 1);
    let network = node.rt.networks.get(nwid).unwrap();
    assert_eq!(frames[0].0, nwid);
    assert_eq!(frames[0].1, Mac::from_address(b.address(), nwid));
    assert_eq!(frames[0].2, network.mac());
    assert_eq!(frames[0].3, 0x0800);
    assert_eq!(frames[0].4, b"ip packet bytes");
}

#[test]
fn frame_with_disallowed_ethertype_is_dropped() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = (controller.address().to_u64() << 24) | 9;
    let network = node.rt.networks.join(nwid, node.rt.identity.address());
    network.set_configuration(NetworkConfig {
        network_id: nwid,
        timestamp: NOW,
        public: true,
        ether_types: vec![0x0806], // ARP only
        active_bridges: Vec::new(),
        com: None,
    });

    let bytes = armored(&b, &node, Verb::Frame, |p| {
        p.append_u64(nwid);
        p.append_u16(0x0800);
        p.append_bytes(&[0u8; 20]);
    });
    assert!(decode(&node, &bytes));
    assert!(node.host.frames.lock().is_empty());
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn unauthorized_frame_on_private_network_gets_need_certificate() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = private_network(&node, &controller, 1);

    let bytes = armored(&b, &node, Verb::Frame, |p| {
        p.append_u64(nwid);
        p.append_u16(0x0800);
        p.append_bytes(&[0u8; 32]);
    });
    assert!(decode(&node, &bytes));

    assert!(node.host.frames.lock().is_empty());
    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Error);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::Frame.to_u8());
    assert_eq!(
        ErrorCode::from_u8(reply.u8_at(IDX_PAYLOAD + 9).unwrap()),
        ErrorCode::NeedMembershipCertificate
    );
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 10).unwrap(), nwid);
}

#[test]
fn ext_frame_with_certificate_is_admitted() {
    let node = make_node(&[], None);
    let controller = LocalIdentity::generate();
    add_peer(&node, &controller); // signer must be resolvable
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let nwid = private_network(&node, &controller, 2);
    let network = node.rt.networks.get(nwid).unwrap();

    let b_com = CertificateOfMembership::issue(nwid, b.address(), NOW, 1, 60_000, &controller);
    let from = Mac::from_address(b.address(), nwid);
    let to = network.mac();

    let bytes = armored(&b, &node, Verb::ExtFrame, |p| {
        p.append_u64(nwid);
        p.append_u8(0x01); // COM included
        b_com.serialize(p);
        p.append_u16(0x0800);
        to.append_to(p);
        from.append_to(p);
        p.append_bytes(b"bridged payload");
    });
    assert!(decode(&node, &bytes));

    let frames = node.host.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, from);
    assert_eq!(frames[0].2, to);
    assert_eq!(frames[0].4, b"bridged payload");
}

#[test]
fn ext_frame_to_multicast_destination_is_dropped() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = public_network(&node, &controller, 3);

    let multicast_to = Mac::from_u64(0x01005e_000001);
    let from = Mac::from_address(b.address(), nwid);

    let bytes = armored(&b, &node, Verb::ExtFrame, |p| {
        p.append_u64(nwid);
        p.append_u8(0);
        p.append_u16(0x0800);
        multicast_to.append_to(p);
        from.append_to(p);
        p.append_bytes(&[0u8; 16]);
    });
    assert!(decode(&node, &bytes));
    assert!(node.host.frames.lock().is_empty());
}

#[test]
fn echo_is_answered_with_payload() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::Echo, |p| p.append_bytes(b"ping!"));
    let pid = Packet::from_bytes(&bytes).unwrap().packet_id();
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::Echo.to_u8());
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 1).unwrap(), pid);
    assert_eq!(reply.bytes_at(IDX_PAYLOAD + 9, 5).unwrap(), b"ping!");
}

#[test]
fn whois_answers_known_and_unknown_targets() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let c = LocalIdentity::generate();
    add_peer(&node, &c);

    let bytes = armored(&b, &node, Verb::Whois, |p| c.address().append_to(p));
    assert!(decode(&node, &bytes));
    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::Whois.to_u8());
    let (id, _) = Identity::deserialize(&reply, IDX_PAYLOAD + 9).unwrap();
    assert_eq!(id, *c.identity());
    node.host.packets.lock().clear();

    let ghost = Address::from_u64(0x0909090909);
    let bytes = armored(&b, &node, Verb::Whois, |p| ghost.append_to(p));
    assert!(decode(&node, &bytes));
    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Error);
    assert_eq!(
        ErrorCode::from_u8(reply.u8_at(IDX_PAYLOAD + 9).unwrap()),
        ErrorCode::ObjNotFound
    );
    assert_eq!(
        reply.bytes_at(IDX_PAYLOAD + 10, Address::LEN).unwrap(),
        &ghost.to_bytes()[..]
    );
}

#[test]
fn rendezvous_triggers_nat_traversal_for_known_peer() {
    let node = make_node(&[], None);
    let relay = LocalIdentity::generate();
    add_peer(&node, &relay);
    let w = LocalIdentity::generate();
    add_peer(&node, &w);

    let bytes = armored(&relay, &node, Verb::Rendezvous, |p| {
        w.address().append_to(p);
        p.append_u16(40000);
        p.append_u8(4);
        p.append_bytes(&[198, 51, 100, 22]);
    });
    assert!(decode(&node, &bytes));

    let calls = node.sw.rendezvous_calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, w.address());
    assert_eq!(calls[0].1, InetAddress::v4([198, 51, 100, 22], 40000));
}

#[test]
fn rendezvous_with_zero_port_is_ignored() {
    let node = make_node(&[], None);
    let relay = LocalIdentity::generate();
    add_peer(&node, &relay);
    let w = LocalIdentity::generate();
    add_peer(&node, &w);

    let bytes = armored(&relay, &node, Verb::Rendezvous, |p| {
        w.address().append_to(p);
        p.append_u16(0);
        p.append_u8(4);
        p.append_bytes(&[198, 51, 100, 22]);
    });
    assert!(decode(&node, &bytes));
    assert!(node.sw.rendezvous_calls.lock().is_empty());
}

#[test]
fn multicast_like_is_idempotent() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let nwid = 0x1122334455000001u64;
    let group = MulticastGroup::new(Mac::from_u64(0x0100_5e00_0001), 0);

    let like = |node: &Node| {
        armored(&b, node, Verb::MulticastLike, |p| {
            p.append_u64(nwid);
            group.mac.append_to(p);
            p.append_u32(group.adi);
        })
    };

    assert!(decode(&node, &like(&node)));
    assert!(node.rt.mc.is_subscribed(nwid, group, b.address()));
    let first = node.rt.mc.gather(Address::from_u64(1), nwid, group, 128, NOW);

    assert!(decode(&node, &like(&node)));
    let second = node.rt.mc.gather(Address::from_u64(1), nwid, group, 128, NOW);
    assert_eq!(first, second);
    assert_eq!(second.0, 1);
}

#[test]
fn multicast_gather_replies_with_members() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let nwid = 0x1122334455000001u64;
    let group = MulticastGroup::new(Mac::from_u64(0x0100_5e00_0001), 7);
    let member = Address::from_u64(0x0707070707);
    node.rt.mc.add(NOW, nwid, group, member);

    let bytes = armored(&b, &node, Verb::MulticastGather, |p| {
        p.append_u64(nwid);
        group.mac.append_to(p);
        p.append_u32(group.adi);
        p.append_u32(64);
    });
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::MulticastGather.to_u8());
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 9).unwrap(), nwid);
    assert_eq!(reply.u32_at(IDX_PAYLOAD + 27).unwrap(), 1); // total known
    assert_eq!(reply.u16_at(IDX_PAYLOAD + 31).unwrap(), 1); // returned
    assert_eq!(
        reply.bytes_at(IDX_PAYLOAD + 33, Address::LEN).unwrap(),
        &member.to_bytes()[..]
    );
}

#[test]
fn multicast_frame_is_delivered_to_tap() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = public_network(&node, &controller, 4);

    let dest = Mac::from_u64(0x3333_0000_0001 | (1 << 40));
    let bytes = armored(&b, &node, Verb::MulticastFrame, |p| {
        p.append_u64(nwid);
        p.append_u8(0); // no optional fields
        dest.append_to(p);
        p.append_u32(0);
        p.append_u16(0x86dd);
        p.append_bytes(b"v6 multicast");
    });
    assert!(decode(&node, &bytes));

    let frames = node.host.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, Mac::from_address(b.address(), nwid));
    assert_eq!(frames[0].2, dest);
    assert_eq!(frames[0].3, 0x86dd);
    assert_eq!(frames[0].4, b"v6 multicast");
}

#[test]
fn multicast_frame_with_unicast_destination_is_dropped() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = public_network(&node, &controller, 5);

    let bytes = armored(&b, &node, Verb::MulticastFrame, |p| {
        p.append_u64(nwid);
        p.append_u8(0);
        Mac::from_u64(0x2200_0000_0001).append_to(p); // unicast MAC
        p.append_u32(0);
        p.append_u16(0x0800);
        p.append_bytes(&[0u8; 8]);
    });
    assert!(decode(&node, &bytes));
    assert!(node.host.frames.lock().is_empty());
}

#[test]
fn push_direct_paths_contacts_valid_addresses_only() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::PushDirectPaths, |p| {
        p.append_u16(3);
        // Valid global address
        p.append_u8(0);
        p.append_u16(0);
        p.append_u8(4);
        p.append_u8(6);
        p.append_bytes(&[198, 51, 100, 99]);
        p.append_u16(9993);
        // Loopback: never a valid path
        p.append_u8(0);
        p.append_u16(0);
        p.append_u8(4);
        p.append_u8(6);
        p.append_bytes(&[127, 0, 0, 1]);
        p.append_u16(9993);
        // Forbidden flag bit set
        p.append_u8(0x01);
        p.append_u16(0);
        p.append_u8(4);
        p.append_u8(6);
        p.append_bytes(&[198, 51, 100, 100]);
        p.append_u16(9993);
    });
    assert!(decode(&node, &bytes));

    let packets = node.host.packets.lock();
    assert_eq!(packets.len(), 1, "exactly one HELLO probe");
    assert_eq!(packets[0].1, InetAddress::v4([198, 51, 100, 99], 9993));
    let probe = Packet::from_bytes(&packets[0].2).unwrap();
    assert_eq!(probe.destination(), b.address());
}

#[test]
fn error_obj_not_found_from_root_cancels_whois() {
    let root = LocalIdentity::generate();
    let node = make_node(&[&root], None);
    add_peer(&node, &root);
    let target = Address::from_u64(0x0404040404);

    let bytes = armored(&root, &node, Verb::Error, |p| {
        p.append_u8(Verb::Whois.to_u8());
        p.append_u64(12345);
        p.append_u8(ErrorCode::ObjNotFound.to_u8());
        target.append_to(p);
    });
    assert!(decode(&node, &bytes));
    assert_eq!(node.sw.cancels.lock().as_slice(), &[target]);
}

#[test]
fn error_identity_collision_is_fatal_only_from_roots() {
    let root = LocalIdentity::generate();
    let node = make_node(&[&root], None);
    add_peer(&node, &root);
    let stranger = LocalIdentity::generate();
    add_peer(&node, &stranger);

    let collision = |sender: &LocalIdentity, node: &Node| {
        armored(sender, node, Verb::Error, |p| {
            p.append_u8(Verb::Hello.to_u8());
            p.append_u64(1);
            p.append_u8(ErrorCode::IdentityCollision.to_u8());
        })
    };

    assert!(decode(&node, &collision(&stranger, &node)));
    assert!(node.host.events.lock().is_empty());

    assert!(decode(&node, &collision(&root, &node)));
    assert_eq!(node.host.events.lock().as_slice(), &[Event::FatalIdentityCollision]);
}

#[test]
fn error_need_certificate_pushes_our_com() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);
    let controller = LocalIdentity::generate();
    let nwid = private_network(&node, &controller, 6);
    let our_com = node.rt.networks.get(nwid).unwrap().config().unwrap().com.unwrap();

    let bytes = armored(&b, &node, Verb::Error, |p| {
        p.append_u8(Verb::Frame.to_u8());
        p.append_u64(99);
        p.append_u8(ErrorCode::NeedMembershipCertificate.to_u8());
        p.append_u64(nwid);
    });
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::NetworkMembershipCertificate);
    let (pushed, _) = CertificateOfMembership::deserialize(&reply, IDX_PAYLOAD).unwrap();
    assert_eq!(pushed, our_com);
}

#[test]
fn ok_whois_from_root_introduces_peer() {
    let root = LocalIdentity::generate();
    let node = make_node(&[&root], None);
    add_peer(&node, &root);
    let c = LocalIdentity::generate();

    let bytes = armored(&root, &node, Verb::Ok, |p| {
        p.append_u8(Verb::Whois.to_u8());
        p.append_u64(777);
        c.identity().serialize(p);
    });
    assert!(decode(&node, &bytes));

    assert!(node.rt.topology.get(c.address()).is_some());
    assert_eq!(node.sw.waiting.lock().as_slice(), &[c.address()]);
}

#[test]
fn ok_whois_from_non_root_is_ignored() {
    let node = make_node(&[], None);
    let stranger = LocalIdentity::generate();
    add_peer(&node, &stranger);
    let c = LocalIdentity::generate();

    let bytes = armored(&stranger, &node, Verb::Ok, |p| {
        p.append_u8(Verb::Whois.to_u8());
        p.append_u64(777);
        c.identity().serialize(p);
    });
    assert!(decode(&node, &bytes));
    assert!(node.rt.topology.get(c.address()).is_none());
}

#[test]
fn ok_hello_records_latency_and_version() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    let peer = add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::Ok, |p| {
        p.append_u8(Verb::Hello.to_u8());
        p.append_u64(42);
        p.append_u64(NOW - 37); // echoed timestamp
        p.append_u8(PROTO_VERSION);
        p.append_u8(1);
        p.append_u8(9);
        p.append_u16(3);
        local_ep().serialize(p);
    });
    assert!(decode(&node, &bytes));

    assert_eq!(peer.latency(), 37);
    assert_eq!(peer.remote_version(), Some((PROTO_VERSION, 1, 9, 3)));
    let iams = node.sa.iams.lock();
    assert_eq!(iams.len(), 1);
    assert_eq!(iams[0].2, local_ep());
}

#[test]
fn network_config_request_without_controller_is_unsupported() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::NetworkConfigRequest, |p| {
        p.append_u64(0xabcdef0102000001);
        p.append_u16(0);
    });
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Error);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::NetworkConfigRequest.to_u8());
    assert_eq!(
        ErrorCode::from_u8(reply.u8_at(IDX_PAYLOAD + 9).unwrap()),
        ErrorCode::UnsupportedOperation
    );
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 10).unwrap(), 0xabcdef0102000001);
}

#[test]
fn network_config_request_is_answered_by_controller() {
    let controller_cfg = NetworkConfig {
        network_id: 0x0102030405000001,
        timestamp: NOW,
        public: true,
        ether_types: Vec::new(),
        active_bridges: Vec::new(),
        com: None,
    };
    let dict = controller_cfg.to_bytes();
    let node = make_node(
        &[],
        Some(Arc::new(MockController { result: ControllerResult::Ok(dict.clone()) })),
    );
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::NetworkConfigRequest, |p| {
        p.append_u64(0x0102030405000001);
        p.append_u16(0);
    });
    let pid = Packet::from_bytes(&bytes).unwrap().packet_id();
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &b);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::NetworkConfigRequest.to_u8());
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 1).unwrap(), pid);
    assert_eq!(reply.u64_at(IDX_PAYLOAD + 9).unwrap(), 0x0102030405000001);
    let len = reply.u16_at(IDX_PAYLOAD + 17).unwrap() as usize;
    assert_eq!(reply.bytes_at(IDX_PAYLOAD + 19, len).unwrap(), &dict[..]);
}

#[test]
fn ok_network_config_request_applies_configuration() {
    let node = make_node(&[], None);
    let controller = LocalIdentity::generate();
    add_peer(&node, &controller);
    let nwid = (controller.address().to_u64() << 24) | 11;
    let network = node.rt.networks.join(nwid, node.rt.identity.address());
    assert!(network.config().is_none());

    let cfg = NetworkConfig {
        network_id: nwid,
        timestamp: NOW,
        public: true,
        ether_types: vec![0x0800, 0x0806],
        active_bridges: Vec::new(),
        com: None,
    };
    let dict = cfg.to_bytes();

    let bytes = armored(&controller, &node, Verb::Ok, |p| {
        p.append_u8(Verb::NetworkConfigRequest.to_u8());
        p.append_u64(1);
        p.append_u64(nwid);
        p.append_u16(dict.len() as u16);
        p.append_bytes(&dict);
    });
    assert!(decode(&node, &bytes));

    assert_eq!(network.config(), Some(cfg));
}

#[test]
fn network_config_refresh_from_controller_requests_configuration() {
    let node = make_node(&[], None);
    let controller = LocalIdentity::generate();
    add_peer(&node, &controller);
    let nwid = (controller.address().to_u64() << 24) | 12;
    node.rt.networks.join(nwid, node.rt.identity.address());

    let bytes = armored(&controller, &node, Verb::NetworkConfigRefresh, |p| {
        p.append_u64(nwid);
    });
    assert!(decode(&node, &bytes));

    let sent = node.sw.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.verb(), Verb::NetworkConfigRequest);
    assert_eq!(sent[0].0.destination(), controller.address());
    assert_eq!(sent[0].2, nwid);
}

#[test]
fn circuit_test_reports_and_forwards() {
    let o = LocalIdentity::generate();
    let node = make_node(&[&o], None);
    add_peer(&node, &o);
    let nwid = public_network(&node, &o, 7);

    let h1 = Address::from_u64(0x0101010101);
    let h2 = Address::from_u64(0x0202020202);

    let mut body = Buffer::new();
    o.address().append_to(&mut body);
    body.append_u16(0x0001); // report to originator at every hop
    body.append_u64(NOW - 10);
    body.append_u64(0x1234567812345678);
    body.append_u16(9); // originator credential: type + network ID
    body.append_u8(0x01);
    body.append_u64(nwid);
    body.append_u16(0); // no additional fields
    let signature = o.sign(body.as_bytes());
    body.append_u16(signature.len() as u16);
    body.append_bytes(&signature);
    let signed_portion_len = body.len();
    body.append_u16(0); // no previous hop credential
    body.append_u8(0); // next hop flags
    body.append_u8(2); // breadth
    h1.append_to(&mut body);
    h2.append_to(&mut body);

    let bytes = armored(&o, &node, Verb::CircuitTest, |p| p.append_bytes(body.as_bytes()));
    let incoming_pid = Packet::from_bytes(&bytes).unwrap().packet_id();
    assert!(decode(&node, &bytes));

    let sent = node.sw.sent.lock();
    assert_eq!(sent.len(), 3, "one report plus two forwards");

    let report = &sent[0].0;
    assert_eq!(report.verb(), Verb::CircuitTestReport);
    assert_eq!(report.destination(), o.address());
    assert!(sent[0].1);
    assert_eq!(sent[0].2, 0);
    assert_eq!(report.u64_at(IDX_PAYLOAD + 8).unwrap(), 0x1234567812345678);
    assert_eq!(report.u64_at(IDX_PAYLOAD + 44).unwrap(), incoming_pid);

    for (fwd, hop) in [(&sent[1], h1), (&sent[2], h2)] {
        assert_eq!(fwd.0.verb(), Verb::CircuitTest);
        assert_eq!(fwd.0.destination(), hop);
        assert!(fwd.1);
        assert_eq!(fwd.2, nwid);
        // The signed portion travels bit-identical
        assert_eq!(
            fwd.0.bytes_at(IDX_PAYLOAD, signed_portion_len).unwrap(),
            &body.as_bytes()[..signed_portion_len]
        );
        // The consumed hop level is stripped: next hop sees no hop list
        assert_eq!(fwd.0.len(), filament::packet::IDX_PAYLOAD + signed_portion_len + 2);
    }
    assert_ne!(sent[1].0.packet_id(), incoming_pid);
    assert_ne!(sent[1].0.packet_id(), sent[2].0.packet_id());
}

#[test]
fn circuit_test_with_bad_signature_is_dropped() {
    let o = LocalIdentity::generate();
    let node = make_node(&[&o], None);
    add_peer(&node, &o);
    let nwid = public_network(&node, &o, 7);

    let mut body = Buffer::new();
    o.address().append_to(&mut body);
    body.append_u16(0x0001);
    body.append_u64(NOW - 10);
    body.append_u64(1);
    body.append_u16(9);
    body.append_u8(0x01);
    body.append_u64(nwid);
    body.append_u16(0);
    body.append_u16(64);
    body.append_bytes(&[0u8; 64]); // garbage signature
    body.append_u16(0);
    body.append_u8(0);
    body.append_u8(0);

    let bytes = armored(&o, &node, Verb::CircuitTest, |p| p.append_bytes(body.as_bytes()));
    assert!(decode(&node, &bytes));
    assert!(node.sw.sent.lock().is_empty());
}

#[test]
fn circuit_test_report_is_posted_upward() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    add_peer(&node, &b);

    let upstream = Address::from_u64(0x0a0a0a0a0a);
    let bytes = armored(&b, &node, Verb::CircuitTestReport, |p| {
        p.append_u64(NOW - 100); // timestamp
        p.append_u64(0xfeedfeedfeedfeed); // test id
        p.append_u64(NOW - 40); // remote timestamp
        p.append_u8(0x01); // vendor
        p.append_u8(PROTO_VERSION);
        p.append_u8(1);
        p.append_u8(2);
        p.append_u16(0); // revision
        p.append_u16(0); // platform
        p.append_u16(0); // architecture
        p.append_u16(0); // error code
        p.append_u64(0); // flags
        p.append_u64(31337); // source packet id
        upstream.append_to(p);
        p.append_u8(2); // source hop count
        local_ep().serialize(p);
        remote_ep().serialize(p);
        p.append_u16(0); // no additional fields
        p.append_u8(1); // one next hop
        Address::from_u64(0x0b0b0b0b0b).append_to(p);
        InetAddress::v4([198, 51, 100, 3], 9993).serialize(p);
    });
    assert!(decode(&node, &bytes));

    let reports = node.host.reports.lock();
    assert_eq!(reports.len(), 1);
    let r = &reports[0];
    assert_eq!(r.current, b.address());
    assert_eq!(r.upstream, upstream);
    assert_eq!(r.test_id, 0xfeedfeedfeedfeed);
    assert_eq!(r.source_packet_id, 31337);
    assert_eq!(r.source_packet_hop_count, 2);
    assert_eq!(r.received_on_local_address, local_ep());
    assert_eq!(r.received_from_remote_address, remote_ep());
    assert_eq!(
        r.next_hops,
        vec![(Address::from_u64(0x0b0b0b0b0b), InetAddress::v4([198, 51, 100, 3], 9993))]
    );
}

#[test]
fn proof_of_work_request_from_root_is_served() {
    let root = LocalIdentity::generate();
    let node = make_node(&[&root], None);
    add_peer(&node, &root);

    let challenge: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(3)).collect();
    let bytes = armored(&root, &node, Verb::RequestProofOfWork, |p| {
        p.append_u8(0x01);
        p.append_u8(8);
        p.append_u16(challenge.len() as u16);
        p.append_bytes(&challenge);
    });
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &root);
    assert_eq!(reply.verb(), Verb::Ok);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::RequestProofOfWork.to_u8());
    assert_eq!(reply.u16_at(IDX_PAYLOAD + 9).unwrap(), 16);
    let mut result = [0u8; 16];
    result.copy_from_slice(reply.bytes_at(IDX_PAYLOAD + 11, 16).unwrap());
    assert!(pow::verify(8, &challenge, &result));
}

#[test]
fn proof_of_work_request_above_served_difficulty_is_invalid() {
    let root = LocalIdentity::generate();
    let node = make_node(&[&root], None);
    add_peer(&node, &root);

    let bytes = armored(&root, &node, Verb::RequestProofOfWork, |p| {
        p.append_u8(0x01);
        p.append_u8(15);
        p.append_u16(4);
        p.append_bytes(&[1, 2, 3, 4]);
    });
    assert!(decode(&node, &bytes));

    let reply = single_reply(&node, &root);
    assert_eq!(reply.verb(), Verb::Error);
    assert_eq!(reply.u8_at(IDX_PAYLOAD).unwrap(), Verb::RequestProofOfWork.to_u8());
    assert_eq!(
        ErrorCode::from_u8(reply.u8_at(IDX_PAYLOAD + 9).unwrap()),
        ErrorCode::InvalidRequest
    );
}

#[test]
fn proof_of_work_request_from_non_root_is_ignored() {
    let node = make_node(&[], None);
    let stranger = LocalIdentity::generate();
    add_peer(&node, &stranger);

    let bytes = armored(&stranger, &node, Verb::RequestProofOfWork, |p| {
        p.append_u8(0x01);
        p.append_u8(8);
        p.append_u16(4);
        p.append_bytes(&[1, 2, 3, 4]);
    });
    assert!(decode(&node, &bytes));
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn unknown_verb_is_still_accounted() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    let peer = add_peer(&node, &b);

    let bytes = armored(&b, &node, Verb::Unknown(0x42), |p| p.append_bytes(&[9, 9, 9]));
    assert!(decode(&node, &bytes));

    assert_eq!(peer.last_received(), NOW);
    assert!(node.host.packets.lock().is_empty());
}

#[test]
fn truncated_payload_is_dropped_quietly() {
    let node = make_node(&[], None);
    let b = LocalIdentity::generate();
    let peer = add_peer(&node, &b);

    // FRAME with a header-only payload: network ID read must fail
    let bytes = armored(&b, &node, Verb::Frame, |p| p.append_u32(1));
    assert!(decode(&node, &bytes));

    assert!(node.host.frames.lock().is_empty());
    assert_eq!(peer.last_received(), 0);
}
