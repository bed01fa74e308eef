//! Inbound packet dispatch: peer acquisition, authentication and the verb
//! handlers.

use std::sync::Arc;

use tracing::debug;

use crate::address::{Address, Mac, MulticastGroup};
use crate::cert::CertificateOfMembership;
use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::inet::InetAddress;
use crate::network::{Network, NetworkConfig};
use crate::packet::{
    CipherSuite, ErrorCode, Packet, Verb, IDX_PAYLOAD, IF_MTU, MAX_PACKET_LENGTH,
    MIN_PROTO_VERSION, PROTO_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
};
use crate::peer::{is_address_valid_for_path, Peer};
use crate::pow;
use crate::runtime::{CircuitTestReport, ControllerResult, Event, Runtime};

// Vendor/platform identifiers reported in circuit test reports.
const VENDOR_FILAMENT: u8 = 0x01;
const PLATFORM_UNSPECIFIED: u16 = 0;
const ARCHITECTURE_UNSPECIFIED: u16 = 0;

// Cap on next-hop entries parsed out of a single report.
const CIRCUIT_TEST_MAX_HOP_BREADTH: usize = 8;

enum Outcome {
    Done,
    Deferred,
}

/// One inbound datagram together with the endpoints it arrived between.
///
/// `try_decode` drives the packet through authentication and its verb
/// handler; the packet buffer is mutated in place by dearmor/uncompress and
/// must not be reused afterwards.
pub struct IncomingPacket {
    packet: Packet,
    local: InetAddress,
    remote: InetAddress,
}

impl IncomingPacket {
    /// Wrap raw datagram bytes; fails if shorter than the fixed header.
    pub fn new(
        data: &[u8],
        local: InetAddress,
        remote: InetAddress,
    ) -> Result<Self, ProtocolError> {
        Ok(Self { packet: Packet::from_bytes(data)?, local, remote })
    }

    /// Authenticate, decode and act on this packet.
    ///
    /// Returns true when processing is complete (success or permanent
    /// drop), false when the packet is deferred pending a WHOIS round-trip
    /// and should be replayed by the caller. Never panics or propagates
    /// decode failures: shape and authentication errors become logged
    /// drops.
    pub fn try_decode(&mut self, rt: &Runtime) -> bool {
        let source = self.packet.source();
        match self.decode_inner(rt) {
            Ok(Outcome::Done) => true,
            Ok(Outcome::Deferred) => false,
            Err(e) => {
                debug!(source = %source, remote = %self.remote, error = %e, "dropped packet");
                true
            }
        }
    }

    fn decode_inner(&mut self, rt: &Runtime) -> Result<Outcome, ProtocolError> {
        let Some(cipher) = self.packet.cipher() else {
            debug!(remote = %self.remote, "dropped packet: unknown cipher suite");
            return Ok(Outcome::Done);
        };

        // Clear HELLOs bootstrap the identity cache and carry their own
        // authentication; everything else needs an established peer first.
        if cipher == CipherSuite::NonePoly1305 && self.packet.verb() == Verb::Hello {
            return self.do_hello(rt);
        }

        let source = self.packet.source();
        let Some(peer) = rt.topology.get(source) else {
            rt.sw.request_whois(source);
            return Ok(Outcome::Deferred);
        };

        if !self.packet.dearmor(peer.key()) {
            debug!(peer = %source, remote = %self.remote, "dropped packet: MAC authentication failed");
            return Ok(Outcome::Done);
        }
        if !self.packet.uncompress() {
            debug!(peer = %source, remote = %self.remote, "dropped packet: compressed payload invalid");
            return Ok(Outcome::Done);
        }

        match self.packet.verb() {
            Verb::Hello => self.do_hello(rt),
            Verb::Error => self.do_error(rt, &peer),
            Verb::Ok => self.do_ok(rt, &peer),
            Verb::Whois => self.do_whois(rt, &peer),
            Verb::Rendezvous => self.do_rendezvous(rt, &peer),
            Verb::Frame => self.do_frame(rt, &peer),
            Verb::ExtFrame => self.do_ext_frame(rt, &peer),
            Verb::Echo => self.do_echo(rt, &peer),
            Verb::MulticastLike => self.do_multicast_like(rt, &peer),
            Verb::NetworkMembershipCertificate => self.do_membership_certificates(rt, &peer),
            Verb::NetworkConfigRequest => self.do_network_config_request(rt, &peer),
            Verb::NetworkConfigRefresh => self.do_network_config_refresh(rt, &peer),
            Verb::MulticastGather => self.do_multicast_gather(rt, &peer),
            Verb::MulticastFrame => self.do_multicast_frame(rt, &peer),
            Verb::PushDirectPaths => self.do_push_direct_paths(rt, &peer),
            Verb::CircuitTest => self.do_circuit_test(rt, &peer),
            Verb::CircuitTestReport => self.do_circuit_test_report(rt, &peer),
            Verb::RequestProofOfWork => self.do_request_proof_of_work(rt, &peer),
            v => {
                // Unknown verbs from newer peers still count as received
                self.account(rt, &peer, v, 0, Verb::Nop);
                Ok(Outcome::Done)
            }
        }
    }

    fn account(
        &self,
        rt: &Runtime,
        peer: &Peer,
        verb: Verb,
        in_re_packet_id: u64,
        in_re_verb: Verb,
    ) {
        peer.received(
            rt,
            &self.local,
            &self.remote,
            self.packet.hops(),
            self.packet.packet_id(),
            verb,
            in_re_packet_id,
            in_re_verb,
        );
    }

    fn send_error(
        &self,
        rt: &Runtime,
        peer: &Peer,
        in_re_verb: Verb,
        in_re_packet_id: u64,
        code: ErrorCode,
        payload: &[u8],
    ) {
        let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Error);
        outp.append_u8(in_re_verb.to_u8());
        outp.append_u64(in_re_packet_id);
        outp.append_u8(code.to_u8());
        outp.append_bytes(payload);
        outp.armor(peer.key(), true);
        rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
    }

    fn send_error_need_certificate(&self, rt: &Runtime, peer: &Peer, nwid: u64) {
        self.send_error(
            rt,
            peer,
            self.packet.verb(),
            self.packet.packet_id(),
            ErrorCode::NeedMembershipCertificate,
            &nwid.to_be_bytes(),
        );
    }

    fn do_hello(&mut self, rt: &Runtime) -> Result<Outcome, ProtocolError> {
        // The only verb authenticated here rather than in the dispatcher:
        // HELLO is how identities become known in the first place, so the
        // identity must be read before the MAC can be checked.
        let pid = self.packet.packet_id();
        let from_address = self.packet.source();
        let proto_version = self.packet.u8_at(IDX_PAYLOAD)?;
        let v_major = self.packet.u8_at(IDX_PAYLOAD + 1)?;
        let v_minor = self.packet.u8_at(IDX_PAYLOAD + 2)?;
        let v_revision = self.packet.u16_at(IDX_PAYLOAD + 3)?;
        let timestamp = self.packet.u64_at(IDX_PAYLOAD + 5)?;

        let (id, id_len) = Identity::deserialize(&self.packet, IDX_PAYLOAD + 13)?;
        let mut ptr = IDX_PAYLOAD + 13 + id_len;

        // Older peers omit the reflected address and world trailers
        let mut dest_addr = InetAddress::Nil;
        if ptr < self.packet.len() {
            let (a, consumed) = InetAddress::deserialize(&self.packet, ptr)?;
            dest_addr = a;
            ptr += consumed;
        }
        let mut world_id = 0u64;
        let mut world_timestamp = 0u64;
        if ptr + 16 <= self.packet.len() {
            world_id = self.packet.u64_at(ptr)?;
            world_timestamp = self.packet.u64_at(ptr + 8)?;
        }

        if proto_version < MIN_PROTO_VERSION {
            debug!(peer = %id.address(), remote = %self.remote, "dropped HELLO: protocol version too old");
            return Ok(Outcome::Done);
        }
        if from_address != id.address() {
            debug!(source = %from_address, remote = %self.remote, "dropped HELLO: identity not for sending address");
            return Ok(Outcome::Done);
        }

        let peer = match rt.topology.get(id.address()) {
            Some(existing) => {
                if *existing.identity() != id {
                    // Address collision: answer under the key the claimant
                    // would derive, but never touch the topology
                    match rt.identity.agree(&id) {
                        Ok(key) => {
                            if self.packet.dearmor(&key) {
                                debug!(peer = %id.address(), remote = %self.remote, "rejected HELLO: address already claimed");
                                let mut outp = Packet::new(
                                    id.address(),
                                    rt.identity.address(),
                                    Verb::Error,
                                );
                                outp.append_u8(Verb::Hello.to_u8());
                                outp.append_u64(pid);
                                outp.append_u8(ErrorCode::IdentityCollision.to_u8());
                                outp.armor(&key, true);
                                rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                            } else {
                                debug!(peer = %id.address(), remote = %self.remote, "rejected HELLO: packet failed authentication");
                            }
                        }
                        Err(_) => {
                            debug!(peer = %id.address(), remote = %self.remote, "rejected HELLO: key agreement failed");
                        }
                    }
                    return Ok(Outcome::Done);
                }
                if !self.packet.dearmor(existing.key()) {
                    debug!(peer = %id.address(), remote = %self.remote, "rejected HELLO: packet failed authentication");
                    return Ok(Outcome::Done);
                }
                existing
            }
            None => {
                // New identity: validate its own work binding first, then
                // authenticate the packet under the would-be shared key
                if !id.locally_validate() {
                    debug!(peer = %id.address(), remote = %self.remote, "dropped HELLO: identity invalid");
                    return Ok(Outcome::Done);
                }
                let new_peer = Arc::new(Peer::new(&rt.identity, id.clone())?);
                if !self.packet.dearmor(new_peer.key()) {
                    debug!(peer = %id.address(), remote = %self.remote, "rejected HELLO: packet failed authentication");
                    return Ok(Outcome::Done);
                }
                rt.topology.add(new_peer)
            }
        };

        self.account(rt, &peer, Verb::Hello, 0, Verb::Nop);
        peer.set_remote_version(proto_version, v_major, v_minor, v_revision);

        if !dest_addr.is_nil() {
            rt.sa.iam(
                peer.address(),
                &self.remote,
                &dest_addr,
                rt.topology.is_root(peer.identity()),
                rt.host.now(),
            );
        }

        if world_id != 0 && world_id == rt.topology.world_id() {
            let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
            outp.append_u8(Verb::Hello.to_u8());
            outp.append_u64(pid);
            outp.append_u64(timestamp);
            outp.append_u8(PROTO_VERSION);
            outp.append_u8(VERSION_MAJOR);
            outp.append_u8(VERSION_MINOR);
            outp.append_u16(VERSION_REVISION);
            self.remote.serialize(&mut outp);

            if rt.topology.world_timestamp() > world_timestamp {
                let size_at = outp.len();
                outp.append_u16(0);
                rt.topology.world().serialize(&mut outp);
                let trailer_len = (outp.len() - size_at) as u16;
                outp.set_u16_at(size_at, trailer_len)?;
            } else {
                outp.append_u16(0); // same world, no update needed
            }

            outp.armor(peer.key(), true);
            rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
        } else {
            debug!(peer = %peer.address(), theirs = world_id, ours = rt.topology.world_id(), "no OK(HELLO): world ID mismatch");
        }
        Ok(Outcome::Done)
    }

    fn do_error(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let in_re_verb = Verb::from_u8(self.packet.u8_at(IDX_PAYLOAD)?);
        let in_re_packet_id = self.packet.u64_at(IDX_PAYLOAD + 1)?;
        let code = ErrorCode::from_u8(self.packet.u8_at(IDX_PAYLOAD + 9)?);
        let err_payload = IDX_PAYLOAD + 10;

        match code {
            ErrorCode::ObjNotFound => {
                if in_re_verb == Verb::Whois {
                    if rt.topology.is_root(peer.identity()) {
                        rt.sw.cancel_whois(Address::read_from(&self.packet, err_payload)?);
                    }
                } else if in_re_verb == Verb::NetworkConfigRequest {
                    if let Some(network) = rt.networks.get(self.packet.u64_at(err_payload)?) {
                        if network.controller() == peer.address() {
                            network.set_not_found();
                        }
                    }
                }
            }

            ErrorCode::UnsupportedOperation => {
                if in_re_verb == Verb::NetworkConfigRequest {
                    if let Some(network) = rt.networks.get(self.packet.u64_at(err_payload)?) {
                        if network.controller() == peer.address() {
                            network.set_not_found();
                        }
                    }
                }
            }

            ErrorCode::IdentityCollision => {
                // Only a root is trusted to declare our address taken
                if rt.topology.is_root(peer.identity()) {
                    rt.host.post_event(Event::FatalIdentityCollision);
                }
            }

            ErrorCode::NeedMembershipCertificate => {
                // Certificates are public; push ours if it is current
                let nwid = self.packet.u64_at(err_payload)?;
                if let Some(network) = rt.networks.get(nwid) {
                    if let Some(com) = network.config().and_then(|c| c.com) {
                        let mut outp = Packet::new(
                            peer.address(),
                            rt.identity.address(),
                            Verb::NetworkMembershipCertificate,
                        );
                        com.serialize(&mut outp);
                        outp.armor(peer.key(), true);
                        rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                    }
                }
            }

            ErrorCode::NetworkAccessDenied => {
                if let Some(network) = rt.networks.get(self.packet.u64_at(err_payload)?) {
                    if network.controller() == peer.address() {
                        network.set_access_denied();
                    }
                }
            }

            ErrorCode::UnwantedMulticast => {
                let nwid = self.packet.u64_at(err_payload)?;
                let mac = Mac::read_from(&self.packet, err_payload + 8)?;
                let adi = self.packet.u32_at(err_payload + 14)?;
                rt.mc.remove(nwid, MulticastGroup::new(mac, adi), peer.address());
            }

            _ => {}
        }

        self.account(rt, peer, Verb::Error, in_re_packet_id, in_re_verb);
        Ok(Outcome::Done)
    }

    fn do_ok(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let in_re_verb = Verb::from_u8(self.packet.u8_at(IDX_PAYLOAD)?);
        let in_re_packet_id = self.packet.u64_at(IDX_PAYLOAD + 1)?;
        let ok_payload = IDX_PAYLOAD + 9;

        match in_re_verb {
            Verb::Hello => {
                let echoed = self.packet.u64_at(ok_payload)?;
                let v_proto = self.packet.u8_at(ok_payload + 8)?;
                let v_major = self.packet.u8_at(ok_payload + 9)?;
                let v_minor = self.packet.u8_at(ok_payload + 10)?;
                let v_revision = self.packet.u16_at(ok_payload + 11)?;

                let mut dest_addr = InetAddress::Nil;
                if ok_payload + 13 < self.packet.len() {
                    let (a, _) = InetAddress::deserialize(&self.packet, ok_payload + 13)?;
                    dest_addr = a;
                }

                if v_proto < MIN_PROTO_VERSION {
                    debug!(peer = %peer.address(), "dropped OK(HELLO): protocol version too old");
                    return Ok(Outcome::Done);
                }

                let now = rt.host.now();
                let latency = now.saturating_sub(echoed).min(0xffff) as u16;
                peer.add_direct_latency_measurement(latency);
                peer.set_remote_version(v_proto, v_major, v_minor, v_revision);

                if !dest_addr.is_nil() {
                    let trusted = rt.topology.is_root(peer.identity());
                    rt.sa.iam(peer.address(), &self.remote, &dest_addr, trusted, now);
                }
            }

            Verb::Whois => {
                // Only roots may answer WHOIS, else identity poisoning
                if rt.topology.is_root(peer.identity()) {
                    let (id, _) = Identity::deserialize(&self.packet, ok_payload)?;
                    if id.locally_validate() {
                        let stored = rt.topology.add(Arc::new(Peer::new(&rt.identity, id)?));
                        rt.sw.do_anything_waiting_for_peer(&stored);
                    }
                }
            }

            Verb::NetworkConfigRequest => {
                let nwid = self.packet.u64_at(ok_payload)?;
                if let Some(network) = rt.networks.get(nwid) {
                    if network.controller() == peer.address() {
                        let dict_len = self.packet.u16_at(ok_payload + 8)? as usize;
                        let dict = self.packet.bytes_at(ok_payload + 10, dict_len)?;
                        if !dict.is_empty() {
                            if let Ok(config) = NetworkConfig::from_bytes(dict) {
                                network.set_configuration(config);
                                debug!(nwid = %format_args!("{:016x}", nwid), peer = %peer.address(), "got network configuration");
                            }
                        }
                    }
                }
            }

            Verb::MulticastGather => {
                let nwid = self.packet.u64_at(ok_payload)?;
                let mac = Mac::read_from(&self.packet, ok_payload + 8)?;
                let adi = self.packet.u32_at(ok_payload + 14)?;
                let group = MulticastGroup::new(mac, adi);
                let total = self.packet.u32_at(ok_payload + 18)?;
                let count = self.packet.u16_at(ok_payload + 22)? as usize;
                let mut members = Vec::with_capacity(count);
                for i in 0..count {
                    members.push(Address::read_from(&self.packet, ok_payload + 24 + i * Address::LEN)?);
                }
                rt.mc.add_multiple(rt.host.now(), nwid, group, &members, total);
            }

            Verb::MulticastFrame => {
                let nwid = self.packet.u64_at(ok_payload)?;
                let mac = Mac::read_from(&self.packet, ok_payload + 8)?;
                let adi = self.packet.u32_at(ok_payload + 14)?;
                let group = MulticastGroup::new(mac, adi);
                let flags = self.packet.u8_at(ok_payload + 18)?;
                let mut ptr = ok_payload + 19;

                if flags & 0x01 != 0 {
                    let (com, consumed) =
                        CertificateOfMembership::deserialize(&self.packet, ptr)?;
                    ptr += consumed;
                    peer.validate_and_set_com(rt, nwid, com);
                }
                if flags & 0x02 != 0 {
                    let total = self.packet.u32_at(ptr)?;
                    let count = self.packet.u16_at(ptr + 4)? as usize;
                    let mut members = Vec::with_capacity(count);
                    for i in 0..count {
                        members.push(Address::read_from(&self.packet, ptr + 6 + i * Address::LEN)?);
                    }
                    rt.mc.add_multiple(rt.host.now(), nwid, group, &members, total);
                }
            }

            _ => {}
        }

        self.account(rt, peer, Verb::Ok, in_re_packet_id, in_re_verb);
        Ok(Outcome::Done)
    }

    fn do_whois(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        if self.packet.payload_len() == Address::LEN {
            let target = Address::read_from(&self.packet, IDX_PAYLOAD)?;
            match rt.topology.get(target) {
                Some(queried) => {
                    let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
                    outp.append_u8(Verb::Whois.to_u8());
                    outp.append_u64(self.packet.packet_id());
                    queried.identity().serialize(&mut outp);
                    outp.armor(peer.key(), true);
                    rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                }
                None => {
                    self.send_error(
                        rt,
                        peer,
                        Verb::Whois,
                        self.packet.packet_id(),
                        ErrorCode::ObjNotFound,
                        &target.to_bytes(),
                    );
                }
            }
        } else {
            debug!(peer = %peer.address(), remote = %self.remote, "dropped WHOIS: missing or invalid address");
        }
        self.account(rt, peer, Verb::Whois, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_rendezvous(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let with = Address::read_from(&self.packet, IDX_PAYLOAD)?;
        match rt.topology.get(with) {
            Some(with_peer) => {
                let port = self.packet.u16_at(IDX_PAYLOAD + 5)?;
                let addr_len = self.packet.u8_at(IDX_PAYLOAD + 7)? as usize;
                if port > 0 && (addr_len == 4 || addr_len == 16) {
                    let b = self.packet.bytes_at(IDX_PAYLOAD + 8, addr_len)?;
                    let at_addr = if addr_len == 4 {
                        InetAddress::v4([b[0], b[1], b[2], b[3]], port)
                    } else {
                        let mut o = [0u8; 16];
                        o.copy_from_slice(b);
                        InetAddress::v6(o, port)
                    };
                    debug!(peer = %peer.address(), with = %with, at = %at_addr, "RENDEZVOUS: starting NAT traversal");
                    self.account(rt, peer, Verb::Rendezvous, 0, Verb::Nop);
                    rt.sw.rendezvous(&with_peer, &self.local, &at_addr);
                } else {
                    debug!(peer = %peer.address(), remote = %self.remote, "dropped corrupt RENDEZVOUS (bad address or port)");
                }
            }
            None => {
                debug!(peer = %peer.address(), with = %with, "ignored RENDEZVOUS to meet an unknown peer");
            }
        }
        Ok(Outcome::Done)
    }

    fn do_frame(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let nwid = self.packet.u64_at(IDX_PAYLOAD)?;
        match rt.networks.get(nwid) {
            Some(network) => {
                if self.packet.len() > IDX_PAYLOAD + 10 {
                    if !network.is_allowed(peer) {
                        debug!(peer = %peer.address(), nwid = %format_args!("{:016x}", nwid), "dropped FRAME: not a member of private network");
                        self.send_error_need_certificate(rt, peer, nwid);
                        return Ok(Outcome::Done);
                    }

                    let ether_type = self.packet.u16_at(IDX_PAYLOAD + 8)?;
                    if !network.config().is_some_and(|c| c.permits_ether_type(ether_type)) {
                        debug!(peer = %peer.address(), ether_type = %format_args!("{:04x}", ether_type), "dropped FRAME: ethertype not allowed");
                        return Ok(Outcome::Done);
                    }

                    let payload_len = self.packet.len() - (IDX_PAYLOAD + 10);
                    let payload = self.packet.bytes_at(IDX_PAYLOAD + 10, payload_len)?;
                    rt.host.put_frame(
                        nwid,
                        Mac::from_address(peer.address(), nwid),
                        network.mac(),
                        ether_type,
                        0,
                        payload,
                    );
                }
                self.account(rt, peer, Verb::Frame, 0, Verb::Nop);
            }
            None => {
                debug!(peer = %peer.address(), nwid = %format_args!("{:016x}", nwid), "dropped FRAME: not connected to network");
            }
        }
        Ok(Outcome::Done)
    }

    fn do_ext_frame(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let nwid = self.packet.u64_at(IDX_PAYLOAD)?;
        let Some(network) = rt.networks.get(nwid) else {
            debug!(peer = %peer.address(), nwid = %format_args!("{:016x}", nwid), "dropped EXT_FRAME: not connected to network");
            return Ok(Outcome::Done);
        };

        let flags = self.packet.u8_at(IDX_PAYLOAD + 8)?;
        let mut ptr = IDX_PAYLOAD + 9;

        let mut com_failed = false;
        if flags & 0x01 != 0 {
            let (com, consumed) = CertificateOfMembership::deserialize(&self.packet, ptr)?;
            ptr += consumed;
            if !peer.validate_and_set_com(rt, nwid, com) {
                com_failed = true;
            }
        }

        if com_failed || !network.is_allowed(peer) {
            debug!(peer = %peer.address(), nwid = %format_args!("{:016x}", nwid), "dropped EXT_FRAME: not a member of private network");
            self.send_error_need_certificate(rt, peer, nwid);
            return Ok(Outcome::Done);
        }

        let ether_type = self.packet.u16_at(ptr)?;
        ptr += 2;
        if !network.config().is_some_and(|c| c.permits_ether_type(ether_type)) {
            debug!(peer = %peer.address(), ether_type = %format_args!("{:04x}", ether_type), "dropped EXT_FRAME: ethertype not allowed");
            return Ok(Outcome::Done);
        }

        let to = Mac::read_from(&self.packet, ptr)?;
        ptr += Mac::LEN;
        let from = Mac::read_from(&self.packet, ptr)?;
        ptr += Mac::LEN;

        if to.is_multicast() {
            debug!(peer = %peer.address(), to = %to, "dropped EXT_FRAME: destination is multicast, must use MULTICAST_FRAME");
            return Ok(Outcome::Done);
        }
        if from.is_nil() || from.is_multicast() || from == network.mac() {
            debug!(peer = %peer.address(), from = %from, "dropped EXT_FRAME: invalid source MAC");
            return Ok(Outcome::Done);
        }

        if from != Mac::from_address(peer.address(), nwid) {
            if network.permits_bridging(peer.address()) {
                network.learn_bridge_route(from, peer.address());
            } else {
                debug!(peer = %peer.address(), from = %from, "dropped EXT_FRAME: sender not allowed to bridge");
                return Ok(Outcome::Done);
            }
        } else if to != network.mac() && !network.permits_bridging(rt.identity.address()) {
            debug!(peer = %peer.address(), to = %to, "dropped EXT_FRAME: we may not bridge on this network");
            return Ok(Outcome::Done);
        }

        if ptr < self.packet.len() {
            let payload_len = self.packet.len() - ptr;
            let payload = self.packet.bytes_at(ptr, payload_len)?;
            rt.host.put_frame(nwid, from, to, ether_type, 0, payload);
        }
        self.account(rt, peer, Verb::ExtFrame, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_echo(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let pid = self.packet.packet_id();
        let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
        outp.append_u8(Verb::Echo.to_u8());
        outp.append_u64(pid);
        outp.append_bytes(self.packet.bytes_at(IDX_PAYLOAD, self.packet.payload_len())?);
        outp.armor(peer.key(), true);
        rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
        self.account(rt, peer, Verb::Echo, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_multicast_like(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let now = rt.host.now();
        // 18-byte (network, MAC, ADI) tuples to the end of the payload
        let mut ptr = IDX_PAYLOAD;
        while ptr < self.packet.len() {
            let nwid = self.packet.u64_at(ptr)?;
            let mac = Mac::read_from(&self.packet, ptr + 8)?;
            let adi = self.packet.u32_at(ptr + 14)?;
            rt.mc.add(now, nwid, MulticastGroup::new(mac, adi), peer.address());
            ptr += 18;
        }
        self.account(rt, peer, Verb::MulticastLike, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_membership_certificates(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let mut ptr = IDX_PAYLOAD;
        while ptr < self.packet.len() {
            let (com, consumed) = CertificateOfMembership::deserialize(&self.packet, ptr)?;
            ptr += consumed;
            let nwid = com.network_id;
            peer.validate_and_set_com(rt, nwid, com);
        }
        self.account(rt, peer, Verb::NetworkMembershipCertificate, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_network_config_request(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let nwid = self.packet.u64_at(IDX_PAYLOAD)?;
        let meta_len = self.packet.u16_at(IDX_PAYLOAD + 8)? as usize;
        let meta = self.packet.bytes_at(IDX_PAYLOAD + 10, meta_len)?.to_vec();

        let hops = self.packet.hops();
        let pid = self.packet.packet_id();
        self.account(rt, peer, Verb::NetworkConfigRequest, 0, Verb::Nop);

        let Some(controller) = rt.local_network_controller.as_ref() else {
            self.send_error(
                rt,
                peer,
                Verb::NetworkConfigRequest,
                pid,
                ErrorCode::UnsupportedOperation,
                &nwid.to_be_bytes(),
            );
            return Ok(Outcome::Done);
        };

        // A relayed request's physical origin is not the requester's
        let from = if hops > 0 { None } else { Some(self.remote) };
        match controller.do_request(from, rt.identity.identity(), peer.identity(), nwid, &meta) {
            ControllerResult::Ok(dict) => {
                if dict.len() > 0xffff {
                    debug!(nwid = %format_args!("{:016x}", nwid), size = dict.len(), "network config reply too large for length field");
                } else {
                    let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
                    outp.append_u8(Verb::NetworkConfigRequest.to_u8());
                    outp.append_u64(pid);
                    outp.append_u64(nwid);
                    outp.append_u16(dict.len() as u16);
                    outp.append_bytes(&dict);
                    outp.compress();
                    outp.armor(peer.key(), true);
                    if outp.len() > MAX_PACKET_LENGTH {
                        debug!(nwid = %format_args!("{:016x}", nwid), size = outp.len(), "network config reply exceeds max packet length");
                    } else {
                        rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                    }
                }
            }
            ControllerResult::NotFound => {
                self.send_error(
                    rt,
                    peer,
                    Verb::NetworkConfigRequest,
                    pid,
                    ErrorCode::ObjNotFound,
                    &nwid.to_be_bytes(),
                );
            }
            ControllerResult::AccessDenied => {
                self.send_error(
                    rt,
                    peer,
                    Verb::NetworkConfigRequest,
                    pid,
                    ErrorCode::NetworkAccessDenied,
                    &nwid.to_be_bytes(),
                );
            }
            ControllerResult::InternalError => {
                debug!(nwid = %format_args!("{:016x}", nwid), "network config request failed: controller internal error");
            }
            ControllerResult::Ignore => {}
        }
        Ok(Outcome::Done)
    }

    fn do_network_config_refresh(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let mut ptr = IDX_PAYLOAD;
        while ptr + 8 <= self.packet.len() {
            let nwid = self.packet.u64_at(ptr)?;
            if let Some(network) = rt.networks.get(nwid) {
                // Only the controller itself may force a refresh
                if peer.address() == network.controller() {
                    network.request_configuration(rt);
                }
            }
            ptr += 8;
        }
        self.account(rt, peer, Verb::NetworkConfigRefresh, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_multicast_gather(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let nwid = self.packet.u64_at(IDX_PAYLOAD)?;
        let mac = Mac::read_from(&self.packet, IDX_PAYLOAD + 8)?;
        let adi = self.packet.u32_at(IDX_PAYLOAD + 14)?;
        let group = MulticastGroup::new(mac, adi);
        let gather_limit = self.packet.u32_at(IDX_PAYLOAD + 18)?;

        if gather_limit > 0 {
            let (total, members) =
                rt.mc.gather(peer.address(), nwid, group, gather_limit, rt.host.now());
            if !members.is_empty() {
                let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
                outp.append_u8(Verb::MulticastGather.to_u8());
                outp.append_u64(self.packet.packet_id());
                outp.append_u64(nwid);
                group.mac.append_to(&mut outp);
                outp.append_u32(group.adi);
                outp.append_u32(total);
                outp.append_u16(members.len() as u16);
                for m in &members {
                    m.append_to(&mut outp);
                }
                outp.armor(peer.key(), true);
                rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
            }
        }

        self.account(rt, peer, Verb::MulticastGather, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_multicast_frame(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let nwid = self.packet.u64_at(IDX_PAYLOAD)?;
        let flags = self.packet.u8_at(IDX_PAYLOAD + 8)?;

        if let Some(network) = rt.networks.get(nwid) {
            // Optional fields shift everything after them
            let mut ptr = IDX_PAYLOAD + 9;

            if flags & 0x01 != 0 {
                let (com, consumed) = CertificateOfMembership::deserialize(&self.packet, ptr)?;
                ptr += consumed;
                // The included certificate may be the one that admits them
                peer.validate_and_set_com(rt, nwid, com);
            }

            if !network.is_allowed(peer) {
                debug!(peer = %peer.address(), nwid = %format_args!("{:016x}", nwid), "dropped MULTICAST_FRAME: not a member of private network");
                self.send_error_need_certificate(rt, peer, nwid);
                return Ok(Outcome::Done);
            }

            let mut gather_limit = 0u32;
            if flags & 0x02 != 0 {
                gather_limit = self.packet.u32_at(ptr)?;
                ptr += 4;
            }

            let from = if flags & 0x04 != 0 {
                let m = Mac::read_from(&self.packet, ptr)?;
                ptr += Mac::LEN;
                m
            } else {
                Mac::from_address(peer.address(), nwid)
            };

            let dest_mac = Mac::read_from(&self.packet, ptr)?;
            ptr += Mac::LEN;
            let dest_adi = self.packet.u32_at(ptr)?;
            ptr += 4;
            let to = MulticastGroup::new(dest_mac, dest_adi);
            let ether_type = self.packet.u16_at(ptr)?;
            ptr += 2;
            let payload_len = self.packet.len().saturating_sub(ptr);

            if payload_len > 0 && payload_len <= IF_MTU {
                if !to.mac.is_multicast() {
                    debug!(peer = %peer.address(), to = %to.mac, "dropped MULTICAST_FRAME: destination is unicast, must use FRAME or EXT_FRAME");
                    return Ok(Outcome::Done);
                }
                if from.is_nil() || from.is_multicast() || from == network.mac() {
                    debug!(peer = %peer.address(), from = %from, "dropped MULTICAST_FRAME: invalid source MAC");
                    return Ok(Outcome::Done);
                }
                if from != Mac::from_address(peer.address(), nwid) {
                    if network.permits_bridging(peer.address()) {
                        network.learn_bridge_route(from, peer.address());
                    } else {
                        debug!(peer = %peer.address(), from = %from, "dropped MULTICAST_FRAME: sender not allowed to bridge");
                        return Ok(Outcome::Done);
                    }
                }

                let payload = self.packet.bytes_at(ptr, payload_len)?;
                rt.host.put_frame(nwid, from, to.mac, ether_type, 0, payload);
            }

            if gather_limit > 0 {
                let (total, members) =
                    rt.mc.gather(peer.address(), nwid, to, gather_limit, rt.host.now());
                if !members.is_empty() {
                    let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
                    outp.append_u8(Verb::MulticastFrame.to_u8());
                    outp.append_u64(self.packet.packet_id());
                    outp.append_u64(nwid);
                    to.mac.append_to(&mut outp);
                    outp.append_u32(to.adi);
                    outp.append_u8(0x02); // contains gather results
                    outp.append_u32(total);
                    outp.append_u16(members.len() as u16);
                    for m in &members {
                        m.append_to(&mut outp);
                    }
                    outp.armor(peer.key(), true);
                    rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                }
            }
        }

        self.account(rt, peer, Verb::MulticastFrame, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_push_direct_paths(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let count = self.packet.u16_at(IDX_PAYLOAD)?;
        let mut ptr = IDX_PAYLOAD + 2;
        let now = rt.host.now();

        for _ in 0..count {
            let flags = self.packet.u8_at(ptr)?;
            ptr += 1;
            let ext_len = self.packet.u16_at(ptr)? as usize;
            ptr += 2 + ext_len; // extension field is currently unused
            let addr_type = self.packet.u8_at(ptr)?;
            ptr += 1;
            let addr_len = self.packet.u8_at(ptr)? as usize;
            ptr += 1;

            match addr_type {
                4 => {
                    let b = self.packet.bytes_at(ptr, 4)?;
                    let a = InetAddress::v4([b[0], b[1], b[2], b[3]], self.packet.u16_at(ptr + 4)?);
                    if flags & 0x01 == 0 && is_address_valid_for_path(&a) {
                        debug!(peer = %peer.address(), at = %a, "attempting to contact at pushed direct path");
                        peer.attempt_to_contact_at(rt, &self.local, &a, now);
                    }
                }
                6 => {
                    let b = self.packet.bytes_at(ptr, 16)?;
                    let mut o = [0u8; 16];
                    o.copy_from_slice(b);
                    let a = InetAddress::v6(o, self.packet.u16_at(ptr + 16)?);
                    if flags & 0x01 == 0 && is_address_valid_for_path(&a) {
                        debug!(peer = %peer.address(), at = %a, "attempting to contact at pushed direct path");
                        peer.attempt_to_contact_at(rt, &self.local, &a, now);
                    }
                }
                _ => {}
            }
            ptr += addr_len;
        }

        self.account(rt, peer, Verb::PushDirectPaths, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_circuit_test(&mut self, rt: &Runtime, peer: &Arc<Peer>) -> Result<Outcome, ProtocolError> {
        let originator_address = Address::read_from(&self.packet, IDX_PAYLOAD)?;
        let Some(originator) = rt.topology.get(originator_address) else {
            rt.sw.request_whois(originator_address);
            return Ok(Outcome::Deferred);
        };

        let flags = self.packet.u16_at(IDX_PAYLOAD + 5)?;
        let timestamp = self.packet.u64_at(IDX_PAYLOAD + 7)?;
        let test_id = self.packet.u64_at(IDX_PAYLOAD + 15)?;

        // Running total of variable-length field bytes; every later offset
        // is relative to it
        let originator_credential_len = self.packet.u16_at(IDX_PAYLOAD + 23)? as usize;
        let mut vlf = originator_credential_len;
        let mut originator_credential_network_id = 0u64;
        if originator_credential_len >= 1
            && self.packet.u8_at(IDX_PAYLOAD + 25)? == 0x01
            && originator_credential_len >= 9
        {
            originator_credential_network_id = self.packet.u64_at(IDX_PAYLOAD + 26)?;
        }

        vlf += self.packet.u16_at(IDX_PAYLOAD + 25 + vlf)? as usize; // additional fields

        // Only tests signed by their originators are forwarded or answered
        let signature_len = self.packet.u16_at(IDX_PAYLOAD + 27 + vlf)? as usize;
        let signed = self.packet.bytes_at(IDX_PAYLOAD, 27 + vlf)?;
        let signature = self.packet.bytes_at(IDX_PAYLOAD + 29 + vlf, signature_len)?;
        if !originator.identity().verify(signed, signature) {
            debug!(originator = %originator_address, remote = %self.remote, "dropped CIRCUIT_TEST: originator signature invalid");
            return Ok(Outcome::Done);
        }
        vlf += signature_len;

        // Everything up to here travels to next hops verbatim
        let signed_portion_len = 29 + vlf;

        let previous_hop_credential_len = self.packet.u16_at(IDX_PAYLOAD + 29 + vlf)? as usize;
        let mut previous_hop_com: Option<CertificateOfMembership> = None;
        if previous_hop_credential_len >= 1 && self.packet.u8_at(IDX_PAYLOAD + 31 + vlf)? == 0x01 {
            let (com, consumed) =
                CertificateOfMembership::deserialize(&self.packet, IDX_PAYLOAD + 32 + vlf)?;
            if consumed != previous_hop_credential_len - 1 {
                debug!(originator = %originator_address, "dropped CIRCUIT_TEST: previous hop credential invalid");
                return Ok(Outcome::Done);
            }
            previous_hop_com = Some(com);
        }
        vlf += previous_hop_credential_len;

        let mut originator_network_config: Option<NetworkConfig> = None;
        if originator_credential_network_id != 0 {
            if Network::controller_for(originator_credential_network_id) != originator_address {
                debug!(originator = %originator_address, nwid = %format_args!("{:016x}", originator_credential_network_id), "dropped CIRCUIT_TEST: originator is not the network's controller");
                return Ok(Outcome::Done);
            }
            let config = rt
                .networks
                .get(originator_credential_network_id)
                .and_then(|nw| nw.config());
            let Some(config) = config else {
                debug!(originator = %originator_address, nwid = %format_args!("{:016x}", originator_credential_network_id), "dropped CIRCUIT_TEST: we are not a member of the credential network");
                return Ok(Outcome::Done);
            };
            let credentialed = config.public
                || peer.address() == originator_address
                || config
                    .com
                    .as_ref()
                    .zip(previous_hop_com.as_ref())
                    .is_some_and(|(ours, prev)| ours.agrees_with(prev));
            if !credentialed {
                debug!(originator = %originator_address, hop = %peer.address(), "dropped CIRCUIT_TEST: previous hop did not supply a valid credential");
                return Ok(Outcome::Done);
            }
            originator_network_config = Some(config);
        } else {
            debug!(originator = %originator_address, "dropped CIRCUIT_TEST: originator did not specify a credential");
            return Ok(Outcome::Done);
        }

        let now = rt.host.now();

        let mut breadth = 0usize;
        let mut next_hops: Vec<(Address, InetAddress)> = Vec::new();
        let mut remaining_hops_ptr = IDX_PAYLOAD + 33 + vlf;
        if IDX_PAYLOAD + 31 + vlf < self.packet.len() {
            // byte at +31+vlf holds next-hop flags, currently unused
            breadth = self.packet.u8_at(IDX_PAYLOAD + 32 + vlf)? as usize;
            for _ in 0..breadth {
                let hop = Address::read_from(&self.packet, remaining_hops_ptr)?;
                remaining_hops_ptr += Address::LEN;
                let best = rt
                    .topology
                    .get(hop)
                    .and_then(|p| p.get_best_path(now))
                    .unwrap_or(InetAddress::Nil);
                next_hops.push((hop, best));
            }
        }

        // Report back per the originator's flags, or unconditionally when
        // we are a terminal hop asked to report only then
        if (flags & 0x01 != 0) || (breadth == 0 && (flags & 0x02 != 0)) {
            let mut outp =
                Packet::new(originator_address, rt.identity.address(), Verb::CircuitTestReport);
            outp.append_u64(timestamp);
            outp.append_u64(test_id);
            outp.append_u64(now);
            outp.append_u8(VENDOR_FILAMENT);
            outp.append_u8(PROTO_VERSION);
            outp.append_u8(VERSION_MAJOR);
            outp.append_u8(VERSION_MINOR);
            outp.append_u16(VERSION_REVISION);
            outp.append_u16(PLATFORM_UNSPECIFIED);
            outp.append_u16(ARCHITECTURE_UNSPECIFIED);
            outp.append_u16(0); // error code, currently unused
            outp.append_u64(0); // flags, currently unused
            outp.append_u64(self.packet.packet_id());
            peer.address().append_to(&mut outp);
            outp.append_u8(self.packet.hops());
            self.local.serialize(&mut outp);
            self.remote.serialize(&mut outp);
            outp.append_u16(0); // no additional fields
            outp.append_u8(breadth as u8);
            for (hop, best) in &next_hops {
                hop.append_to(&mut outp);
                best.serialize(&mut outp);
            }
            rt.sw.send(outp, true, 0);
        }

        // Forward one level deeper: the signed portion travels untouched,
        // our own credential replaces the previous hop's, and the
        // already-consumed hop list is stripped so the next hop sees only
        // the levels below it
        if breadth > 0 {
            let mut outp =
                Packet::new(Address::from_u64(0), rt.identity.address(), Verb::CircuitTest);
            outp.append_bytes(self.packet.bytes_at(IDX_PAYLOAD, signed_portion_len)?);
            let previous_hop_credential_pos = outp.len();
            outp.append_u16(0); // no previous hop credential: default
            if let Some(config) = &originator_network_config {
                if !config.public {
                    if let Some(com) = &config.com {
                        outp.append_u8(0x01);
                        com.serialize(&mut outp);
                        let credential_len = (outp.len() - previous_hop_credential_pos - 2) as u16;
                        outp.set_u16_at(previous_hop_credential_pos, credential_len)?;
                    }
                }
            }
            if remaining_hops_ptr < self.packet.len() {
                let rest = self.packet.len() - remaining_hops_ptr;
                outp.append_bytes(self.packet.bytes_at(remaining_hops_ptr, rest)?);
            }

            for (hop, _) in &next_hops {
                // Next hops looping back to this hop are not valid
                if *hop != rt.identity.address() {
                    let mut fwd = outp.clone();
                    fwd.new_packet_id();
                    fwd.set_destination(*hop);
                    rt.sw.send(fwd, true, originator_credential_network_id);
                }
            }
        }

        self.account(rt, peer, Verb::CircuitTest, 0, Verb::Nop);
        Ok(Outcome::Done)
    }

    fn do_circuit_test_report(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        let (local_ep, local_len) = InetAddress::deserialize(&self.packet, IDX_PAYLOAD + 58)?;
        let (remote_ep, remote_len) =
            InetAddress::deserialize(&self.packet, IDX_PAYLOAD + 58 + local_len)?;

        let mut ptr = IDX_PAYLOAD + 58 + local_len + remote_len;
        ptr += self.packet.u16_at(ptr)? as usize + 2; // skip additional fields

        let mut next_hop_count = self.packet.u8_at(ptr)? as usize;
        ptr += 1;
        next_hop_count = next_hop_count.min(CIRCUIT_TEST_MAX_HOP_BREADTH);
        let mut next_hops = Vec::with_capacity(next_hop_count);
        for _ in 0..next_hop_count {
            let hop = Address::read_from(&self.packet, ptr)?;
            ptr += Address::LEN;
            let (ep, consumed) = InetAddress::deserialize(&self.packet, ptr)?;
            ptr += consumed;
            next_hops.push((hop, ep));
        }

        let report = CircuitTestReport {
            current: peer.address(),
            upstream: Address::read_from(&self.packet, IDX_PAYLOAD + 52)?,
            test_id: self.packet.u64_at(IDX_PAYLOAD + 8)?,
            timestamp: self.packet.u64_at(IDX_PAYLOAD)?,
            remote_timestamp: self.packet.u64_at(IDX_PAYLOAD + 16)?,
            source_packet_id: self.packet.u64_at(IDX_PAYLOAD + 44)?,
            flags: self.packet.u64_at(IDX_PAYLOAD + 36)?,
            source_packet_hop_count: self.packet.u8_at(IDX_PAYLOAD + 57)?,
            error_code: self.packet.u16_at(IDX_PAYLOAD + 34)?,
            vendor: self.packet.u8_at(IDX_PAYLOAD + 24)?,
            protocol_version: self.packet.u8_at(IDX_PAYLOAD + 25)?,
            major_version: self.packet.u8_at(IDX_PAYLOAD + 26)?,
            minor_version: self.packet.u8_at(IDX_PAYLOAD + 27)?,
            revision: self.packet.u16_at(IDX_PAYLOAD + 28)?,
            platform: self.packet.u16_at(IDX_PAYLOAD + 30)?,
            architecture: self.packet.u16_at(IDX_PAYLOAD + 32)?,
            received_on_local_address: local_ep,
            received_from_remote_address: remote_ep,
            next_hops,
        };

        rt.host.post_circuit_test_report(&report);
        Ok(Outcome::Done)
    }

    fn do_request_proof_of_work(
        &mut self,
        rt: &Runtime,
        peer: &Arc<Peer>,
    ) -> Result<Outcome, ProtocolError> {
        // Only roots may burn our CPU
        if !rt.topology.is_root(peer.identity()) {
            debug!(peer = %peer.address(), remote = %self.remote, "dropped REQUEST_PROOF_OF_WORK: not trusted enough");
            return Ok(Outcome::Done);
        }

        let pid = self.packet.packet_id();
        let pow_type = self.packet.u8_at(IDX_PAYLOAD)?;
        let difficulty = self.packet.u8_at(IDX_PAYLOAD + 1)?;
        let challenge_len = self.packet.u16_at(IDX_PAYLOAD + 2)? as usize;
        if challenge_len > MAX_PACKET_LENGTH {
            return Ok(Outcome::Done);
        }
        let challenge = self.packet.bytes_at(IDX_PAYLOAD + 4, challenge_len)?.to_vec();

        match pow_type {
            0x01 => {
                if difficulty <= pow::POW_MAX_SERVED_DIFFICULTY {
                    let result = pow::compute(u32::from(difficulty), &challenge);
                    let mut outp = Packet::new(peer.address(), rt.identity.address(), Verb::Ok);
                    outp.append_u8(Verb::RequestProofOfWork.to_u8());
                    outp.append_u64(pid);
                    outp.append_u16(result.len() as u16);
                    outp.append_bytes(&result);
                    outp.armor(peer.key(), true);
                    rt.host.put_packet(&self.local, &self.remote, outp.as_bytes());
                } else {
                    self.send_error(
                        rt,
                        peer,
                        Verb::RequestProofOfWork,
                        pid,
                        ErrorCode::InvalidRequest,
                        &[],
                    );
                }
            }
            _ => {
                debug!(peer = %peer.address(), pow_type, "dropped REQUEST_PROOF_OF_WORK: unrecognized proof of work type");
            }
        }

        self.account(rt, peer, Verb::RequestProofOfWork, 0, Verb::Nop);
        Ok(Outcome::Done)
    }
}

/// Build an outbound HELLO announcing our identity and world to
/// `destination`, reflecting `their_external` back to them.
pub(crate) fn build_hello(
    rt: &Runtime,
    destination: Address,
    their_external: &InetAddress,
) -> Packet {
    let mut outp = Packet::new(destination, rt.identity.address(), Verb::Hello);
    outp.append_u8(PROTO_VERSION);
    outp.append_u8(VERSION_MAJOR);
    outp.append_u8(VERSION_MINOR);
    outp.append_u16(VERSION_REVISION);
    outp.append_u64(rt.host.now());
    rt.identity.identity().serialize(&mut outp);
    their_external.serialize(&mut outp);
    outp.append_u64(rt.topology.world_id());
    outp.append_u64(rt.topology.world_timestamp());
    outp
}
