#![allow(dead_code)] // each integration binary uses a different subset

//! Shared fixtures for the integration suites: a wire-level packet builder
//! and a host-side stand-in for the kernel datapath that drives the shared
//! logic through the same sequence as the ingress hook.

use std::collections::HashMap;
use std::net::IpAddr;

use sleipnir_ebpf_common::bifrost::{vlan_map_key, BifrostInterface};
use sleipnir_ebpf_common::dissector::{
    PacketBounds, PacketDissector, VlanRemapper, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
use sleipnir_ebpf_common::flow::{
    build_flow_key, should_seed_tcp_flow, update_flow, FlowEntry, FlowKey, RttEvent, RttSink,
};
use sleipnir_ebpf_common::ip::CanonicalIp;
use sleipnir_ebpf_common::mapping::{
    effective_direction, subscriber_ip, ShapingMapping, STICK_MODE, TO_INTERNET,
};
use sleipnir_ebpf_common::throughput::HostCounter;

/// The library builds `no_std` here, so the std address conversions are
/// compiled out; tests canonicalize by hand.
pub fn canon(ip: IpAddr) -> CanonicalIp {
    match ip {
        IpAddr::V4(v4) => CanonicalIp::from_v4_octets(v4.octets()),
        IpAddr::V6(v6) => CanonicalIp::from_v6_octets(v6.octets()),
    }
}

// ── Packet builder ───────────────────────────────────────────────────────────

pub struct Pkt {
    /// VLAN tags outermost first, host order.
    pub vlans: Vec<u16>,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub tcp_flags: u8,
    pub window: u16,
    /// TCP timestamp option (TSval, TSecr).
    pub ts: Option<(u32, u32)>,
    pub payload: usize,
    /// Pad the finished frame out to this many bytes.
    pub frame_len: Option<usize>,
}

impl Default for Pkt {
    fn default() -> Self {
        Self {
            vlans: Vec::new(),
            src: "10.0.0.5".parse().unwrap(),
            dst: "203.0.113.9".parse().unwrap(),
            protocol: IPPROTO_TCP,
            src_port: 51000,
            dst_port: 443,
            seq: 1,
            tcp_flags: 0x10, // ACK
            window: 65535,
            ts: None,
            payload: 0,
            frame_len: None,
        }
    }
}

pub fn build(p: &Pkt) -> Vec<u8> {
    let mut f: Vec<u8> = Vec::new();
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // dst MAC
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // src MAC
    // Each tag: 0x8100 ethertype, then the TCI; the next shell supplies the
    // encapsulated protocol.
    for tag in &p.vlans {
        f.extend_from_slice(&0x8100u16.to_be_bytes());
        f.extend_from_slice(&tag.to_be_bytes());
    }
    let is_v6 = p.dst.is_ipv6();
    f.extend_from_slice(&if is_v6 { 0x86DDu16 } else { 0x0800u16 }.to_be_bytes());

    let l4 = l4_bytes(p);
    match (p.src, p.dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let tot_len = (20 + l4.len()) as u16;
            f.push(0x45);
            f.push(0); // tos
            f.extend_from_slice(&tot_len.to_be_bytes());
            f.extend_from_slice(&[0, 0]); // id
            f.extend_from_slice(&[0, 0]); // frag_off
            f.push(64); // ttl
            f.push(p.protocol);
            f.extend_from_slice(&[0, 0]); // checksum
            f.extend_from_slice(&s.octets());
            f.extend_from_slice(&d.octets());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            f.push(0x60);
            f.extend_from_slice(&[0, 0, 0]); // flow label
            f.extend_from_slice(&(l4.len() as u16).to_be_bytes());
            f.push(p.protocol);
            f.push(64); // hop limit
            f.extend_from_slice(&s.octets());
            f.extend_from_slice(&d.octets());
        }
        _ => panic!("mixed address families"),
    }
    f.extend_from_slice(&l4);
    if let Some(total) = p.frame_len {
        assert!(total >= f.len(), "frame_len smaller than headers");
        f.resize(total, 0);
    }
    f
}

fn l4_bytes(p: &Pkt) -> Vec<u8> {
    let mut l4 = Vec::new();
    match p.protocol {
        IPPROTO_TCP => {
            let options: Vec<u8> = match p.ts {
                Some((tsval, tsecr)) => {
                    let mut o = vec![1, 1, 8, 10];
                    o.extend_from_slice(&tsval.to_be_bytes());
                    o.extend_from_slice(&tsecr.to_be_bytes());
                    o
                }
                None => Vec::new(),
            };
            let doff = (20 + options.len()) / 4;
            l4.extend_from_slice(&p.src_port.to_be_bytes());
            l4.extend_from_slice(&p.dst_port.to_be_bytes());
            l4.extend_from_slice(&p.seq.to_be_bytes());
            l4.extend_from_slice(&[0, 0, 0, 0]); // ack_seq
            l4.push((doff as u8) << 4);
            l4.push(p.tcp_flags);
            l4.extend_from_slice(&p.window.to_be_bytes());
            l4.extend_from_slice(&[0, 0, 0, 0]); // checksum + urg
            l4.extend_from_slice(&options);
        }
        IPPROTO_UDP => {
            l4.extend_from_slice(&p.src_port.to_be_bytes());
            l4.extend_from_slice(&p.dst_port.to_be_bytes());
            l4.extend_from_slice(&((8 + p.payload) as u16).to_be_bytes());
            l4.extend_from_slice(&[0, 0]);
        }
        IPPROTO_ICMP => {
            l4.push(p.src_port as u8); // type
            l4.push(p.dst_port as u8); // code
            l4.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
        other => panic!("unsupported protocol {other}"),
    }
    l4.extend(std::iter::repeat(0u8).take(p.payload));
    l4
}

// ── Host-side datapath stand-in ──────────────────────────────────────────────

pub struct VlanTable(pub HashMap<u32, u16>);

impl VlanRemapper for VlanTable {
    fn remap(&self, ifindex: u32, vlan: u16) -> Option<u16> {
        self.0.get(&vlan_map_key(ifindex, vlan)).copied()
    }
}

struct VecSink<'a>(&'a mut Vec<RttEvent>);

impl RttSink for VecSink<'_> {
    fn push(&mut self, event: &RttEvent) {
        self.0.push(*event);
    }
}

/// What the ingress hook did with one packet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngressOutcome {
    pub parsed: bool,
    /// tc_handle written into the packet metadata, when a mapping was found.
    pub metadata: Option<u32>,
    /// CPU the packet was redirected to, when a mapping was found.
    pub redirect_cpu: Option<u32>,
}

/// Userspace mirror of the kernel datapath: the same shared maps, backed by
/// std collections, driven through the same per-packet sequence as the XDP
/// ingress hook. Both interfaces of a deployment share one instance, so
/// tests flip `direction` to play the other side.
pub struct TestDatapath {
    pub direction: u32,
    /// Network byte order, as the load-time global is stored.
    pub internet_vlan: u16,
    pub stick_offset: u32,
    pub hot_cache_enabled: bool,
    pub epoch: u32,
    trie: Vec<(u8, CanonicalIp, ShapingMapping)>,
    pub hot_cache: HashMap<CanonicalIp, ShapingMapping>,
    pub trie_lookups: usize,
    pub flows: HashMap<FlowKey, FlowEntry>,
    pub traffic: HashMap<CanonicalIp, HostCounter>,
    pub vlan_rules: VlanTable,
    pub interface_rules: HashMap<u32, BifrostInterface>,
    pub events: Vec<RttEvent>,
}

impl TestDatapath {
    pub fn new(direction: u32) -> Self {
        Self {
            direction,
            internet_vlan: 0,
            stick_offset: 0,
            hot_cache_enabled: true,
            epoch: 1,
            trie: Vec::new(),
            hot_cache: HashMap::new(),
            trie_lookups: 0,
            flows: HashMap::new(),
            traffic: HashMap::new(),
            vlan_rules: VlanTable(HashMap::new()),
            interface_rules: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Control-plane write: insert a mapping for `ip/prefix_len` (prefix
    /// length counted over the canonical 128 bits).
    pub fn set_mapping(&mut self, ip: IpAddr, prefix_len: u8, mapping: ShapingMapping) {
        let addr = canon(ip);
        self.trie.retain(|(len, net, _)| !(*len == prefix_len && *net == addr));
        self.trie.push((prefix_len, addr, mapping));
    }

    /// The invalidation protocol: clear the hot cache first, then advance
    /// the epoch.
    pub fn clear_cache_and_bump_epoch(&mut self) {
        self.hot_cache.clear();
        self.epoch += 1;
    }

    fn lpm_lookup(&mut self, addr: &CanonicalIp) -> Option<ShapingMapping> {
        self.trie_lookups += 1;
        self.trie
            .iter()
            .filter(|(len, net, _)| prefix_matches(*len, net, addr))
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, _, m)| *m)
    }

    /// Hot cache in front of the trie, with negative caching.
    fn resolve(&mut self, addr: &CanonicalIp) -> Option<ShapingMapping> {
        if self.hot_cache_enabled {
            if let Some(cached) = self.hot_cache.get(addr) {
                return if cached.is_negative() { None } else { Some(*cached) };
            }
        }
        let hit = self.lpm_lookup(addr);
        if self.hot_cache_enabled {
            self.hot_cache
                .entry(*addr)
                .or_insert_with(|| hit.unwrap_or_else(ShapingMapping::negative));
        }
        hit
    }

    /// Drive one frame through the ingress sequence: dissect, direction,
    /// resolve, flow-track, count, stamp and redirect.
    pub fn ingress(&mut self, frame: &mut [u8], ifindex: u32, now: u64) -> IngressOutcome {
        let pass = IngressOutcome { parsed: false, ..Default::default() };
        let vlan_redirect = self.interface_rules.contains_key(&ifindex);

        let bounds = PacketBounds::of_mut_slice(frame);
        let mut d = match unsafe { PacketDissector::new(bounds, now) } {
            Some(d) => d,
            None => return pass,
        };
        let remap = if vlan_redirect { Some(&self.vlan_rules) } else { None };
        if !d.find_l3_offset(ifindex, remap) {
            return pass;
        }
        if !d.find_ip_header() {
            return pass;
        }

        let effective = effective_direction(self.direction, self.internet_vlan, d.current_vlan);
        let subscriber = subscriber_ip(effective, &d.src_ip, &d.dst_ip);
        let mut mapping = self.resolve(&subscriber);
        if self.direction == STICK_MODE && effective == TO_INTERNET {
            mapping = mapping.map(|m| m.with_stick_offset(self.stick_offset));
        }

        if matches!(d.ip_protocol, IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMP) {
            let key = build_flow_key(&d, effective);
            self.track_flow(&key, &d, effective, mapping);
        }

        let counted = mapping.unwrap_or_default();
        self.traffic
            .entry(subscriber)
            .or_default()
            .record(effective, d.skb_len, d.ip_protocol, d.now, &counted);

        match mapping {
            Some(m) => IngressOutcome {
                parsed: true,
                metadata: Some(m.tc_handle),
                redirect_cpu: Some(m.cpu),
            },
            None => IngressOutcome { parsed: true, ..Default::default() },
        }
    }

    fn track_flow(
        &mut self,
        key: &FlowKey,
        d: &PacketDissector,
        effective: u32,
        mapping: Option<ShapingMapping>,
    ) {
        let epoch = self.epoch;
        if !self.flows.contains_key(key) {
            let create = if d.ip_protocol == IPPROTO_TCP {
                should_seed_tcp_flow(d, mapping.is_some())
            } else {
                true
            };
            if !create {
                return;
            }
            self.flows
                .insert(*key, FlowEntry::new(d, &mapping.unwrap_or_default(), epoch));
        }
        let entry = self.flows.get_mut(key).unwrap();
        if entry.mapping_epoch != epoch {
            entry.refresh_mapping(&mapping.unwrap_or_default(), epoch);
        }
        let mut sink = VecSink(&mut self.events);
        update_flow(entry, key, d, effective, &mut sink);
    }

    /// The bifrost TC-ingress decision for a frame arriving on `ifindex`:
    /// `Some(target)` when the frame should bypass the bridge.
    pub fn bifrost_decision(&self, ifindex: u32, vlan_tci: u16) -> Option<u32> {
        let rule = self.interface_rules.get(&ifindex)?;
        if rule.scan_vlans != 0 {
            // Tagged frames only, or we create STP loops.
            (vlan_tci > 0).then_some(rule.redirect_to)
        } else {
            (ifindex != rule.redirect_to).then_some(rule.redirect_to)
        }
    }
}

fn prefix_matches(len: u8, net: &CanonicalIp, addr: &CanonicalIp) -> bool {
    let mut remaining = len as usize;
    for (a, b) in net.0.iter().zip(addr.0.iter()) {
        if remaining == 0 {
            return true;
        }
        let bits = remaining.min(8);
        let mask = (!0u8) << (8 - bits);
        if (a ^ b) & mask != 0 {
            return false;
        }
        remaining -= bits;
    }
    true
}
