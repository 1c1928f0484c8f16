//! Wire-level dissector checks: canonical address equality across families,
//! shell walking, idempotence, and the short-packet boundary cases.

mod common;

use common::{build, Pkt};
use sleipnir_ebpf_common::dissector::{
    NoVlanRemap, PacketBounds, PacketDissector, IPPROTO_TCP, IPPROTO_UDP, TCP_FLAG_ACK,
    TCP_FLAG_SYN,
};
use sleipnir_ebpf_common::ip::CanonicalIp;

fn dissect(frame: &mut [u8]) -> Option<PacketDissector> {
    let bounds = PacketBounds::of_mut_slice(frame);
    let mut d = unsafe { PacketDissector::new(bounds, 1) }?;
    if !d.find_l3_offset(1, None::<&NoVlanRemap>) {
        return None;
    }
    if !d.find_ip_header() {
        return None;
    }
    Some(d)
}

#[test]
fn plain_tcp_parse() {
    let mut frame = build(&Pkt {
        seq: 12345,
        tcp_flags: TCP_FLAG_SYN,
        ts: Some((1000, 0)),
        ..Default::default()
    });
    let d = dissect(&mut frame).expect("parseable");
    assert_eq!(d.src_ip, CanonicalIp::from_v4_octets([10, 0, 0, 5]));
    assert_eq!(d.dst_ip, CanonicalIp::from_v4_octets([203, 0, 113, 9]));
    assert_eq!(d.ip_protocol, IPPROTO_TCP);
    assert_eq!((d.src_port, d.dst_port), (51000, 443));
    assert_eq!(d.sequence, 12345);
    assert_eq!(d.window, 65535);
    assert_eq!((d.tsval, d.tsecr), (1000, 0));
    assert!(d.tcp_flag(TCP_FLAG_SYN));
    assert!(!d.tcp_flag(TCP_FLAG_ACK));
    assert!(!d.tcp_has_payload);
}

#[test]
fn payload_presence_is_detected() {
    let mut frame = build(&Pkt { payload: 100, ..Default::default() });
    assert!(dissect(&mut frame).unwrap().tcp_has_payload);
}

#[test]
fn v4_and_v6_sources_with_equal_final_octets_canonicalize_identically() {
    let mut v4 = build(&Pkt {
        src: "192.0.2.1".parse().unwrap(),
        dst: "203.0.113.9".parse().unwrap(),
        ..Default::default()
    });
    let mut v6 = build(&Pkt {
        src: "ffff:ffff:ffff:ffff:ffff:ffff:c000:201".parse().unwrap(),
        dst: "2001:db8::1".parse().unwrap(),
        ..Default::default()
    });
    let a = dissect(&mut v4).unwrap();
    let b = dissect(&mut v6).unwrap();
    assert_eq!(a.src_ip, b.src_ip);
}

#[test]
fn dissection_is_idempotent() {
    let mut frame = build(&Pkt {
        vlans: vec![200],
        ts: Some((55, 44)),
        payload: 32,
        ..Default::default()
    });
    let first = dissect(&mut frame).unwrap();
    let second = dissect(&mut frame).unwrap();
    assert_eq!(first.src_ip, second.src_ip);
    assert_eq!(first.dst_ip, second.dst_ip);
    assert_eq!(first.current_vlan, second.current_vlan);
    assert_eq!(first.l3_offset, second.l3_offset);
    assert_eq!((first.src_port, first.dst_port), (second.src_port, second.dst_port));
    assert_eq!((first.tsval, first.tsecr), (second.tsval, second.tsecr));
    assert_eq!(first.tcp_flags, second.tcp_flags);
}

#[test]
fn packet_shorter_than_ethernet_header_is_unparseable() {
    let mut runt = [0u8; 13];
    let bounds = PacketBounds::of_mut_slice(&mut runt);
    assert!(unsafe { PacketDissector::new(bounds, 1) }.is_none());
}

#[test]
fn truncated_l3_header_is_unparseable() {
    let full = build(&Pkt::default());
    let mut truncated = full[..20].to_vec();
    assert!(dissect(&mut truncated).is_none());
}

#[test]
fn vlan_chain_of_depth_ten_parses() {
    let mut frame = build(&Pkt { vlans: vec![100; 10], ..Default::default() });
    let d = dissect(&mut frame).expect("ten shells are within the walk bound");
    assert_eq!(d.current_vlan, 100u16.to_be());
}

#[test]
fn vlan_chain_of_depth_eleven_is_unparseable() {
    let mut frame = build(&Pkt { vlans: vec![100; 11], ..Default::default() });
    assert!(dissect(&mut frame).is_none());
}

#[test]
fn arp_is_passed_through() {
    let mut frame = build(&Pkt::default());
    frame[12] = 0x08;
    frame[13] = 0x06;
    assert!(dissect(&mut frame).is_none());
}

#[test]
fn pppoe_session_wraps_ipv4() {
    let plain = build(&Pkt { protocol: IPPROTO_UDP, src_port: 1000, dst_port: 53, ..Default::default() });
    let mut frame = plain[..12].to_vec();
    frame.extend_from_slice(&0x8864u16.to_be_bytes());
    // ver/type, code, session id, length, protocol = IPv4
    frame.extend_from_slice(&[0x11, 0x00, 0x00, 0x01]);
    frame.extend_from_slice(&(((plain.len() - 14) + 2) as u16).to_be_bytes());
    frame.extend_from_slice(&0x0021u16.to_be_bytes());
    frame.extend_from_slice(&plain[14..]);
    let d = dissect(&mut frame).unwrap();
    assert_eq!(d.ip_protocol, IPPROTO_UDP);
    assert_eq!((d.src_port, d.dst_port), (1000, 53));
}

#[test]
fn mpls_bottom_of_stack_reveals_ipv4() {
    let plain = build(&Pkt::default());
    let mut frame = plain[..12].to_vec();
    frame.extend_from_slice(&0x8847u16.to_be_bytes());
    // label 30, TC 0, bottom-of-stack set, TTL 64
    let entry: u32 = (30 << 12) | 0x100 | 64;
    frame.extend_from_slice(&entry.to_be_bytes());
    frame.extend_from_slice(&plain[14..]);
    let d = dissect(&mut frame).unwrap();
    assert_eq!(d.ip_protocol, IPPROTO_TCP);
    assert_eq!(d.src_ip, CanonicalIp::from_v4_octets([10, 0, 0, 5]));
}

#[test]
fn icmp_records_type_and_code_as_ports() {
    let mut frame = build(&Pkt {
        protocol: 1,
        src_port: 8, // echo request
        dst_port: 0,
        ..Default::default()
    });
    let d = dissect(&mut frame).unwrap();
    assert_eq!(d.ip_protocol, 1);
    assert_eq!((d.src_port, d.dst_port), (8, 0));
}
