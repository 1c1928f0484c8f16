//! Heimdall: selective per-flow mirroring of watched subscriber addresses.
//!
//! A small watch list of canonical addresses selects traffic; the monitor
//! mode decides what happens to it. Count-only mode keeps a per-CPU LRU of
//! 5-tuple counters; full capture emits one ring-buffer event per packet
//! with the leading bytes of the frame. Unwatched traffic is untouched.

use crate::dissector::{PacketDissector, IPPROTO_ICMP};
use crate::ip::CanonicalIp;
use crate::limits::PACKET_SNIPPET_BYTES;

pub const HEIMDALL_OFF: u32 = 0;
pub const HEIMDALL_COUNT_ONLY: u32 = 1;
pub const HEIMDALL_FULL_CAPTURE: u32 = 2;

/// Highest ICMP type worth reporting; anything above is noise.
const MAX_ICMP_TYPE: u16 = 18;

/// Single-element array holding the monitor mode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HeimdallConfig {
    pub monitor_mode: u32,
}

/// SAFETY: `#[repr(C)]`, `Copy`, a single u32.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for HeimdallConfig {}

/// 5-tuple key of the count-only LRU. Ports are host order (ICMP stores
/// type/code there).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct HeimdallKey {
    pub src: CanonicalIp,
    pub dst: CanonicalIp,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_protocol: u8,
    pub _pad: [u8; 3],
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for HeimdallKey {}

impl HeimdallKey {
    #[inline(always)]
    pub fn from_packet(d: &PacketDissector) -> Self {
        Self {
            src: d.src_ip,
            dst: d.dst_ip,
            src_port: d.src_port,
            dst_port: d.dst_port,
            ip_protocol: d.ip_protocol,
            _pad: [0; 3],
        }
    }
}

/// Count-only per-flow record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HeimdallData {
    pub last_seen: u64,
    pub bytes: u64,
    pub packets: u64,
    pub tos: u8,
    pub _pad: [u8; 7],
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for HeimdallData {}

impl HeimdallData {
    /// Fold one packet into the counters. TOS sticks to the last non-zero
    /// value seen.
    #[inline(always)]
    pub fn record(&mut self, size: u32, tos: u8, now: u64) {
        self.last_seen = now;
        self.packets += 1;
        self.bytes += size as u64;
        if tos != 0 {
            self.tos = tos;
        }
    }
}

/// Full-capture event: the 5-tuple, the TCP state fields, and the first
/// [`PACKET_SNIPPET_BYTES`] bytes of the frame.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HeimdallEvent {
    pub timestamp: u64,
    pub src: CanonicalIp,
    pub dst: CanonicalIp,
    pub size: u32,
    pub tsval: u32,
    pub tsecr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_protocol: u8,
    pub tos: u8,
    pub tcp_flags: u8,
    /// Bytes of `packet` that are valid.
    pub dump_len: u8,
    pub _pad: [u8; 4],
    pub packet: [u8; PACKET_SNIPPET_BYTES],
}

impl Default for HeimdallEvent {
    fn default() -> Self {
        Self {
            timestamp: 0,
            src: CanonicalIp::default(),
            dst: CanonicalIp::default(),
            size: 0,
            tsval: 0,
            tsecr: 0,
            src_port: 0,
            dst_port: 0,
            ip_protocol: 0,
            tos: 0,
            tcp_flags: 0,
            dump_len: 0,
            _pad: [0; 4],
            packet: [0; PACKET_SNIPPET_BYTES],
        }
    }
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for HeimdallEvent {}

impl HeimdallEvent {
    /// Header fields of a capture event; the caller copies the packet
    /// snippet separately (the copy is bounds-sensitive in the kernel).
    pub fn from_packet(d: &PacketDissector) -> Self {
        Self {
            timestamp: d.now,
            src: d.src_ip,
            dst: d.dst_ip,
            size: d.skb_len,
            tsval: d.tsval,
            tsecr: d.tsecr,
            src_port: d.src_port,
            dst_port: d.dst_port,
            ip_protocol: d.ip_protocol,
            tos: d.tos,
            tcp_flags: d.tcp_flags,
            dump_len: 0,
            _pad: [0; 4],
            packet: [0; PACKET_SNIPPET_BYTES],
        }
    }
}

/// Hygiene filter: skip port-less non-ICMP traffic and ICMP with
/// implausible type numbers.
#[inline(always)]
pub fn should_report(d: &PacketDissector) -> bool {
    if d.ip_protocol != IPPROTO_ICMP && (d.src_port == 0 || d.dst_port == 0) {
        return false;
    }
    if d.ip_protocol == IPPROTO_ICMP && d.src_port > MAX_ICMP_TYPE {
        return false;
    }
    true
}

const _: () = {
    use core::mem::size_of;
    assert!(size_of::<HeimdallKey>() == 40);
    assert!(size_of::<HeimdallData>() == 32);
    assert!(size_of::<HeimdallEvent>() == 64 + PACKET_SNIPPET_BYTES);
};
