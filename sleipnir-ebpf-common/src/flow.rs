//! Bidirectional flow tracking ("flowbee"): byte/packet/rate accounting per
//! direction, retransmit detection via sequence regression, and passive RTT
//! measurement by matching TCP timestamp echoes, in the manner of Kathleen
//! Nichols' pping.
//!
//! Direction indices throughout: 0 = the ToInternet side, 1 = the ToLocal
//! side (`dir_index(effective)`). The `effective_direction` field of emitted
//! RTT events uses the same 1/2 encoding as the load-time constants.

use crate::dissector::{PacketDissector, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN};
use crate::ip::CanonicalIp;
use crate::mapping::{dir_index, ShapingMapping, TO_LOCAL};

pub const FLOW_ALIVE: u8 = 0;
pub const FLOW_FIN: u8 = 1;
pub const FLOW_RST: u8 = 2;

/// Slots in the pending-TSval ring, per direction.
pub const TS_RING_SLOTS: usize = 2;
/// A pending TSval older than this is dead and its slot may be reused.
pub const TS_SLOT_TTL_NS: u64 = 10_000_000_000;
/// RTT samples at or above this are discarded as bogus.
pub const MAX_RTT_NS: u64 = 2_000_000_000;
/// Per-direction floor between emitted RTT samples.
pub const RTT_SAMPLE_INTERVAL_NS: u64 = 100_000_000;
/// Rate estimator window.
pub const RATE_SAMPLE_INTERVAL_NS: u64 = 1_000_000_000;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Direction-normalized flow identity. Both halves of one conversation
/// resolve to the same key: packets heading to the Internet are stored
/// swapped, so `src` is always the Internet-facing peer. Ports are host
/// order (ICMP stores type/code there).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct FlowKey {
    pub src: CanonicalIp,
    pub dst: CanonicalIp,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _pad: [u8; 3],
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for FlowKey {}

/// Build the normalized key for a packet given its effective direction.
#[inline(always)]
pub fn build_flow_key(d: &PacketDissector, effective: u32) -> FlowKey {
    if effective == TO_LOCAL {
        FlowKey {
            src: d.src_ip,
            dst: d.dst_ip,
            src_port: d.src_port,
            dst_port: d.dst_port,
            protocol: d.ip_protocol,
            _pad: [0; 3],
        }
    } else {
        FlowKey {
            src: d.dst_ip,
            dst: d.src_ip,
            src_port: d.dst_port,
            dst_port: d.src_port,
            protocol: d.ip_protocol,
            _pad: [0; 3],
        }
    }
}

/// One pending (send time, TSval) pair awaiting its echo.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TsvalSlot {
    pub time: u64,
    pub tsval: u32,
    pub _pad: u32,
}

impl TsvalSlot {
    #[inline(always)]
    fn is_free(&self, now: u64) -> bool {
        self.time == 0 || now.saturating_sub(self.time) > TS_SLOT_TTL_NS
    }

    #[inline(always)]
    fn clear(&mut self) {
        self.time = 0;
        self.tsval = 0;
    }
}

/// Two-sided flow record. Updated in place by whichever CPU sees the
/// packet; userspace readers tolerate transiently inconsistent counter
/// fields but the key is never mutated after insert.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowEntry {
    pub start_time: u64,
    pub last_seen: u64,
    pub bytes: [u64; 2],
    pub packets: [u64; 2],
    pub next_count_time: [u64; 2],
    pub last_count_time: [u64; 2],
    pub next_count_bytes: [u64; 2],
    pub last_rtt_sample_time: [u64; 2],
    pub circuit_id: u64,
    pub device_id: u64,
    pub ts_ring: [[TsvalSlot; TS_RING_SLOTS]; 2],
    pub rate_bps: [u32; 2],
    pub last_sequence: [u32; 2],
    pub tsval: [u32; 2],
    pub tsecr: [u32; 2],
    pub tc_handle: u32,
    pub cpu: u32,
    pub mapping_epoch: u32,
    pub retransmits: [u16; 2],
    pub end_status: u8,
    pub tos: u8,
    pub ip_flags: u8,
    pub _pad: [u8; 5],
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only (size assertion
/// below pins the layout).
#[cfg(feature = "aya")]
unsafe impl aya::Pod for FlowEntry {}

impl FlowEntry {
    /// Fresh entry for a first-seen flow. The packet itself is counted by
    /// the subsequent `update_flow` call.
    pub fn new(d: &PacketDissector, mapping: &ShapingMapping, epoch: u32) -> Self {
        Self {
            start_time: d.now,
            last_seen: d.now,
            bytes: [0; 2],
            packets: [0; 2],
            next_count_time: [d.now + RATE_SAMPLE_INTERVAL_NS; 2],
            last_count_time: [d.now; 2],
            next_count_bytes: [0; 2],
            last_rtt_sample_time: [0; 2],
            circuit_id: mapping.circuit_id,
            device_id: mapping.device_id,
            ts_ring: [[TsvalSlot { time: 0, tsval: 0, _pad: 0 }; TS_RING_SLOTS]; 2],
            rate_bps: [0; 2],
            last_sequence: [0; 2],
            tsval: [0; 2],
            tsecr: [0; 2],
            tc_handle: mapping.tc_handle,
            cpu: mapping.cpu,
            mapping_epoch: epoch,
            retransmits: [0; 2],
            end_status: FLOW_ALIVE,
            tos: d.tos,
            ip_flags: d.ip_flags,
            _pad: [0; 5],
        }
    }

    /// Replace the cached resolver result after an epoch bump.
    #[inline(always)]
    pub fn refresh_mapping(&mut self, mapping: &ShapingMapping, epoch: u32) {
        self.tc_handle = mapping.tc_handle;
        self.cpu = mapping.cpu;
        self.circuit_id = mapping.circuit_id;
        self.device_id = mapping.device_id;
        self.mapping_epoch = epoch;
    }
}

/// Emitted when a TSecr matches a pending TSval. `effective_direction`
/// names the side that sent the original data segment.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEvent {
    pub key: FlowKey,
    pub round_trip_time_ns: u64,
    pub effective_direction: u32,
    pub _pad: u32,
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for RttEvent {}

/// Destination for RTT events. The kernel side backs this with the
/// `flowbee_events` ring buffer and may drop on pressure; tests collect
/// into a vector.
pub trait RttSink {
    fn push(&mut self, event: &RttEvent);
}

/// Should this TCP packet seed a new flow entry? SYN-without-ACK always
/// does; anything later only when the subscriber has a real mapping (which
/// covers program reload mid-flow).
#[inline(always)]
pub fn should_seed_tcp_flow(d: &PacketDissector, mapping_is_real: bool) -> bool {
    let syn_only = d.tcp_flag(TCP_FLAG_SYN) && !d.tcp_flag(TCP_FLAG_ACK);
    syn_only || mapping_is_real
}

/// Record one packet against its flow entry: counters, rate estimate,
/// retransmits, timestamp bookkeeping and RTT emission.
pub fn update_flow(
    entry: &mut FlowEntry,
    key: &FlowKey,
    d: &PacketDissector,
    effective: u32,
    sink: &mut impl RttSink,
) {
    let idx = dir_index(effective);
    entry.last_seen = d.now;
    entry.tos = d.tos;
    entry.ip_flags = d.ip_flags;
    entry.bytes[idx] += d.skb_len as u64;
    entry.packets[idx] += 1;

    estimate_rate(entry, idx, d.now);

    if d.is_tcp() {
        track_retransmits(entry, idx, d.sequence);
        track_timestamps(entry, idx, key, d, sink);

        // Closure is sticky: Fin can only be upgraded to Rst, and Rst is
        // final.
        if d.tcp_flag(TCP_FLAG_RST) {
            entry.end_status = FLOW_RST;
        } else if d.tcp_flag(TCP_FLAG_FIN) && entry.end_status != FLOW_RST {
            entry.end_status = FLOW_FIN;
        }
    }
}

/// Windowed rate estimate: once per second per direction, bits over the
/// elapsed nanoseconds scaled back to per-second.
fn estimate_rate(entry: &mut FlowEntry, idx: usize, now: u64) {
    if now <= entry.next_count_time[idx] {
        return;
    }
    let delta_bytes = entry.bytes[idx].saturating_sub(entry.next_count_bytes[idx]);
    let delta_ns = now.saturating_sub(entry.last_count_time[idx]);
    if delta_ns > 0 {
        let bps = (delta_bytes * 8).saturating_mul(NSEC_PER_SEC) / delta_ns;
        entry.rate_bps[idx] = bps.min(u32::MAX as u64) as u32;
    }
    entry.next_count_time[idx] = now + RATE_SAMPLE_INTERVAL_NS;
    entry.last_count_time[idx] = now;
    entry.next_count_bytes[idx] = entry.bytes[idx];
}

/// Sequence regression per RFC 7323 S5.2 modular comparison. Regression
/// counts a retransmit (or a reorder/duplicate, equally a sign of path
/// trouble) and leaves the high-water mark alone.
fn track_retransmits(entry: &mut FlowEntry, idx: usize, sequence: u32) {
    let last = entry.last_sequence[idx];
    if last != 0 && sequence != last && sequence.wrapping_sub(last) & 0x8000_0000 != 0 {
        entry.retransmits[idx] = entry.retransmits[idx].saturating_add(1);
    } else {
        entry.last_sequence[idx] = sequence;
    }
}

/// Modular "advances" test for 32-bit TCP timestamps.
#[inline(always)]
fn ts_advances(new: u32, old: u32) -> bool {
    new != 0 && (old == 0 || (new != old && new.wrapping_sub(old) & 0x8000_0000 == 0))
}

fn track_timestamps(
    entry: &mut FlowEntry,
    idx: usize,
    key: &FlowKey,
    d: &PacketDissector,
    sink: &mut impl RttSink,
) {
    // A fresh TSval on a SYN or a data-bearing segment becomes a pending
    // sample. Pure ACKs are skipped: segmentation offload replays their
    // TSval across many wire packets.
    if ts_advances(d.tsval, entry.tsval[idx])
        && (d.tcp_flag(TCP_FLAG_SYN) || d.tcp_has_payload)
    {
        entry.tsval[idx] = d.tsval;
        let ring = &mut entry.ts_ring[idx];
        for slot in ring.iter_mut() {
            if slot.is_free(d.now) {
                slot.time = d.now;
                slot.tsval = d.tsval;
                break;
            }
        }
    }

    // A fresh TSecr acknowledges a pending sample of the reverse direction.
    if ts_advances(d.tsecr, entry.tsecr[idx]) {
        entry.tsecr[idx] = d.tsecr;
        let rev = 1 - idx;
        let mut matched_time = 0u64;
        for slot in entry.ts_ring[rev].iter_mut() {
            if slot.time == 0 {
                continue;
            }
            if slot.tsval == d.tsecr {
                matched_time = slot.time;
                slot.clear();
            } else if slot.tsval.wrapping_sub(d.tsecr) & 0x8000_0000 != 0 {
                // Echo has moved past this sample; it can never match now.
                slot.clear();
            }
        }
        if matched_time != 0 {
            let rtt = d.now.saturating_sub(matched_time);
            if rtt < MAX_RTT_NS
                && d.now.saturating_sub(entry.last_rtt_sample_time[rev]) >= RTT_SAMPLE_INTERVAL_NS
            {
                entry.last_rtt_sample_time[rev] = d.now;
                sink.push(&RttEvent {
                    key: *key,
                    round_trip_time_ns: rtt,
                    effective_direction: rev as u32 + 1,
                    _pad: 0,
                });
            }
        }
    }
}

const _: () = {
    use core::mem::size_of;
    assert!(size_of::<FlowKey>() == 40);
    assert!(size_of::<TsvalSlot>() == 16);
    assert!(size_of::<FlowEntry>() == 248);
    assert!(size_of::<RttEvent>() == 56);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::{PacketBounds, IPPROTO_TCP, TCP_FLAG_ACK, TCP_FLAG_SYN};
    use crate::mapping::TO_INTERNET;

    struct VecSink(Vec<RttEvent>);

    impl RttSink for VecSink {
        fn push(&mut self, event: &RttEvent) {
            self.0.push(*event);
        }
    }

    /// Synthetic parsed record; flow logic never touches the buffer.
    fn packet(now: u64) -> PacketDissector {
        PacketDissector {
            bounds: PacketBounds { start: 0, end: 0 },
            now,
            skb_len: 1500,
            l3_offset: 14,
            l4_offset: 34,
            eth_type: 0x0800,
            current_vlan: 0,
            src_ip: CanonicalIp::from_v4_octets([10, 0, 0, 5]),
            dst_ip: CanonicalIp::from_v4_octets([203, 0, 113, 9]),
            ip_protocol: IPPROTO_TCP,
            tos: 0,
            ip_flags: 0,
            src_port: 51000,
            dst_port: 443,
            window: 65535,
            tcp_flags: TCP_FLAG_ACK,
            tcp_has_payload: true,
            sequence: 1,
            tsval: 0,
            tsecr: 0,
        }
    }

    fn entry(d: &PacketDissector) -> FlowEntry {
        FlowEntry::new(d, &ShapingMapping::default(), 1)
    }

    #[test]
    fn both_halves_share_one_key() {
        let upload = packet(1);
        let mut download = packet(2);
        core::mem::swap(&mut download.src_ip, &mut download.dst_ip);
        core::mem::swap(&mut download.src_port, &mut download.dst_port);
        assert_eq!(
            build_flow_key(&upload, TO_INTERNET),
            build_flow_key(&download, TO_LOCAL)
        );
    }

    #[test]
    fn sequence_regression_counts_a_retransmit() {
        let mut d = packet(1_000);
        d.sequence = 1000;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);

        d.sequence = 500;
        d.now += 1;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.retransmits[0], 1);
        assert_eq!(e.last_sequence[0], 1000);
        assert_eq!(e.retransmits[1], 0);
    }

    #[test]
    fn sequence_wrap_is_an_advance() {
        let mut d = packet(1_000);
        d.sequence = 0xFFFF_FF00;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);

        d.sequence = 0x0000_1000;
        d.now += 1;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.retransmits[0], 0);
        assert_eq!(e.last_sequence[0], 0x0000_1000);
    }

    #[test]
    fn rate_estimate_tracks_counted_bytes() {
        let mut d = packet(0);
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        for _ in 0..10 {
            update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        }
        // Cross the window boundary: 15000 bytes over 2 seconds.
        d.now = 2 * RATE_SAMPLE_INTERVAL_NS;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.bytes[0], 16_500);
        assert_eq!(e.rate_bps[0], 16_500 * 8 / 2);
        assert_eq!(e.next_count_bytes[0], 16_500);
        assert_eq!(e.last_count_time[0], d.now);
    }

    #[test]
    fn rtt_sample_emitted_and_slot_cleared() {
        let t0 = 1_000_000_000u64;
        let mut d = packet(t0);
        d.tsval = 500;
        d.tcp_has_payload = true;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.ts_ring[0][0].tsval, 500);

        // The echo arrives 12 ms later from the other side.
        let mut ack = packet(t0 + 12_000_000);
        core::mem::swap(&mut ack.src_ip, &mut ack.dst_ip);
        core::mem::swap(&mut ack.src_port, &mut ack.dst_port);
        ack.tcp_has_payload = false;
        ack.tsval = 9000;
        ack.tsecr = 500;
        update_flow(&mut e, &key, &ack, TO_LOCAL, &mut sink);

        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].round_trip_time_ns, 12_000_000);
        assert_eq!(sink.0[0].effective_direction, TO_INTERNET);
        assert_eq!(e.last_rtt_sample_time[0], t0 + 12_000_000);
        assert_eq!(e.ts_ring[0][0].time, 0);

        // A duplicate echo finds nothing pending and emits nothing.
        let mut dup = ack;
        dup.now += 1_000;
        update_flow(&mut e, &key, &dup, TO_LOCAL, &mut sink);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn rtt_events_are_rate_limited() {
        let t0 = 1_000_000_000u64;
        let key;
        let mut e;
        let mut sink = VecSink(Vec::new());
        {
            let mut d = packet(t0);
            d.tsval = 100;
            key = build_flow_key(&d, TO_INTERNET);
            e = entry(&d);
            update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        }
        // First echo 10 ms later: emitted.
        let mut ack = packet(t0 + 10_000_000);
        core::mem::swap(&mut ack.src_ip, &mut ack.dst_ip);
        core::mem::swap(&mut ack.src_port, &mut ack.dst_port);
        ack.tcp_has_payload = false;
        ack.tsecr = 100;
        update_flow(&mut e, &key, &ack, TO_LOCAL, &mut sink);
        assert_eq!(sink.0.len(), 1);

        // Second sample 20 ms in: matched but suppressed by the 100 ms floor.
        let mut d2 = packet(t0 + 15_000_000);
        d2.tsval = 101;
        update_flow(&mut e, &key, &d2, TO_INTERNET, &mut sink);
        let mut ack2 = ack;
        ack2.now = t0 + 20_000_000;
        ack2.tsecr = 101;
        update_flow(&mut e, &key, &ack2, TO_LOCAL, &mut sink);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn oversized_rtt_is_discarded() {
        let t0 = 1_000_000_000u64;
        let mut d = packet(t0);
        d.tsval = 77;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);

        let mut ack = packet(t0 + MAX_RTT_NS + 1);
        ack.tcp_has_payload = false;
        ack.tsecr = 77;
        update_flow(&mut e, &key, &ack, TO_LOCAL, &mut sink);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn pure_acks_do_not_occupy_ring_slots() {
        let mut d = packet(1_000);
        d.tsval = 42;
        d.tcp_has_payload = false;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.ts_ring[0][0].time, 0);
    }

    #[test]
    fn syn_occupies_a_ring_slot_without_payload() {
        let mut d = packet(1_000);
        d.tsval = 42;
        d.tcp_has_payload = false;
        d.tcp_flags = TCP_FLAG_SYN;
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.ts_ring[0][0].tsval, 42);
    }

    #[test]
    fn closure_is_sticky() {
        let mut d = packet(1_000);
        let key = build_flow_key(&d, TO_INTERNET);
        let mut e = entry(&d);
        let mut sink = VecSink(Vec::new());

        d.tcp_flags = TCP_FLAG_FIN;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.end_status, FLOW_FIN);

        d.tcp_flags = TCP_FLAG_RST;
        d.now += 1;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.end_status, FLOW_RST);

        d.tcp_flags = TCP_FLAG_FIN;
        d.now += 1;
        update_flow(&mut e, &key, &d, TO_INTERNET, &mut sink);
        assert_eq!(e.end_status, FLOW_RST);
    }

    #[test]
    fn syn_without_ack_seeds_unshaped_flows() {
        let mut d = packet(1);
        d.tcp_flags = TCP_FLAG_SYN;
        assert!(should_seed_tcp_flow(&d, false));
        d.tcp_flags = TCP_FLAG_SYN | TCP_FLAG_ACK;
        assert!(!should_seed_tcp_flow(&d, false));
        assert!(should_seed_tcp_flow(&d, true));
        d.tcp_flags = TCP_FLAG_ACK;
        assert!(!should_seed_tcp_flow(&d, false));
    }

    #[test]
    fn mapping_refresh_overwrites_cached_fields() {
        let d = packet(1);
        let mut e = entry(&d);
        let mapping = ShapingMapping {
            cpu: 3,
            tc_handle: 0x0003_0002,
            circuit_id: 42,
            device_id: 7,
        };
        e.refresh_mapping(&mapping, 6);
        assert_eq!(e.tc_handle, 0x0003_0002);
        assert_eq!(e.cpu, 3);
        assert_eq!(e.circuit_id, 42);
        assert_eq!(e.device_id, 7);
        assert_eq!(e.mapping_epoch, 6);
    }
}
