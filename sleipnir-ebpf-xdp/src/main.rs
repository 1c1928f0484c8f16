//! Kernel programs for the sleipnir datapath.
//!
//! Three entry points share the maps below:
//! - `sleipnir_xdp` (ingress): dissect, resolve the subscriber's shaping
//!   class, update flow and throughput state, stamp per-packet metadata and
//!   redirect to the class's CPU.
//! - `sleipnir_tc_egress`: stamp the hardware queue for this CPU, then the
//!   skb priority from the ingress metadata (or a fresh lookup when the
//!   driver gave us no metadata head-room).
//! - `bifrost` (TC ingress): bypass the host bridge for interfaces with a
//!   redirect rule.
//!
//! Map names and value layouts are the userspace ABI; they live in
//! `sleipnir-ebpf-common` together with the dissector and flow logic this
//! file drives.
#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{xdp_action, BPF_F_NO_PREALLOC, BPF_NOEXIST, TC_ACT_OK, TC_ACT_REDIRECT, TC_ACT_SHOT, TC_ACT_UNSPEC},
    helpers::gen::{
        bpf_get_smp_processor_id, bpf_ktime_get_boot_ns, bpf_redirect, bpf_xdp_adjust_meta,
    },
    macros::{classifier, map, xdp},
    maps::{
        lpm_trie::{Key, LpmTrie},
        Array, CpuMap, HashMap, LruHashMap, LruPerCpuHashMap, PerCpuArray, PerCpuHashMap, RingBuf,
    },
    programs::{TcContext, XdpContext},
};

use sleipnir_ebpf_common::bifrost::{vlan_map_key, BifrostInterface, BifrostVlan, MAX_REDIRECT_RULES};
use sleipnir_ebpf_common::dissector::{
    PacketBounds, PacketDissector, VlanRemapper, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
use sleipnir_ebpf_common::flow::{
    build_flow_key, should_seed_tcp_flow, update_flow, FlowEntry, FlowKey, RttEvent, RttSink,
};
use sleipnir_ebpf_common::heimdall::{
    should_report, HeimdallConfig, HeimdallData, HeimdallEvent, HeimdallKey, HEIMDALL_COUNT_ONLY,
    HEIMDALL_FULL_CAPTURE,
};
use sleipnir_ebpf_common::ip::CanonicalIp;
use sleipnir_ebpf_common::limits::{
    EVENT_RING_BYTES, HOT_CACHE_SIZE, MAX_CPUS, MAX_FLOWS, MAX_SHAPED_PREFIXES, MAX_TRACKED_IPS,
    PACKET_SNIPPET_BYTES,
};
use sleipnir_ebpf_common::mapping::{
    effective_direction, subscriber_ip, PacketMetadata, ShapingMapping, DIRECTION_UNSET,
    STICK_MODE, TO_INTERNET,
};
use sleipnir_ebpf_common::throughput::HostCounter;
use sleipnir_ebpf_common::txq::TxqConfig;

// ── Globals patched at load time by EbpfLoader::set_global ──────────────────

#[no_mangle]
#[allow(non_upper_case_globals)]
static direction: u32 = 255;

#[no_mangle]
#[allow(non_upper_case_globals)]
static internet_vlan: u16 = 0; // network byte order

#[no_mangle]
#[allow(non_upper_case_globals)]
static isp_vlan: u16 = 0; // network byte order

#[no_mangle]
#[allow(non_upper_case_globals)]
static stick_offset: u32 = 0;

#[no_mangle]
#[allow(non_upper_case_globals)]
static hot_cache_enabled: u32 = 1;

#[no_mangle]
#[allow(non_upper_case_globals)]
static verbose: u32 = 0;

/// Trace-pipe breadcrumb, runtime-gated. Dropped measurements never drop
/// the packet; this is the only trace they leave.
macro_rules! debug_msg {
    ($fmt:literal $(, $arg:expr)*) => {
        if unsafe { core::ptr::read_volatile(&verbose) } != 0 {
            aya_ebpf::bpf_printk!($fmt $(, $arg)*);
        }
    };
}

// ── Shared maps (pinned by name; layouts are the userspace ABI) ─────────────

#[map]
#[allow(non_upper_case_globals)]
static map_traffic: PerCpuHashMap<CanonicalIp, HostCounter> =
    PerCpuHashMap::pinned(MAX_TRACKED_IPS, 0);

// Scratch space to avoid large host_counter allocations on the stack
#[map]
#[allow(non_upper_case_globals)]
static map_traffic_scratch: PerCpuArray<HostCounter> = PerCpuArray::with_max_entries(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static map_ip_to_cpu_and_tc: LpmTrie<CanonicalIp, ShapingMapping> =
    LpmTrie::pinned(MAX_SHAPED_PREFIXES, BPF_F_NO_PREALLOC);

#[map]
#[allow(non_upper_case_globals)]
static ip_to_cpu_and_tc_hotcache: LruHashMap<CanonicalIp, ShapingMapping> =
    LruHashMap::pinned(HOT_CACHE_SIZE, 0);

#[map]
#[allow(non_upper_case_globals)]
static ip_mapping_epoch: Array<u32> = Array::pinned(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static flowbee: LruHashMap<FlowKey, FlowEntry> = LruHashMap::pinned(MAX_FLOWS, 0);

#[map]
#[allow(non_upper_case_globals)]
static flowbee_scratch: PerCpuArray<FlowEntry> = PerCpuArray::with_max_entries(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static flowbee_events: RingBuf = RingBuf::pinned(EVENT_RING_BYTES, 0);

#[map]
#[allow(non_upper_case_globals)]
static map_txq_config: Array<TxqConfig> = Array::pinned(MAX_CPUS, 0);

#[map]
#[allow(non_upper_case_globals)]
static cpu_map: CpuMap = CpuMap::pinned(MAX_CPUS, 0);

#[map]
#[allow(non_upper_case_globals)]
static cpus_available: Array<u32> = Array::pinned(MAX_CPUS, 0);

#[map]
#[allow(non_upper_case_globals)]
static bifrost_interface_map: HashMap<u32, BifrostInterface> =
    HashMap::pinned(MAX_REDIRECT_RULES, 0);

#[map]
#[allow(non_upper_case_globals)]
static bifrost_vlan_map: HashMap<u32, BifrostVlan> = HashMap::pinned(MAX_REDIRECT_RULES, 0);

#[map]
#[allow(non_upper_case_globals)]
static heimdall: LruPerCpuHashMap<HeimdallKey, HeimdallData> =
    LruPerCpuHashMap::pinned(MAX_FLOWS, 0);

#[map]
#[allow(non_upper_case_globals)]
static heimdall_config: Array<HeimdallConfig> = Array::pinned(2, 0);

#[map]
#[allow(non_upper_case_globals)]
static heimdall_watching: HashMap<CanonicalIp, u32> = HashMap::pinned(64, 0);

#[map]
#[allow(non_upper_case_globals)]
static heimdall_scratch: PerCpuArray<HeimdallEvent> = PerCpuArray::with_max_entries(1, 0);

#[map]
#[allow(non_upper_case_globals)]
static heimdall_events: RingBuf = RingBuf::pinned(EVENT_RING_BYTES, 0);

// ── Map-backed adapters for the shared logic ────────────────────────────────

/// The dissector's VLAN rewrite hook, backed by `bifrost_vlan_map`.
struct BifrostVlanTable;

impl VlanRemapper for BifrostVlanTable {
    #[inline(always)]
    fn remap(&self, ifindex: u32, vlan: u16) -> Option<u16> {
        let key = vlan_map_key(ifindex, vlan);
        unsafe { bifrost_vlan_map.get(&key) }.map(|rule| rule.redirect_to as u16)
    }
}

/// RTT events go out the `flowbee_events` ring; a full ring drops the
/// sample, never the packet.
struct RingSink;

impl RttSink for RingSink {
    #[inline(always)]
    fn push(&mut self, event: &RttEvent) {
        let _ = flowbee_events.output(event, 0);
    }
}

#[inline(always)]
fn load_direction() -> u32 {
    unsafe { core::ptr::read_volatile(&direction) }
}

#[inline(always)]
fn current_epoch() -> u32 {
    ip_mapping_epoch.get(0).copied().unwrap_or(0)
}

// ── Resolver: hot cache in front of the LPM trie ────────────────────────────

/// Look up the shaping mapping for a subscriber address. Populates the hot
/// cache on miss, with a negative sentinel when the trie has nothing, so
/// unshaped traffic stops hitting the trie. In stick mode the upload class
/// is derived from the stored download class.
#[inline(always)]
fn resolve(addr: &CanonicalIp, dir: u32, effective: u32) -> Option<ShapingMapping> {
    let use_cache = unsafe { core::ptr::read_volatile(&hot_cache_enabled) } != 0;

    let found = if use_cache {
        match unsafe { ip_to_cpu_and_tc_hotcache.get(addr) } {
            Some(hit) if hit.is_negative() => return None,
            Some(hit) => Some(*hit),
            None => {
                let key = Key::new(128, *addr);
                let found = map_ip_to_cpu_and_tc.get(&key).copied();
                // Losing an insert race is harmless, both sides agree.
                let store = found.unwrap_or_else(ShapingMapping::negative);
                let _ = ip_to_cpu_and_tc_hotcache.insert(addr, &store, BPF_NOEXIST as u64);
                found
            }
        }
    } else {
        let key = Key::new(128, *addr);
        map_ip_to_cpu_and_tc.get(&key).copied()
    };

    found.map(|mapping| {
        if dir == STICK_MODE && effective == TO_INTERNET {
            mapping.with_stick_offset(unsafe { core::ptr::read_volatile(&stick_offset) })
        } else {
            mapping
        }
    })
}

// ── Flow tracking glue ──────────────────────────────────────────────────────

#[inline(always)]
fn track_flow(d: &PacketDissector, effective: u32, mapping: Option<&ShapingMapping>, epoch: u32) {
    if !matches!(d.ip_protocol, IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMP) {
        return;
    }
    let key = build_flow_key(d, effective);

    if unsafe { flowbee.get(&key) }.is_none() {
        let create = if d.ip_protocol == IPPROTO_TCP {
            should_seed_tcp_flow(d, mapping.is_some())
        } else {
            true
        };
        if !create {
            return;
        }
        // Build the record in per-CPU scratch: it is too large for the
        // program stack.
        let Some(scratch) = flowbee_scratch.get_ptr_mut(0) else { return };
        let fallback = ShapingMapping::default();
        unsafe {
            *scratch = FlowEntry::new(d, mapping.unwrap_or(&fallback), epoch);
        }
        if flowbee.insert(&key, unsafe { &*scratch }, BPF_NOEXIST as u64).is_err() {
            // Full table or a lost race; skip the measurement, not the packet.
            debug_msg!(b"flow table insert failed");
            return;
        }
    }

    let Some(entry) = flowbee.get_ptr_mut(&key) else { return };
    unsafe {
        if (*entry).mapping_epoch != epoch {
            let fallback = ShapingMapping::default();
            (*entry).refresh_mapping(mapping.unwrap_or(&fallback), epoch);
        }
        update_flow(&mut *entry, &key, d, effective, &mut RingSink);
    }
}

// ── Throughput glue ─────────────────────────────────────────────────────────

#[inline(always)]
fn track_traffic(subscriber: &CanonicalIp, d: &PacketDissector, effective: u32, mapping: &ShapingMapping) {
    // Per-CPU values: no other CPU touches this slot, no sync required.
    if let Some(counter) = map_traffic.get_ptr_mut(subscriber) {
        unsafe { (*counter).record(effective, d.skb_len, d.ip_protocol, d.now, mapping) };
        return;
    }
    // First sighting: assemble in per-CPU scratch, then publish.
    let Some(scratch) = map_traffic_scratch.get_ptr_mut(0) else { return };
    unsafe {
        *scratch = HostCounter::default();
        (*scratch).record(effective, d.skb_len, d.ip_protocol, d.now, mapping);
    }
    if map_traffic.insert(subscriber, unsafe { &*scratch }, BPF_NOEXIST as u64).is_err() {
        debug_msg!(b"host counter insert failed");
    }
}

// ── Heimdall glue ───────────────────────────────────────────────────────────

#[inline(always)]
fn heimdall_mode() -> u32 {
    heimdall_config.get(0).map(|cfg| cfg.monitor_mode).unwrap_or(0)
}

#[inline(always)]
fn is_heimdall_watching(d: &PacketDissector) -> bool {
    unsafe { heimdall_watching.get(&d.src_ip) }.is_some()
        || unsafe { heimdall_watching.get(&d.dst_ip) }.is_some()
}

#[inline(always)]
fn update_heimdall(d: &PacketDissector, mode: u32) {
    if !should_report(d) {
        return;
    }
    if mode == HEIMDALL_COUNT_ONLY {
        let key = HeimdallKey::from_packet(d);
        if let Some(counter) = heimdall.get_ptr_mut(&key) {
            unsafe { (*counter).record(d.skb_len, d.tos, d.now) };
        } else {
            let mut fresh = HeimdallData::default();
            fresh.record(d.skb_len, d.tos, d.now);
            if heimdall.insert(&key, &fresh, BPF_NOEXIST as u64).is_err() {
                debug_msg!(b"heimdall insert failed");
            }
        }
    } else if mode == HEIMDALL_FULL_CAPTURE {
        let Some(scratch) = heimdall_scratch.get_ptr_mut(0) else { return };
        unsafe {
            *scratch = HeimdallEvent::from_packet(d);
            // Per-byte bounded copy of the leading packet bytes; the
            // verifier needs the explicit check on every access.
            let mut copied = 0usize;
            for i in 0..PACKET_SNIPPET_BYTES {
                match d.bounds.ptr_at::<u8>(i) {
                    Some(byte) => {
                        (*scratch).packet[i] = *byte;
                        copied = i + 1;
                    }
                    None => break,
                }
            }
            (*scratch).dump_len = copied as u8;
            let _ = heimdall_events.output(&*scratch, 0);
        }
    }
}

// ── Ingress: XDP entry point ────────────────────────────────────────────────

#[xdp]
pub fn sleipnir_xdp(ctx: XdpContext) -> u32 {
    try_ingress(&ctx).unwrap_or(xdp_action::XDP_PASS)
}

fn try_ingress(ctx: &XdpContext) -> Result<u32, ()> {
    let dir = load_direction();
    if dir == DIRECTION_UNSET {
        // Misconfigured: degrade to pass-through.
        return Ok(xdp_action::XDP_PASS);
    }

    let ifindex = unsafe { (*ctx.ctx).ingress_ifindex };
    let vlan_redirect = unsafe { bifrost_interface_map.get(&ifindex) }.is_some();

    let now = unsafe { bpf_ktime_get_boot_ns() };
    let bounds = PacketBounds { start: ctx.data(), end: ctx.data_end() };
    let Some(mut d) = (unsafe { PacketDissector::new(bounds, now) }) else {
        return Ok(xdp_action::XDP_PASS);
    };
    // This step rewrites the VLAN tag when a bifrost rule asks for it.
    let remap = BifrostVlanTable;
    if !d.find_l3_offset(ifindex, if vlan_redirect { Some(&remap) } else { None }) {
        return Ok(xdp_action::XDP_PASS);
    }
    if !d.find_ip_header() {
        return Ok(xdp_action::XDP_PASS);
    }

    let vlan = unsafe { core::ptr::read_volatile(&internet_vlan) };
    let effective = effective_direction(dir, vlan, d.current_vlan);
    let subscriber = subscriber_ip(effective, &d.src_ip, &d.dst_ip);

    let mapping = resolve(&subscriber, dir, effective);
    let epoch = current_epoch();

    track_flow(&d, effective, mapping.as_ref(), epoch);
    track_traffic(&subscriber, &d, effective, &mapping.unwrap_or_default());

    let Some(mapping) = mapping else {
        // Unshaped: counted for visibility, no stamp, no redirect.
        return Ok(xdp_action::XDP_PASS);
    };

    let mode = heimdall_mode();
    if mode > 0 && is_heimdall_watching(&d) {
        update_heimdall(&d, mode);
    }

    let Some(cpu_dest) = cpus_available.get(mapping.cpu).copied() else {
        debug_msg!(b"cpu %u is not mapped", mapping.cpu);
        return Ok(xdp_action::XDP_PASS);
    };

    // Stash the resolved handle ahead of the payload for the egress hook.
    // Best effort: not every driver grants metadata head-room. This
    // invalidates the packet pointers, so it must come after the last read.
    let ret = unsafe { bpf_xdp_adjust_meta(ctx.ctx, -(META_HEADROOM as i32)) };
    if ret == 0 {
        let meta_start = unsafe { (*ctx.ctx).data_meta } as usize;
        let data_start = unsafe { (*ctx.ctx).data } as usize;
        if meta_start + core::mem::size_of::<PacketMetadata>() <= data_start {
            unsafe {
                *(meta_start as *mut PacketMetadata) = PacketMetadata { tc_handle: mapping.tc_handle };
            }
        }
    }

    Ok(cpu_map.redirect(cpu_dest, 0).unwrap_or(xdp_action::XDP_PASS))
}

/// Metadata reservation, kept 4-byte aligned for bpf_xdp_adjust_meta.
const META_HEADROOM: usize =
    (core::mem::size_of::<PacketMetadata>() + 3) & !3;

// ── Egress: TC entry point ──────────────────────────────────────────────────

#[classifier]
pub fn sleipnir_tc_egress(ctx: TcContext) -> i32 {
    let dir = load_direction();
    if dir == DIRECTION_UNSET {
        return TC_ACT_OK as i32;
    }

    let skb = ctx.skb.skb;

    // Stamp the per-CPU hardware queue first.
    let cpu = unsafe { bpf_get_smp_processor_id() };
    let Some(txq) = map_txq_config.get(cpu) else { return TC_ACT_SHOT as i32 };
    if txq.queue_mapping != 0 {
        unsafe { (*skb).queue_mapping = txq.queue_mapping as u32 };
    } else {
        debug_msg!(b"txq misconfigured for cpu %u", cpu);
    }

    // Fast path: the ingress hook left the handle in packet metadata.
    let data = unsafe { (*skb).data } as usize;
    let meta_start = unsafe { (*skb).data_meta } as usize;
    if meta_start != data && meta_start + core::mem::size_of::<PacketMetadata>() <= data {
        let handle = unsafe { (*(meta_start as *const PacketMetadata)).tc_handle };
        if handle != 0 {
            unsafe { (*skb).priority = handle };
            return TC_ACT_OK as i32;
        }
    }

    // No metadata: parse again and resolve on the egress direction.
    // Returning OK on failure is deliberate: IS-IS, ARP, STP and friends
    // still belong in the default queues.
    let now = unsafe { bpf_ktime_get_boot_ns() };
    let bounds = PacketBounds { start: ctx.data(), end: ctx.data_end() };
    let Some(mut d) = (unsafe { PacketDissector::new(bounds, now) }) else {
        return TC_ACT_OK as i32;
    };
    if !d.find_l3_offset(0, None::<&BifrostVlanTable>) {
        return TC_ACT_OK as i32;
    }
    if !d.find_ip_header() {
        return TC_ACT_OK as i32;
    }
    // The kernel may have popped the tag into the skb before we run.
    if d.current_vlan == 0 {
        let tci = unsafe { (*skb).vlan_tci } as u16;
        if tci != 0 {
            d.current_vlan = tci.to_be();
        }
    }

    let vlan = unsafe { core::ptr::read_volatile(&internet_vlan) };
    let effective = effective_direction(dir, vlan, d.current_vlan);
    let subscriber = subscriber_ip(effective, &d.src_ip, &d.dst_ip);
    if let Some(mapping) = resolve(&subscriber, dir, effective) {
        if mapping.tc_handle != 0 {
            unsafe { (*skb).priority = mapping.tc_handle };
        }
    }
    TC_ACT_OK as i32
}

// ── Bifrost: TC-ingress bridge bypass ───────────────────────────────────────

#[classifier]
pub fn bifrost(ctx: TcContext) -> i32 {
    let skb = ctx.skb.skb;
    let ifindex = unsafe { (*skb).ifindex };
    let Some(rule) = (unsafe { bifrost_interface_map.get(&ifindex) }) else {
        return TC_ACT_UNSPEC as i32;
    };

    if rule.scan_vlans != 0 {
        // Any VLAN rewrite already happened in the XDP stage. Redirect only
        // tagged frames; redirecting bare frames creates STP loops.
        if unsafe { (*skb).vlan_tci } > 0 {
            do_tc_redirect(rule.redirect_to)
        } else {
            TC_ACT_UNSPEC as i32
        }
    } else if ifindex == rule.redirect_to {
        // Never bounce a frame back out the interface it arrived on.
        TC_ACT_UNSPEC as i32
    } else {
        do_tc_redirect(rule.redirect_to)
    }
}

#[inline(always)]
fn do_tc_redirect(target: u32) -> i32 {
    let ret = unsafe { bpf_redirect(target, 0) };
    if ret != TC_ACT_REDIRECT as i64 {
        TC_ACT_UNSPEC as i32
    } else {
        ret as i32
    }
}

// ── Required for no_std + no_main ───────────────────────────────────────────

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
