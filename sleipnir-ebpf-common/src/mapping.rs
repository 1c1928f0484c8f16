//! Shaping mappings and direction rules: the value type of the LPM trie
//! and hot cache, the effective-direction selector, and the stick-mode
//! upload derivation.

use crate::ip::CanonicalIp;
use crate::limits::NEGATIVE_HIT;

/// Load-time direction constant: traffic on this interface heads upstream.
pub const TO_INTERNET: u32 = 1;
/// Load-time direction constant: traffic on this interface heads to subscribers.
pub const TO_LOCAL: u32 = 2;
/// Load-time direction constant: single interface, direction derived per
/// packet from the VLAN tag.
pub const STICK_MODE: u32 = 3;
/// Unconfigured sentinel. The hooks degrade to pass-through while this is set.
pub const DIRECTION_UNSET: u32 = 255;

/// Resolved shaping class for one subscriber prefix.
///
/// `tc_handle` packs a (major, minor) qdisc class into its high and low
/// 16-bit halves. `cpu == NEGATIVE_HIT` marks a hot-cache negative entry:
/// the address is known to be unshaped.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ShapingMapping {
    pub cpu: u32,
    pub tc_handle: u32,
    pub circuit_id: u64,
    pub device_id: u64,
}

impl ShapingMapping {
    /// The hot-cache sentinel for an address known to be unshaped.
    #[inline(always)]
    pub fn negative() -> Self {
        Self { cpu: NEGATIVE_HIT, tc_handle: NEGATIVE_HIT, circuit_id: 0, device_id: 0 }
    }

    #[inline(always)]
    pub fn is_negative(&self) -> bool {
        self.cpu == NEGATIVE_HIT
    }

    /// Derive the upload-side mapping in stick mode: the offset shifts both
    /// the CPU and the qdisc major so upload classes mirror download classes
    /// without storing both.
    #[inline(always)]
    pub fn with_stick_offset(&self, offset: u32) -> Self {
        Self {
            cpu: self.cpu.wrapping_add(offset),
            tc_handle: tc_handle_from_parts(
                tc_major(self.tc_handle).wrapping_add(offset as u16),
                tc_minor(self.tc_handle),
            ),
            circuit_id: self.circuit_id,
            device_id: self.device_id,
        }
    }
}

/// SAFETY: `#[repr(C)]`, `Copy`, u32/u64 fields only, no padding.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for ShapingMapping {}

#[inline(always)]
pub fn tc_major(handle: u32) -> u16 {
    (handle >> 16) as u16
}

#[inline(always)]
pub fn tc_minor(handle: u32) -> u16 {
    (handle & 0xFFFF) as u16
}

#[inline(always)]
pub fn tc_handle_from_parts(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// Normalize the packet direction. `direction` is the load-time constant;
/// in stick mode the frame's VLAN tag decides: the Internet-side VLAN
/// carries traffic arriving from upstream (downloads), anything else is on
/// its way out.
///
/// Both VLAN arguments are in network byte order, as stored in the frame
/// and in the load-time globals.
#[inline(always)]
pub fn effective_direction(direction: u32, internet_vlan: u16, current_vlan: u16) -> u32 {
    if direction < STICK_MODE {
        direction
    } else if current_vlan == internet_vlan {
        TO_LOCAL
    } else {
        TO_INTERNET
    }
}

/// The subscriber-side address of a packet: the destination for downloads,
/// the source for uploads.
#[inline(always)]
pub fn subscriber_ip(effective: u32, src_ip: &CanonicalIp, dst_ip: &CanonicalIp) -> CanonicalIp {
    if effective == TO_INTERNET {
        *src_ip
    } else {
        *dst_ip
    }
}

/// Index into the two-sided flow arrays. 0 = ToInternet side,
/// 1 = ToLocal side. Masked so the verifier can prove the bound.
#[inline(always)]
pub fn dir_index(effective: u32) -> usize {
    (effective.wrapping_sub(1) & 1) as usize
}

/// Per-packet metadata passed from the ingress hook to the egress hook,
/// written just ahead of the packet payload when the driver supports
/// head-room adjustment.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PacketMetadata {
    pub tc_handle: u32,
}

const _: () = {
    use core::mem::size_of;
    assert!(size_of::<ShapingMapping>() == 24);
    assert!(size_of::<PacketMetadata>() == 4);
};
