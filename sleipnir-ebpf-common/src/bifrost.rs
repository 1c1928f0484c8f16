//! Bifrost: the per-ingress-interface redirect tables that bypass the host
//! bridge, plus the VLAN rewrite rules the dissector applies in place.

/// A bridge-free redirect rule, keyed on the source interface index.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BifrostInterface {
    /// The interface index frames should be redirected out of.
    pub redirect_to: u32,
    /// Scan for VLAN tags and only redirect tagged frames.
    /// > 0 = true; 32-bit for padding reasons.
    pub scan_vlans: u32,
}

/// SAFETY: `#[repr(C)]`, `Copy`, two u32 fields, no padding.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for BifrostInterface {}

/// Which VLAN should the keyed VLAN be rewritten to?
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BifrostVlan {
    pub redirect_to: u32,
}

/// SAFETY: `#[repr(C)]`, `Copy`, a single u32.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for BifrostVlan {}

/// Key of the VLAN rewrite map: interface index in the high half, the
/// (host-order) VLAN tag in the low half.
#[inline(always)]
pub fn vlan_map_key(ifindex: u32, vlan: u16) -> u32 {
    (ifindex << 16) | vlan as u32
}

/// Maximum interface/VLAN redirect rules.
pub const MAX_REDIRECT_RULES: u32 = 64;
