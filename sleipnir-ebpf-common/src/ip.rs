//! Canonical 128-bit addresses: one comparable key type for both IP
//! families.
//!
//! IPv4 addresses are folded into a reserved IPv6-shaped prefix: all twelve
//! high bytes are `0xFF`, the IPv4 address occupies the low 32 bits. This is
//! deliberately NOT the RFC 4291 v4-mapped prefix (`::ffff:0:0/96`), so
//! canonicalized v4 keys can never collide with real v6 traffic.

/// A canonical address, used as the key of every per-host map.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct CanonicalIp(pub [u8; 16]);

/// Number of leading `0xFF` bytes marking a canonicalized IPv4 address.
const V4_PREFIX_LEN: usize = 12;

impl CanonicalIp {
    /// Canonicalize an IPv4 address given as its four wire-order octets.
    #[inline(always)]
    pub fn from_v4_octets(octets: [u8; 4]) -> Self {
        let mut out = [0xFF_u8; 16];
        out[12] = octets[0];
        out[13] = octets[1];
        out[14] = octets[2];
        out[15] = octets[3];
        Self(out)
    }

    /// Canonicalize an IPv4 address read straight out of a packet header,
    /// i.e. the `saddr`/`daddr` field bytes interpreted as a native u32.
    #[inline(always)]
    pub fn from_v4_wire(addr: u32) -> Self {
        Self::from_v4_octets(addr.to_ne_bytes())
    }

    /// Canonicalize an IPv6 address. Unsurprisingly, a copy.
    #[inline(always)]
    pub fn from_v6_octets(octets: [u8; 16]) -> Self {
        Self(octets)
    }

    /// True when this key holds a canonicalized IPv4 address.
    #[inline(always)]
    pub fn is_v4(&self) -> bool {
        let mut i = 0;
        while i < V4_PREFIX_LEN {
            if self.0[i] != 0xFF {
                return false;
            }
            i += 1;
        }
        true
    }

    /// The low four octets (the embedded IPv4 address when `is_v4`).
    #[inline(always)]
    pub fn v4_octets(&self) -> [u8; 4] {
        [self.0[12], self.0[13], self.0[14], self.0[15]]
    }
}

#[cfg(any(test, feature = "std"))]
mod std_conv {
    use super::CanonicalIp;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    impl From<IpAddr> for CanonicalIp {
        fn from(ip: IpAddr) -> Self {
            match ip {
                IpAddr::V4(v4) => CanonicalIp::from_v4_octets(v4.octets()),
                IpAddr::V6(v6) => CanonicalIp::from_v6_octets(v6.octets()),
            }
        }
    }

    impl CanonicalIp {
        /// Decode back into a std address, undoing the v4 canonicalization.
        pub fn as_ip(&self) -> IpAddr {
            if self.is_v4() {
                let o = self.v4_octets();
                IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
            } else {
                IpAddr::V6(Ipv6Addr::from(self.0))
            }
        }
    }

    impl std::fmt::Display for CanonicalIp {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.as_ip().fmt(f)
        }
    }
}

/// SAFETY: `#[repr(transparent)]` over a byte array, fully initialized, no
/// padding.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for CanonicalIp {}
