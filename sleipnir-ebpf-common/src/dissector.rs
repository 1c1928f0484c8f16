//! Packet dissector. We don't have any help from the kernel stack at this
//! point: every header is located by hand, and every access is preceded by
//! an explicit bounds check against the end of the buffer.
//!
//! The dissector walks Ethernet and up to [`MAX_HEADER_SHELLS`] outer
//! shells (VLAN, PPPoE session, MPLS) to find the L3 header, canonicalizes
//! the addresses, and snoops the L4 header for ports, TCP flags and the
//! timestamp option. It never mutates the packet, with one exception: the
//! inner VLAN tag rewrite performed when the caller supplies a
//! [`VlanRemapper`].

use crate::ip::CanonicalIp;
use crate::tcp_opts::parse_tcp_ts;

// ── Ethertypes and IP protocols (host byte order) ───────────────────────────

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;
pub const ETH_P_PPP_SES: u16 = 0x8864;
pub const ETH_P_MPLS_UC: u16 = 0x8847;
pub const ETH_P_MPLS_MC: u16 = 0x8848;
/// Anything below this is an 802.3 length field, not an ethertype.
pub const ETH_P_802_3_MIN: u16 = 0x0600;
/// IS-IS runs directly over 802.3; the kernel uses this fictitious marker.
pub const ETH_P_ISIS: u16 = 0xFEFE;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// PPPoE session payload protocols.
const PPP_IP: u16 = 0x21;
const PPP_IPV6: u16 = 0x57;
const PPPOE_SES_HLEN: usize = 8;

/// MPLS bottom-of-stack bit (host order).
const MPLS_LS_S_MASK: u32 = 0x0000_0100;

/// Upper bound on the outer-header walk. The eleventh shell is unparseable.
pub const MAX_HEADER_SHELLS: usize = 10;

// ── TCP flag bitset, packed into `PacketDissector::tcp_flags` ───────────────

pub const TCP_FLAG_FIN: u8 = 1;
pub const TCP_FLAG_SYN: u8 = 2;
pub const TCP_FLAG_RST: u8 = 4;
pub const TCP_FLAG_PSH: u8 = 8;
pub const TCP_FLAG_ACK: u8 = 16;
pub const TCP_FLAG_URG: u8 = 32;
pub const TCP_FLAG_ECE: u8 = 64;
pub const TCP_FLAG_CWR: u8 = 128;

// ── Raw buffer access ────────────────────────────────────────────────────────

/// The `[start, end)` byte range of a packet, as raw addresses. In the
/// kernel programs these come from `ctx.data()`/`ctx.data_end()`; in tests
/// they come from a slice.
#[derive(Clone, Copy, Debug)]
pub struct PacketBounds {
    pub start: usize,
    pub end: usize,
}

impl PacketBounds {
    /// Borrow a slice as packet bounds. The bounds are only valid while the
    /// slice is.
    pub fn of_slice(data: &[u8]) -> Self {
        let start = data.as_ptr() as usize;
        Self { start, end: start + data.len() }
    }

    /// Mutable variant for callers that allow the VLAN rewrite.
    pub fn of_mut_slice(data: &mut [u8]) -> Self {
        let start = data.as_mut_ptr() as usize;
        Self { start, end: start + data.len() }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns a const pointer to `T` at `offset` bytes from the start of
    /// the packet, or `None` if the access would exceed `end`.
    ///
    /// The BPF verifier accepts this pattern (explicit bounds check before
    /// the cast).
    ///
    /// # Safety
    /// The bounds must denote live, readable memory for the lifetime of the
    /// returned pointer.
    #[inline(always)]
    pub unsafe fn ptr_at<T>(&self, offset: usize) -> Option<*const T> {
        let access_end = self.start.checked_add(offset)?.checked_add(core::mem::size_of::<T>())?;
        if access_end > self.end {
            return None;
        }
        Some(self.start.checked_add(offset)? as *const T)
    }

    /// Mutable variant of [`ptr_at`](Self::ptr_at), used only for the VLAN
    /// tag rewrite.
    ///
    /// # Safety
    /// As for `ptr_at`, plus the memory must be writable.
    #[inline(always)]
    pub unsafe fn ptr_at_mut<T>(&self, offset: usize) -> Option<*mut T> {
        self.ptr_at::<T>(offset).map(|p| p as *mut T)
    }

    /// Bounds-checked by-value read. Packet buffers carry no alignment
    /// promise, so the copy is unaligned.
    ///
    /// # Safety
    /// As for `ptr_at`.
    #[inline(always)]
    pub unsafe fn load<T>(&self, offset: usize) -> Option<T> {
        self.ptr_at::<T>(offset).map(|p| core::ptr::read_unaligned(p))
    }
}

// ── Network header definitions ───────────────────────────────────────────────
//
// Minimal wire-layout mirrors of the UAPI network headers. Multi-byte fields
// hold network byte order unless an accessor says otherwise.

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EthHdr {
    pub h_dest: [u8; 6],
    pub h_source: [u8; 6],
    pub h_proto: u16,
}

pub const ETH_HDR_LEN: usize = 14;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VlanHdr {
    /// Tag control information: PCP/DEI/VID.
    pub tci: u16,
    pub encapsulated_proto: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PppoeHdr {
    pub version_type: u8,
    pub code: u8,
    pub session_id: u16,
    pub length: u16,
    pub proto: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MplsLabel {
    pub entry: u32,
}

/// Minimal IPv4 header (options accounted for via `ihl`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ipv4Hdr {
    pub version_ihl: u8,
    pub tos: u8,
    pub tot_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub check: u16,
    pub saddr: u32,
    pub daddr: u32,
}

impl Ipv4Hdr {
    #[inline(always)]
    pub fn ihl(&self) -> usize {
        (self.version_ihl & 0x0F) as usize
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ipv6Hdr {
    pub version_priority: u8,
    pub flow_lbl: [u8; 3],
    pub payload_len: u16,
    pub nexthdr: u8,
    pub hop_limit: u8,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
}

pub const IPV6_HDR_LEN: usize = 40;

/// Minimal TCP header (fixed 20 bytes).
///
/// Bytes 12-13 encode `doff` and the flag bits. As a LE u16 (low byte first
/// in memory):
///   bits [0-3]  = reserved
///   bits [4-7]  = doff (data offset)
///   bits [8]    = FIN
///   bits [9]    = SYN
///   bits [10]   = RST
///   bits [11]   = PSH
///   bits [12]   = ACK
///   bits [13]   = URG
///   bits [14]   = ECE
///   bits [15]   = CWR
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TcpHdr {
    pub source: u16,
    pub dest: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub offset_flags: u16,
    pub window: u16,
    pub check: u16,
    pub urg_ptr: u16,
}

pub const TCP_HDR_LEN: usize = 20;

impl TcpHdr {
    #[inline(always)]
    pub fn doff(&self) -> usize {
        ((self.offset_flags >> 4) & 0xF) as usize
    }

    /// fin/syn/rst/psh/ack/urg/ece/cwr packed into the `TCP_FLAG_*` bitset.
    #[inline(always)]
    pub fn flag_bits(&self) -> u8 {
        let mut flags = 0u8;
        if (self.offset_flags >> 8) & 1 != 0 {
            flags |= TCP_FLAG_FIN;
        }
        if (self.offset_flags >> 9) & 1 != 0 {
            flags |= TCP_FLAG_SYN;
        }
        if (self.offset_flags >> 10) & 1 != 0 {
            flags |= TCP_FLAG_RST;
        }
        if (self.offset_flags >> 11) & 1 != 0 {
            flags |= TCP_FLAG_PSH;
        }
        if (self.offset_flags >> 12) & 1 != 0 {
            flags |= TCP_FLAG_ACK;
        }
        if (self.offset_flags >> 13) & 1 != 0 {
            flags |= TCP_FLAG_URG;
        }
        if (self.offset_flags >> 14) & 1 != 0 {
            flags |= TCP_FLAG_ECE;
        }
        if (self.offset_flags >> 15) & 1 != 0 {
            flags |= TCP_FLAG_CWR;
        }
        flags
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct UdpHdr {
    pub source: u16,
    pub dest: u16,
    pub len: u16,
    pub check: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IcmpHdr {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: u32,
}

// ── VLAN rewrite hook ────────────────────────────────────────────────────────

/// Lookup of the bifrost VLAN rewrite table. The kernel side backs this with
/// the `bifrost_vlan_map`; tests back it with a plain table. Tags are host
/// order on both sides.
pub trait VlanRemapper {
    fn remap(&self, ifindex: u32, vlan: u16) -> Option<u16>;
}

/// A remapper that never matches, for callers without a VLAN table.
pub struct NoVlanRemap;

impl VlanRemapper for NoVlanRemap {
    #[inline(always)]
    fn remap(&self, _ifindex: u32, _vlan: u16) -> Option<u16> {
        None
    }
}

// ── The dissector ────────────────────────────────────────────────────────────

/// Everything the rest of the datapath needs to know about one packet.
///
/// Addresses are canonical. Ports, the sequence number, the window and the
/// timestamp option values are converted to host order during the parse;
/// `current_vlan` keeps the frame's network byte order so it can be compared
/// against the big-endian load-time VLAN globals.
#[derive(Clone, Copy, Debug)]
pub struct PacketDissector {
    pub bounds: PacketBounds,
    /// Monotonic boot-time timestamp supplied by the caller.
    pub now: u64,
    pub skb_len: u32,
    pub l3_offset: usize,
    pub l4_offset: usize,
    pub eth_type: u16,
    /// Inner VLAN TCI, network byte order. 0 when untagged.
    pub current_vlan: u16,
    pub src_ip: CanonicalIp,
    pub dst_ip: CanonicalIp,
    pub ip_protocol: u8,
    pub tos: u8,
    /// IPv4 fragment-control bits (RF/DF/MF); 0 for IPv6.
    pub ip_flags: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub window: u16,
    pub tcp_flags: u8,
    pub tcp_has_payload: bool,
    pub sequence: u32,
    pub tsval: u32,
    pub tsecr: u32,
}

impl PacketDissector {
    /// Connect a packet buffer to a new dissector. Fails if there is no room
    /// for an Ethernet header.
    ///
    /// # Safety
    /// `bounds` must denote live memory for the lifetime of the dissector
    /// (the XDP/TC context guarantees this in the kernel; tests keep the
    /// backing slice alive).
    pub unsafe fn new(bounds: PacketBounds, now: u64) -> Option<Self> {
        if bounds.ptr_at::<EthHdr>(0).is_none() {
            return None;
        }
        Some(Self {
            bounds,
            now,
            skb_len: bounds.len() as u32,
            l3_offset: 0,
            l4_offset: 0,
            eth_type: 0,
            current_vlan: 0,
            src_ip: CanonicalIp::default(),
            dst_ip: CanonicalIp::default(),
            ip_protocol: 0,
            tos: 0,
            ip_flags: 0,
            src_port: 0,
            dst_port: 0,
            window: 0,
            tcp_flags: 0,
            tcp_has_payload: false,
            sequence: 0,
            tsval: 0,
            tsecr: 0,
        })
    }

    /// Locate the layer-3 offset, walking VLAN / PPPoE / MPLS shells.
    /// Fast returns for various common non-IP types.
    ///
    /// When `remap` has a rule for the inner VLAN of this frame, the tag is
    /// rewritten in place. This is the only packet mutation in the
    /// dissector, and it is idempotent once applied.
    pub fn find_l3_offset<R: VlanRemapper>(&mut self, ifindex: u32, remap: Option<&R>) -> bool {
        let eth = match unsafe { self.bounds.load::<EthHdr>(0) } {
            Some(h) => h,
            None => return false,
        };
        let mut offset = ETH_HDR_LEN;
        let mut eth_type = u16::from_be(eth.h_proto);

        // Fast return for unwrapped IP
        if eth_type == ETH_P_IP || eth_type == ETH_P_IPV6 {
            self.eth_type = eth_type;
            self.l3_offset = offset;
            return true;
        }

        // Fast return for ARP and non-802.3 ether types
        if eth_type == ETH_P_ARP || eth_type < ETH_P_802_3_MIN || eth_type == ETH_P_ISIS {
            return false;
        }

        // Walk the shells until we find IP
        let mut i = 0;
        while i < MAX_HEADER_SHELLS && !is_ip(eth_type) {
            match eth_type {
                ETH_P_8021Q | ETH_P_8021AD => {
                    let vlan = match unsafe { self.bounds.load::<VlanHdr>(offset) } {
                        Some(h) => h,
                        None => return false,
                    };
                    self.current_vlan = vlan.tci;
                    eth_type = u16::from_be(vlan.encapsulated_proto);
                    if let Some(remap) = remap {
                        let tag = u16::from_be(self.current_vlan);
                        if let Some(new_tag) = remap.remap(ifindex, tag) {
                            if let Some(p) = unsafe { self.bounds.ptr_at_mut::<VlanHdr>(offset) } {
                                unsafe {
                                    core::ptr::addr_of_mut!((*p).tci)
                                        .write_unaligned(new_tag.to_be());
                                }
                                self.current_vlan = new_tag.to_be();
                            }
                        }
                    }
                    offset += core::mem::size_of::<VlanHdr>();
                }
                ETH_P_PPP_SES => {
                    let pppoe = match unsafe { self.bounds.load::<PppoeHdr>(offset) } {
                        Some(h) => h,
                        None => return false,
                    };
                    eth_type = match u16::from_be(pppoe.proto) {
                        PPP_IP => ETH_P_IP,
                        PPP_IPV6 => ETH_P_IPV6,
                        _ => return false,
                    };
                    offset += PPPOE_SES_HLEN;
                }
                ETH_P_MPLS_UC | ETH_P_MPLS_MC => {
                    let mpls = match unsafe { self.bounds.load::<MplsLabel>(offset) } {
                        Some(h) => h,
                        None => return false,
                    };
                    offset += core::mem::size_of::<MplsLabel>();
                    // At the bottom of the stack, sniff the IP version from
                    // the first payload nibble.
                    if u32::from_be(mpls.entry) & MPLS_LS_S_MASK != 0 {
                        let first = match unsafe { self.bounds.load::<u8>(offset) } {
                            Some(b) => b,
                            None => return false,
                        };
                        eth_type = match first >> 4 {
                            4 => ETH_P_IP,
                            6 => ETH_P_IPV6,
                            _ => return false,
                        };
                    }
                }
                // Something we don't know how to handle - bail out
                _ => return false,
            }
            i += 1;
        }

        if !is_ip(eth_type) {
            return false;
        }
        self.l3_offset = offset;
        self.eth_type = eth_type;
        true
    }

    /// Parse the L3 header at the offset found by `find_l3_offset`, then
    /// snoop the L4 header for TCP/UDP/ICMP.
    pub fn find_ip_header(&mut self) -> bool {
        match self.eth_type {
            ETH_P_IP => {
                let ip = match unsafe { self.bounds.load::<Ipv4Hdr>(self.l3_offset) } {
                    Some(h) => h,
                    None => return false,
                };
                let ihl_bytes = ip.ihl() * 4;
                if ihl_bytes < core::mem::size_of::<Ipv4Hdr>() {
                    return false;
                }
                self.src_ip = CanonicalIp::from_v4_wire(ip.saddr);
                self.dst_ip = CanonicalIp::from_v4_wire(ip.daddr);
                self.ip_protocol = ip.protocol;
                self.tos = ip.tos;
                self.ip_flags = (u16::from_be(ip.frag_off) >> 13) as u8;
                self.l4_offset = self.l3_offset + ihl_bytes;
                self.snoop();
                true
            }
            ETH_P_IPV6 => {
                let ip = match unsafe { self.bounds.load::<Ipv6Hdr>(self.l3_offset) } {
                    Some(h) => h,
                    None => return false,
                };
                self.src_ip = CanonicalIp::from_v6_octets(ip.saddr);
                self.dst_ip = CanonicalIp::from_v6_octets(ip.daddr);
                self.ip_protocol = ip.nexthdr;
                self.tos = ip.flow_lbl[0];
                self.l4_offset = self.l3_offset + IPV6_HDR_LEN;
                self.snoop();
                true
            }
            _ => false,
        }
    }

    /// Extract ports and TCP state from the L4 header. Short packets leave
    /// the fields at their defaults rather than failing the dissection.
    fn snoop(&mut self) {
        match self.ip_protocol {
            IPPROTO_TCP => {
                let tcp = match unsafe { self.bounds.load::<TcpHdr>(self.l4_offset) } {
                    Some(h) => h,
                    None => return,
                };
                self.src_port = u16::from_be(tcp.source);
                self.dst_port = u16::from_be(tcp.dest);
                self.tcp_flags = tcp.flag_bits();
                self.window = u16::from_be(tcp.window);
                self.sequence = u32::from_be(tcp.seq);
                let doff_bytes = tcp.doff() * 4;
                if doff_bytes < TCP_HDR_LEN {
                    return;
                }
                self.tcp_has_payload =
                    self.l4_offset + doff_bytes < self.skb_len as usize;
                if let Some((tsval, tsecr)) =
                    parse_tcp_ts(&self.bounds, self.l4_offset, doff_bytes)
                {
                    self.tsval = tsval;
                    self.tsecr = tsecr;
                }
            }
            IPPROTO_UDP => {
                let udp = match unsafe { self.bounds.load::<UdpHdr>(self.l4_offset) } {
                    Some(h) => h,
                    None => return,
                };
                self.src_port = u16::from_be(udp.source);
                self.dst_port = u16::from_be(udp.dest);
            }
            IPPROTO_ICMP => {
                let icmp = match unsafe { self.bounds.load::<IcmpHdr>(self.l4_offset) } {
                    Some(h) => h,
                    None => return,
                };
                // Type and code stand in for the ports.
                self.src_port = icmp.icmp_type as u16;
                self.dst_port = icmp.code as u16;
            }
            _ => {}
        }
    }

    #[inline(always)]
    pub fn is_tcp(&self) -> bool {
        self.ip_protocol == IPPROTO_TCP
    }

    #[inline(always)]
    pub fn tcp_flag(&self, flag: u8) -> bool {
        self.tcp_flags & flag != 0
    }
}

#[inline(always)]
fn is_ip(eth_type: u16) -> bool {
    eth_type == ETH_P_IP || eth_type == ETH_P_IPV6
}

const _: () = {
    use core::mem::size_of;
    assert!(size_of::<EthHdr>() == ETH_HDR_LEN);
    assert!(size_of::<VlanHdr>() == 4);
    assert!(size_of::<PppoeHdr>() == 8);
    assert!(size_of::<Ipv4Hdr>() == 20);
    assert!(size_of::<Ipv6Hdr>() == IPV6_HDR_LEN);
    assert!(size_of::<TcpHdr>() == TCP_HDR_LEN);
    assert!(size_of::<UdpHdr>() == 8);
    assert!(size_of::<IcmpHdr>() == 8);
};
