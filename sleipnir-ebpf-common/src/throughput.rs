//! Per-host throughput counters, split by direction and protocol.
//!
//! One [`HostCounter`] exists per observed subscriber address per CPU (the
//! map is per-CPU; userspace sums the instances at read time), so updates
//! need no synchronization.

use crate::dissector::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::mapping::{ShapingMapping, TO_INTERNET};

/// Counter for each host. The trailing `_reserved` keeps the layout free of
/// implicit padding; the record is streamed byte-wise to userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCounter {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub download_packets: u64,
    pub upload_packets: u64,
    pub tcp_download_packets: u64,
    pub tcp_upload_packets: u64,
    pub udp_download_packets: u64,
    pub udp_upload_packets: u64,
    pub icmp_download_packets: u64,
    pub icmp_upload_packets: u64,
    pub circuit_id: u64,
    pub device_id: u64,
    pub last_seen: u64,
    pub tc_handle: u32,
    pub _reserved: u32,
}

/// SAFETY: `#[repr(C)]`, `Copy`, explicit padding only.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for HostCounter {}

impl HostCounter {
    /// Count one packet. The resolver outputs are rewritten every time so
    /// userspace can correlate traffic with the current shaping policy
    /// without a second lookup.
    #[inline(always)]
    pub fn record(
        &mut self,
        effective: u32,
        size: u32,
        ip_protocol: u8,
        now: u64,
        mapping: &ShapingMapping,
    ) {
        self.last_seen = now;
        self.tc_handle = mapping.tc_handle;
        self.circuit_id = mapping.circuit_id;
        self.device_id = mapping.device_id;
        if effective == TO_INTERNET {
            self.upload_packets += 1;
            self.upload_bytes += size as u64;
            match ip_protocol {
                IPPROTO_TCP => self.tcp_upload_packets += 1,
                IPPROTO_UDP => self.udp_upload_packets += 1,
                IPPROTO_ICMP => self.icmp_upload_packets += 1,
                _ => {}
            }
        } else {
            self.download_packets += 1;
            self.download_bytes += size as u64;
            match ip_protocol {
                IPPROTO_TCP => self.tcp_download_packets += 1,
                IPPROTO_UDP => self.udp_download_packets += 1,
                IPPROTO_ICMP => self.icmp_download_packets += 1,
                _ => {}
            }
        }
    }
}

const _: () = {
    assert!(core::mem::size_of::<HostCounter>() == 112);
};
