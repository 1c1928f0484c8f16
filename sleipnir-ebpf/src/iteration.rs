//! The framed map-streaming protocol: throughput and flow tables as flat
//! records on any byte stream.
//!
//! Throughput framing: a u32 CPU count written twice (the repeat keeps the
//! records 8-byte aligned), then per host the 16-byte canonical address
//! followed by one `HostCounter` per CPU. Flow framing has no preamble;
//! each record is a `FlowKey` followed by its `FlowEntry`. All fields are
//! the in-kernel byte images - userspace mirrors the exact offsets.

use std::io::{Read, Write};

use aya::maps::{HashMap, PerCpuHashMap};
use aya::Pod;

use sleipnir_ebpf_common::flow::{FlowEntry, FlowKey};
use sleipnir_ebpf_common::ip::CanonicalIp;
use sleipnir_ebpf_common::throughput::HostCounter;

use crate::loader::Datapath;
use crate::{ControlError, DatapathError, StreamError};

fn as_bytes<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: Pod types are plain bytes with no padding surprises.
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

fn from_bytes<T: Pod>(bytes: &[u8]) -> T {
    debug_assert!(bytes.len() >= std::mem::size_of::<T>());
    // SAFETY: length checked by every caller; unaligned read is fine for Pod.
    unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) }
}

/// Read a full record into `buf`, or report a clean end-of-stream before
/// the first byte. A partial record is a `Truncated` error.
fn read_record<R: Read>(r: &mut R, buf: &mut [u8], offset: &mut u64) -> Result<bool, StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(StreamError::Truncated(*offset + filled as u64));
        }
        filled += n;
    }
    *offset += buf.len() as u64;
    Ok(true)
}

// ── Throughput stream ────────────────────────────────────────────────────────

/// One host's worth of the throughput stream: the canonical address and the
/// per-CPU counter instances (sum them for totals).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThroughputRecord {
    pub ip: CanonicalIp,
    pub counters: Vec<HostCounter>,
}

impl ThroughputRecord {
    /// Sum of the per-CPU instances.
    pub fn total(&self) -> HostCounter {
        let mut total = HostCounter::default();
        for c in &self.counters {
            total.download_bytes += c.download_bytes;
            total.upload_bytes += c.upload_bytes;
            total.download_packets += c.download_packets;
            total.upload_packets += c.upload_packets;
            total.tcp_download_packets += c.tcp_download_packets;
            total.tcp_upload_packets += c.tcp_upload_packets;
            total.udp_download_packets += c.udp_download_packets;
            total.udp_upload_packets += c.udp_upload_packets;
            total.icmp_download_packets += c.icmp_download_packets;
            total.icmp_upload_packets += c.icmp_upload_packets;
            if c.last_seen > total.last_seen {
                total.last_seen = c.last_seen;
                total.tc_handle = c.tc_handle;
                total.circuit_id = c.circuit_id;
                total.device_id = c.device_id;
            }
        }
        total
    }
}

/// Serialize the throughput table. Each record carries exactly `num_cpus`
/// counters: missing instances are zero-filled, extras dropped.
pub fn write_throughput_stream<W: Write>(
    writer: &mut W,
    num_cpus: u32,
    records: impl IntoIterator<Item = (CanonicalIp, Vec<HostCounter>)>,
) -> Result<(), StreamError> {
    writer.write_all(&num_cpus.to_ne_bytes())?;
    writer.write_all(&num_cpus.to_ne_bytes())?; // repeated for alignment
    let zero = HostCounter::default();
    for (ip, counters) in records {
        writer.write_all(&ip.0)?;
        for cpu in 0..num_cpus as usize {
            writer.write_all(as_bytes(counters.get(cpu).unwrap_or(&zero)))?;
        }
    }
    Ok(())
}

/// Parse a throughput stream back into records.
pub fn read_throughput_stream<R: Read>(reader: &mut R) -> Result<Vec<ThroughputRecord>, StreamError> {
    let mut first_word = [0u8; 4];
    let mut second_word = [0u8; 4];
    reader.read_exact(&mut first_word)?;
    reader.read_exact(&mut second_word)?;
    let first = u32::from_ne_bytes(first_word);
    let second = u32::from_ne_bytes(second_word);
    if first != second {
        return Err(StreamError::BadPreamble(first, second));
    }
    let num_cpus = first as usize;

    let mut offset = 8u64;
    let mut records = Vec::new();
    let mut ip_buf = [0u8; 16];
    let mut counter_buf = vec![0u8; std::mem::size_of::<HostCounter>()];
    while read_record(reader, &mut ip_buf, &mut offset)? {
        let mut counters = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            if !read_record(reader, &mut counter_buf, &mut offset)? {
                return Err(StreamError::Truncated(offset));
            }
            counters.push(from_bytes::<HostCounter>(&counter_buf));
        }
        records.push(ThroughputRecord { ip: CanonicalIp(ip_buf), counters });
    }
    Ok(records)
}

// ── Flow stream ──────────────────────────────────────────────────────────────

/// Serialize the flow table: `(key, entry)` byte-wise, no preamble.
pub fn write_flow_stream<W: Write>(
    writer: &mut W,
    records: impl IntoIterator<Item = (FlowKey, FlowEntry)>,
) -> Result<(), StreamError> {
    for (key, entry) in records {
        writer.write_all(as_bytes(&key))?;
        writer.write_all(as_bytes(&entry))?;
    }
    Ok(())
}

/// Parse a flow stream back into records.
pub fn read_flow_stream<R: Read>(reader: &mut R) -> Result<Vec<(FlowKey, FlowEntry)>, StreamError> {
    let mut offset = 0u64;
    let mut records = Vec::new();
    let mut key_buf = vec![0u8; std::mem::size_of::<FlowKey>()];
    let mut entry_buf = vec![0u8; std::mem::size_of::<FlowEntry>()];
    while read_record(reader, &mut key_buf, &mut offset)? {
        if !read_record(reader, &mut entry_buf, &mut offset)? {
            return Err(StreamError::Truncated(offset));
        }
        records.push((from_bytes::<FlowKey>(&key_buf), from_bytes::<FlowEntry>(&entry_buf)));
    }
    Ok(records)
}

// ── Map-backed adapters ──────────────────────────────────────────────────────

impl Datapath {
    /// Stream the live throughput table in the framed format.
    pub fn stream_throughput<W: Write>(&self, writer: &mut W) -> Result<(), DatapathError> {
        let cpus = aya::util::nr_cpus().map_err(|(_, e)| DatapathError::CpuCount(e))? as u32;
        let map = self
            .ebpf
            .map("map_traffic")
            .ok_or(ControlError::MapNotFound("map_traffic"))?;
        let traffic: PerCpuHashMap<_, CanonicalIp, HostCounter> = PerCpuHashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "map_traffic", source })?;
        let records = traffic
            .iter()
            .filter_map(Result::ok)
            .map(|(ip, values)| (ip, values.iter().copied().collect()));
        write_throughput_stream(writer, cpus, records)?;
        Ok(())
    }

    /// Stream the live flow table in the framed format.
    pub fn stream_flows<W: Write>(&self, writer: &mut W) -> Result<(), DatapathError> {
        let map = self
            .ebpf
            .map("flowbee")
            .ok_or(ControlError::MapNotFound("flowbee"))?;
        let flows: HashMap<_, FlowKey, FlowEntry> = HashMap::try_from(map)
            .map_err(|source| ControlError::Map { name: "flowbee", source })?;
        write_flow_stream(writer, flows.iter().filter_map(Result::ok))?;
        Ok(())
    }
}
