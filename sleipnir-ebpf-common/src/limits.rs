//! Sizing constants shared by the kernel maps and the userspace control
//! plane. These are part of the ABI: userspace sizes its buffers from them.

/// Maximum number of client IPs we are tracking.
pub const MAX_TRACKED_IPS: u32 = 64_000;

/// Maximum number of shaping (prefix -> class) entries in the LPM trie.
pub const MAX_SHAPED_PREFIXES: u32 = 64_000;

/// Maximum number of supported CPUs.
pub const MAX_CPUS: u32 = 1024;

/// Maximum number of flows to track at once.
pub const MAX_FLOWS: u32 = MAX_SHAPED_PREFIXES * 2;

/// Hot cache size (entries), fronting the LPM trie.
pub const HOT_CACHE_SIZE: u32 = 32_768;

/// Hot cache negative-hit flag, stored in the `cpu` field.
/// If you have 4294967294 CPUs, I love you.
pub const NEGATIVE_HIT: u32 = 0xFFFF_FFFE;

/// Byte size of each event ring buffer (flow RTT events, heimdall captures).
pub const EVENT_RING_BYTES: u32 = 256 * 1024;

/// Number of leading packet bytes captured by a full-capture heimdall event.
pub const PACKET_SNIPPET_BYTES: usize = 128;
