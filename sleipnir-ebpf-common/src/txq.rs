//! Per-CPU transmit-queue configuration, applied by the egress hook.

/// Value of `map_txq_config`, keyed on CPU id. Fixed at load time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TxqConfig {
    /// Hardware queue stamped onto the socket buffer. 0 = leave untouched.
    pub queue_mapping: u16,
    /// Major number of the HTB qdisc serving this CPU.
    pub htb_major: u16,
}

/// SAFETY: `#[repr(C)]`, `Copy`, two u16 fields, no padding.
#[cfg(feature = "aya")]
unsafe impl aya::Pod for TxqConfig {}
