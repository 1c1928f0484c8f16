//! Shared datapath logic for the sleipnir traffic shaper.
//!
//! This crate is `no_std` so it can be compiled for both targets:
//! - `bpfel-unknown-none` (the kernel-side XDP/TC programs in
//!   `sleipnir-ebpf-xdp`)
//! - the host target (the userspace loader in `sleipnir-ebpf`, and the
//!   test suite)
//!
//! It carries two kinds of code. First, the `#[repr(C)]` records that live
//! in shared BPF maps and ring buffers: their layouts are the kernel to
//! userspace ABI and are guarded by compile-time size assertions. Second,
//! the packet-processing logic itself (header dissection, flow tracking,
//! throughput accounting), written against raw `[start, end)` buffer
//! bounds so the exact same code runs under the BPF verifier and inside
//! ordinary unit tests.
//!
//! Enable the `aya` feature in the userspace crate to get the `aya::Pod`
//! impls required for reading values out of BPF maps.
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod bifrost;
pub mod dissector;
pub mod flow;
pub mod heimdall;
pub mod ip;
pub mod limits;
pub mod mapping;
pub mod tcp_opts;
pub mod throughput;
pub mod txq;

pub use dissector::PacketDissector;
pub use flow::{FlowEntry, FlowKey, RttEvent};
pub use ip::CanonicalIp;
pub use mapping::ShapingMapping;
pub use throughput::HostCounter;
