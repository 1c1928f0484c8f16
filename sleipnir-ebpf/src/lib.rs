// eBPF/XDP is Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]

//! Userspace side of the sleipnir datapath: loading and attaching the
//! kernel programs, the shaping-table update protocol (trie write, hot
//! cache clear, epoch bump - in that order), ring-buffer event readers,
//! and the framed map-streaming format consumed by collectors.

pub mod control;
pub mod events;
pub mod iteration;
pub mod loader;

pub use loader::{Datapath, DatapathConfig, Direction};

/// Errors from loading and attaching the datapath.
#[derive(Debug, thiserror::Error)]
pub enum DatapathError {
    #[error("failed to read BPF object {path}: {source}")]
    ReadObject {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("program '{0}' not found in BPF object")]
    ProgramNotFound(&'static str),

    #[error("program '{name}' has the wrong type: {source}")]
    ProgramType {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to load program '{name}' into the kernel: {source}")]
    ProgramLoad {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to attach '{name}' to {interface}: {source}")]
    Attach {
        name: &'static str,
        interface: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to create clsact qdisc on {interface}: {source}")]
    Qdisc {
        interface: String,
        source: std::io::Error,
    },

    #[error("failed to create map pin directory {path}: {source}")]
    PinDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("could not determine CPU count: {0}")]
    CpuCount(std::io::Error),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Errors from control-plane map writes.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("map '{0}' not found in loaded object")]
    MapNotFound(&'static str),

    #[error("map '{name}': {source}")]
    Map {
        name: &'static str,
        #[source]
        source: aya::maps::MapError,
    },
}

/// Errors from the framed map streams.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream preamble is malformed (cpu counts {0} and {1} disagree)")]
    BadPreamble(u32, u32),

    #[error("truncated record at byte offset {0}")]
    Truncated(u64),
}
