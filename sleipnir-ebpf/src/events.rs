//! Ring-buffer consumers for the datapath's event streams.
//!
//! Both rings are drop-on-full at the kernel side: a missed event degrades
//! sampling quality, never correctness, so readers just skip anything
//! malformed.

use std::os::fd::{AsRawFd, RawFd};

use aya::maps::{MapData, RingBuf};
use tracing::warn;

use sleipnir_ebpf_common::flow::RttEvent;
use sleipnir_ebpf_common::heimdall::HeimdallEvent;

use crate::loader::Datapath;
use crate::ControlError;

/// Reader of the `flowbee_events` ring: one [`RttEvent`] per matched
/// timestamp echo.
pub struct RttEventStream {
    ring: RingBuf<MapData>,
}

impl RttEventStream {
    /// Drain the next pending event, if any. Non-blocking; use
    /// [`poll_fd`](Self::poll_fd) to wait for readiness.
    pub fn next(&mut self) -> Option<RttEvent> {
        while let Some(item) = self.ring.next() {
            match decode::<RttEvent>(&item) {
                Some(event) => return Some(event),
                None => warn!(len = item.len(), "undersized flow event skipped"),
            }
        }
        None
    }

    /// File descriptor to register with an event loop.
    pub fn poll_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }
}

/// Reader of the `heimdall_events` ring: full-capture packet mirrors for
/// watched addresses.
pub struct HeimdallEventStream {
    ring: RingBuf<MapData>,
}

impl HeimdallEventStream {
    pub fn next(&mut self) -> Option<HeimdallEvent> {
        while let Some(item) = self.ring.next() {
            match decode::<HeimdallEvent>(&item) {
                Some(event) => return Some(event),
                None => warn!(len = item.len(), "undersized heimdall event skipped"),
            }
        }
        None
    }

    pub fn poll_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }
}

fn decode<T: aya::Pod>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return None;
    }
    // Ring entries are not alignment-guaranteed; copy out unaligned.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

impl Datapath {
    /// Take ownership of the flow-event ring. Call once; the stream lives
    /// independently of further map access.
    pub fn take_rtt_events(&mut self) -> Result<RttEventStream, ControlError> {
        let map = self
            .ebpf
            .take_map("flowbee_events")
            .ok_or(ControlError::MapNotFound("flowbee_events"))?;
        let ring = RingBuf::try_from(map)
            .map_err(|source| ControlError::Map { name: "flowbee_events", source })?;
        Ok(RttEventStream { ring })
    }

    /// Take ownership of the heimdall capture ring.
    pub fn take_heimdall_events(&mut self) -> Result<HeimdallEventStream, ControlError> {
        let map = self
            .ebpf
            .take_map("heimdall_events")
            .ok_or(ControlError::MapNotFound("heimdall_events"))?;
        let ring = RingBuf::try_from(map)
            .map_err(|source| ControlError::Map { name: "heimdall_events", source })?;
        Ok(HeimdallEventStream { ring })
    }
}
