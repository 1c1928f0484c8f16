//! TCP option walk: extracts the timestamp option (TSval/TSecr).

use crate::dissector::{PacketBounds, TCP_HDR_LEN};

/// Upper bound on the option walk; anything beyond is ignored.
pub const MAX_TCP_OPTIONS: usize = 10;

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_TIMESTAMP: u8 = 8;
const TCPOLEN_TIMESTAMP: u8 = 10;

/// Parse the TSval and TSecr values from the TCP options field, returned in
/// host byte order. `l4_offset` locates the TCP header inside `bounds`;
/// `doff_bytes` is the header length claimed by the data-offset field.
///
/// Walks at most [`MAX_TCP_OPTIONS`] options. An option with a stated
/// length below 2 aborts the parse.
pub fn parse_tcp_ts(bounds: &PacketBounds, l4_offset: usize, doff_bytes: usize) -> Option<(u32, u32)> {
    if doff_bytes <= TCP_HDR_LEN {
        return None;
    }
    let opt_end = l4_offset + doff_bytes;
    let mut pos = l4_offset + TCP_HDR_LEN;

    for _ in 0..MAX_TCP_OPTIONS {
        if pos + 1 > opt_end {
            return None;
        }
        let kind = unsafe { *bounds.ptr_at::<u8>(pos)? };
        match kind {
            TCPOPT_EOL => return None,
            TCPOPT_NOP => {
                pos += 1;
                continue;
            }
            _ => {}
        }

        // Option > 1, should have an option size
        if pos + 2 > opt_end {
            return None;
        }
        let opt_size = unsafe { *bounds.ptr_at::<u8>(pos + 1)? };
        if opt_size < 2 {
            return None;
        }

        if kind == TCPOPT_TIMESTAMP && opt_size == TCPOLEN_TIMESTAMP {
            if pos + TCPOLEN_TIMESTAMP as usize > opt_end {
                return None;
            }
            let tsval = unsafe { *bounds.ptr_at::<[u8; 4]>(pos + 2)? };
            let tsecr = unsafe { *bounds.ptr_at::<[u8; 4]>(pos + 6)? };
            return Some((u32::from_be_bytes(tsval), u32::from_be_bytes(tsecr)));
        }

        pos += opt_size as usize;
    }
    None
}
