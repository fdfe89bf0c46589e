//! `vellum` is a write-ahead log allocator: it hands out contiguous,
//! monotonically numbered regions of a logical log to concurrent producers,
//! stages the bytes in a fixed-size ring buffer, and flushes them to
//! segment files from a single background daemon that publishes a durable
//! watermark producers may wait on.
//!
//! ```
//! let config = vellum::Config::default()
//!     .temporary(true)
//!     .segment_size(1024 * 1024)
//!     .log_buf_size(64 * 1024);
//!
//! let log = config.open().unwrap();
//!
//! // reserve a block with one record slot and 64 payload bytes
//! let mut alloc = log.allocate(1, 64).unwrap();
//! let lsn = alloc.lsn();
//! alloc.payload()[..2].copy_from_slice(b"hi");
//! alloc.finalize();
//! log.release(alloc);
//!
//! log.wait_for_durable(lsn.offset + 1);
//! assert!(log.dur_lsn_offset() > lsn.offset);
//! ```
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod allocator;
mod block;
mod block_list;
mod config;
mod daemon;
mod result;
mod ring_buffer;
mod segment;

pub use self::{
    allocator::{Allocation, LogAllocator},
    block::{
        block_size, BLOCK_HEADER_LEN, MIN_LOG_BLOCK_SIZE, RECORD_SKIP,
        RECORD_SLOT_LEN,
    },
    config::Config,
    result::{Error, Result},
};

pub(crate) use self::{ring_buffer::RingBuffer, segment::SegmentManager};

use std::fmt;

/// An absolute byte position in the logical, segment-agnostic log.
/// Monotone; forms the identity of every allocation.
pub type LsnOffset = u64;

/// A number identifying one segment in the fixed segment ring.
pub type SegmentNumber = u32;

/// A log sequence number: an [`LsnOffset`] stamped with the segment
/// that physically contains it.
#[derive(Debug, Clone, Copy)]
pub struct Lsn {
    /// The containing segment.
    pub segnum: SegmentNumber,
    /// The absolute byte position in the logical log.
    pub offset: LsnOffset,
}

impl Lsn {
    pub(crate) const fn new(segnum: SegmentNumber, offset: LsnOffset) -> Lsn {
        Lsn { segnum, offset }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segnum, self.offset)
    }
}

// segment numbers recycle; the offset is the identity
impl PartialEq for Lsn {
    fn eq(&self, other: &Lsn) -> bool {
        self.offset == other.offset
    }
}

impl Eq for Lsn {}

impl PartialOrd for Lsn {
    fn partial_cmp(&self, other: &Lsn) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lsn {
    fn cmp(&self, other: &Lsn) -> std::cmp::Ordering {
        self.offset.cmp(&other.offset)
    }
}

pub(crate) fn crc32(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf);
    hasher.finalize()
}

pub(crate) const fn u32_to_arr(u: u32) -> [u8; 4] {
    u.to_le_bytes()
}

pub(crate) fn arr_to_u32(arr: &[u8]) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&arr[..4]);
    u32::from_le_bytes(buf)
}

pub(crate) const fn u64_to_arr(u: u64) -> [u8; 8] {
    u.to_le_bytes()
}

pub(crate) fn arr_to_u64(arr: &[u8]) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&arr[..8]);
    u64::from_le_bytes(buf)
}

/// Terminate the process. Used on paths where continuing would
/// leave reserved log space uninitialized, which a recovery scan
/// would interpret as the end of the log.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal: {}", msg);
    std::process::abort();
}

#[cfg(test)]
pub(crate) fn debug_delay() {
    use rand::Rng;

    if rand::thread_rng().gen_ratio(1, 1000) {
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

#[cfg(not(test))]
pub(crate) const fn debug_delay() {}
