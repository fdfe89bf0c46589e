//! A fixed-capacity sliding byte window keyed by absolute byte offset.
//!
//! The backing pages are mapped twice, back to back, so any window of up
//! to `capacity` bytes is virtually contiguous no matter where it starts.
//! That lets `write_buf` hand a producer one `&mut [u8]` even when the
//! range wraps the physical end of the buffer.
//!
//! # Safety
//!
//! `write_buf` hands out mutable slices from a shared mapping. This is
//! sound under the same discipline the allocator enforces everywhere:
//!
//! 1. producers receive disjoint ranges, because ranges are derived from
//!    block-list claims that tile the offset space; and
//! 2. the single reader (the writer daemon) only reads a range after it
//!    has advanced the writer cursor past it, which it does only once
//!    every producer of that range has released its claim.
#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use crossbeam_utils::CachePadded;

use crate::debug_delay;
use crate::result::Result;

pub(crate) struct RingBuffer {
    base: *mut u8,
    capacity: u64,
    // absolute byte offset of the oldest byte still unconsumed
    read_begin: CachePadded<AtomicU64>,
    // absolute byte offset one past the newest byte handed to a reader
    write_end: CachePadded<AtomicU64>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Map a window of `capacity` bytes whose cursors start at
    /// `start_byte`. The backing file is created under `dir` and
    /// unlinked immediately; it exists only as mappable pages.
    pub(crate) fn start(
        dir: &Path,
        capacity: usize,
        start_byte: u64,
    ) -> Result<RingBuffer> {
        assert!(capacity.is_power_of_two());

        static SALT: AtomicU64 = AtomicU64::new(0);
        let path = dir.join(format!(
            "log_buffer.{}",
            SALT.fetch_add(1, SeqCst)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        // the mapping keeps the pages alive
        std::fs::remove_file(&path)?;

        let base = unsafe { double_map(&file, capacity)? };

        Ok(RingBuffer {
            base,
            capacity: capacity as u64,
            read_begin: CachePadded::new(AtomicU64::new(start_byte)),
            write_end: CachePadded::new(AtomicU64::new(start_byte)),
        })
    }

    pub(crate) fn window_size(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn read_begin(&self) -> u64 {
        debug_delay();
        self.read_begin.load(SeqCst)
    }

    pub(crate) fn write_end(&self) -> u64 {
        debug_delay();
        self.write_end.load(SeqCst)
    }

    /// Claim `nbytes` of the window starting at absolute offset
    /// `offset`. Returns `None` when the bytes are not yet reusable
    /// because the reader has not consumed far enough.
    pub(crate) fn write_buf(
        &self,
        offset: u64,
        nbytes: usize,
    ) -> Option<&'static mut [u8]> {
        assert!(nbytes as u64 <= self.capacity);
        let read_begin = self.read_begin();
        assert!(
            offset >= read_begin,
            "requested write at {} behind the window start {}",
            offset,
            read_begin
        );

        if offset + nbytes as u64 > read_begin + self.capacity {
            return None;
        }

        let at = (offset % self.capacity) as usize;
        unsafe {
            Some(std::slice::from_raw_parts_mut(self.base.add(at), nbytes))
        }
    }

    /// A read view of `[offset, offset + nbytes)`. The range must have
    /// been sequenced behind the writer cursor.
    pub(crate) fn read_buf(&self, offset: u64, nbytes: usize) -> &[u8] {
        assert!(nbytes as u64 <= self.capacity);
        assert!(offset >= self.read_begin());
        assert!(offset + nbytes as u64 <= self.write_end());

        let at = (offset % self.capacity) as usize;
        unsafe { std::slice::from_raw_parts(self.base.add(at), nbytes) }
    }

    /// Advance the writer cursor. Producers finish out of order, so
    /// only the daemon advances it, once it knows the safe prefix.
    pub(crate) fn advance_writer(&self, to: u64) {
        let prev = self.write_end.swap(to, SeqCst);
        assert!(prev <= to, "writer cursor moved backwards: {} -> {}", prev, to);
    }

    /// Consume the window up to `to`, freeing space for new claims.
    pub(crate) fn advance_reader(&self, to: u64) {
        assert!(to <= self.write_end());
        let prev = self.read_begin.swap(to, SeqCst);
        assert!(prev <= to, "reader cursor moved backwards: {} -> {}", prev, to);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, 2 * self.capacity as usize);
        }
    }
}

/// Map the file's pages twice, adjacently, returning the base address.
unsafe fn double_map(file: &std::fs::File, capacity: usize) -> Result<*mut u8> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();

    // reserve a contiguous 2x region, then pin both halves onto the
    // same file pages
    let base = libc::mmap(
        std::ptr::null_mut(),
        2 * capacity,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }

    for half in 0..2 {
        let at = (base as *mut u8).add(half * capacity);
        let mapped = libc::mmap(
            at as *mut libc::c_void,
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        if mapped == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            libc::munmap(base, 2 * capacity);
            return Err(err.into());
        }
        assert_eq!(mapped as *mut u8, at);
    }

    Ok(base as *mut u8)
}
