//! The producer-side API: claim a block, write into it, release it, and
//! wait on the durable watermark the daemon publishes.
#![allow(unsafe_code)]

use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;

use crossbeam_epoch::pin;
use crossbeam_utils::CachePadded;
use log::{error, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::block::{block_size, BlockView, MIN_LOG_BLOCK_SIZE};
use crate::block_list::{BlockList, Node};
use crate::result::{Error, Result};
use crate::{daemon, fatal, Config, Lsn, LsnOffset, RingBuffer, SegmentManager};

/// A write-ahead log allocator.
///
/// Hands out contiguous, monotonically numbered regions of the log to
/// concurrent producers, stages their bytes in a fixed-size ring
/// buffer, and flushes them to segment files from a single background
/// daemon. Producers may block waiting for buffer space and on the
/// durable watermark; nothing else in the producer path touches disk.
pub struct LogAllocator {
    pub(crate) inner: Arc<Inner>,
    daemon_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) dir: PathBuf,
    pub(crate) block_list: BlockList,
    pub(crate) ring: RingBuffer,
    pub(crate) segments: SegmentManager,

    /// The largest LSN offset below which every byte has been handed
    /// to the OS. Reads outside the daemon mutex are fine; writes
    /// happen under it so waiter wakeups are not lost.
    pub(crate) durable_lsn_offset: CachePadded<AtomicU64>,

    /// Largest offset any caller is blocked on for in-memory
    /// durability, and for the on-disk durable mark. Raised only under
    /// the daemon mutex.
    pub(crate) waiting_for_durable: AtomicU64,
    pub(crate) waiting_for_dmark: AtomicU64,

    /// The daemon bumps `wait_count` before it blocks; producers bump
    /// `kick_count` when they signal it. A signal is only needed when
    /// the kick count is behind, which keeps the hot release path free
    /// of syscalls.
    pub(crate) daemon_wait_count: AtomicU64,
    pub(crate) daemon_kick_count: AtomicU64,

    pub(crate) daemon_mutex: Mutex<DaemonState>,
    pub(crate) daemon_cond: Condvar,
    pub(crate) write_complete_cond: Condvar,
}

pub(crate) struct DaemonState {
    pub(crate) should_stop: bool,
}

/// One reserved range of the log, returned by
/// [`LogAllocator::allocate`]. The caller owns the record slots and
/// payload area until it calls [`LogAllocator::release`] or
/// [`LogAllocator::discard`].
pub struct Allocation {
    pub(crate) node: *const Node,
    pub(crate) block: *mut u8,
    pub(crate) nbytes: usize,
    pub(crate) lsn: Lsn,
}

unsafe impl Send for Allocation {}

impl Allocation {
    /// The LSN this block begins at.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// The total size of the block in bytes, trailing skip record
    /// included.
    pub fn len(&self) -> usize {
        self.nbytes
    }

    /// Returns `true` only for blocks that cannot carry records.
    pub fn is_empty(&self) -> bool {
        self.nbytes == MIN_LOG_BLOCK_SIZE
    }

    pub(crate) fn view(&mut self) -> BlockView<'_> {
        let buf =
            unsafe { std::slice::from_raw_parts_mut(self.block, self.nbytes) };
        BlockView::new(buf)
    }

    /// The record slots reserved for the caller, excluding the
    /// trailing skip record.
    pub fn records(&mut self) -> &mut [u8] {
        // reborrow through raw parts so the lifetime attaches to self
        // rather than the temporary view
        let (ptr, len) = {
            let mut view = self.view();
            let records = view.records();
            (records.as_mut_ptr(), records.len())
        };
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// The payload area after the record slots.
    pub fn payload(&mut self) -> &mut [u8] {
        let (ptr, len) = {
            let mut view = self.view();
            let payload = view.payload();
            (payload.as_mut_ptr(), payload.len())
        };
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Stamp the block checksum over the header, slots, and payload.
    /// Call once the payload is fully written, before releasing.
    pub fn finalize(&mut self) {
        self.view().finalize();
    }
}

/// Escalates any unexpected exit from the allocation protocol to
/// process termination: once a node is published, leaving its log
/// space uninitialized would truncate the log at recovery.
struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        fatal(
            "log allocation did not complete normally; \
             terminating execution to avoid losing committed work",
        );
    }
}

impl LogAllocator {
    pub(crate) fn start(config: Config) -> Result<LogAllocator> {
        let dir = config.run_path();

        let segments = SegmentManager::start(
            dir.clone(),
            config.segment_size as u64,
            config.num_segments,
        )?;
        let mark = segments.get_durable_mark();
        let durable_sid = segments
            .get_segment(mark.segnum)
            .expect("the starting segment is always primed");

        let ring = RingBuffer::start(
            &dir,
            config.log_buf_size,
            durable_sid.buf_offset(mark.offset),
        )?;

        let inner = Arc::new(Inner {
            config,
            dir,
            block_list: BlockList::start(mark.offset),
            ring,
            segments,
            durable_lsn_offset: CachePadded::new(AtomicU64::new(mark.offset)),
            waiting_for_durable: AtomicU64::new(0),
            waiting_for_dmark: AtomicU64::new(0),
            daemon_wait_count: AtomicU64::new(0),
            daemon_kick_count: AtomicU64::new(0),
            daemon_mutex: Mutex::new(DaemonState { should_stop: false }),
            daemon_cond: Condvar::new(),
            write_complete_cond: Condvar::new(),
        });

        // hold the mutex across the spawn so the daemon's first
        // iteration observes fully initialized state
        let handle = {
            let _state = inner.daemon_mutex.lock();
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("log_write_daemon".to_string())
                .spawn(move || daemon::run(&inner))?
        };

        Ok(LogAllocator {
            inner,
            daemon_handle: Mutex::new(Some(handle)),
        })
    }

    /// Reserve space for one log block carrying `nrec` records plus
    /// `payload_bytes` of payload. Blocks until ring-buffer space is
    /// available. The only recoverable error is `LogFull`, and only
    /// when a red-zone reservation was configured.
    pub fn allocate(
        &self,
        nrec: u32,
        payload_bytes: usize,
    ) -> Result<Allocation> {
        self.inner.allocate(nrec, payload_bytes)
    }

    /// Return a fully written block to the log. The caller must have
    /// stamped the checksum via [`Allocation::finalize`]. Wait-free
    /// apart from an occasional daemon wakeup.
    pub fn release(&self, x: Allocation) {
        self.inner.release(x)
    }

    /// Abandon a block: it is rewritten as an empty skip record so a
    /// recovery scan walks past it, then released.
    pub fn discard(&self, x: Allocation) {
        self.inner.discard(x)
    }

    /// The current allocation frontier.
    pub fn cur_lsn_offset(&self) -> LsnOffset {
        self.inner.cur_lsn_offset()
    }

    /// The durable watermark: every byte below it has been written to
    /// the OS.
    pub fn dur_lsn_offset(&self) -> LsnOffset {
        self.inner.dur_lsn_offset()
    }

    /// Block until the durable watermark reaches `target`.
    pub fn wait_for_durable(&self, target: LsnOffset) {
        self.inner.wait_for_durable(target)
    }

    /// Block until the on-disk durable mark reaches `target`.
    pub fn update_durable_mark(&self, target: LsnOffset) {
        self.inner.update_durable_mark(target)
    }
}

impl Drop for LogAllocator {
    fn drop(&mut self) {
        {
            let mut state = self.inner.daemon_mutex.lock();
            state.should_stop = true;
            self.inner.kick_daemon(&mut state);
        }

        if let Some(handle) = self.daemon_handle.lock().take() {
            if handle.join().is_err() {
                error!("log write daemon panicked during shutdown");
            }
        }

        if self.inner.config.temporary {
            warn!("removing ephemeral log directory {:?}", self.inner.dir);
            if let Err(e) = std::fs::remove_dir_all(&self.inner.dir) {
                error!(
                    "failed to remove ephemeral log directory {:?}: {}",
                    self.inner.dir, e
                );
            }
        }
    }
}

impl Inner {
    fn allocate(&self, nrec: u32, payload_bytes: usize) -> Result<Allocation> {
        assert_eq!(
            payload_bytes % self.config.payload_align,
            0,
            "payload_bytes must be aligned to {}",
            self.config.payload_align
        );

        let nbytes = block_size(nrec, payload_bytes);
        if nbytes + MIN_LOG_BLOCK_SIZE > self.config.segment_size {
            return Err(Error::Unsupported(
                "block would not fit within a single segment",
            ));
        }
        // a boundary filler can run one minimum block longer than the
        // claim that produced it, and it has to fit the window too
        if nbytes + MIN_LOG_BLOCK_SIZE > self.config.log_buf_size {
            return Err(Error::Unsupported(
                "block would never fit in the staging buffer",
            ));
        }

        if self.config.reserved_log_bytes > 0 {
            let capacity = (self.config.num_segments
                * self.config.segment_size)
                as u64;
            let in_flight = self.cur_lsn_offset() + nbytes as u64
                - self.dur_lsn_offset();
            if in_flight > capacity - self.config.reserved_log_bytes {
                return Err(Error::LogFull);
            }
        }

        loop {
            // step 1: join the block list to claim an LSN range. the
            // claim is cut short at the segment boundary, in which
            // case it becomes an exact filler below.
            let guard = pin();
            let node = match self.block_list.push_with(&guard, |start| {
                self.segments.claim_end(start, nbytes as u64)
            }) {
                Some(node) => node,
                None => fatal("attempted log insert after shutdown"),
            };

            // step 2: once published, the range reserves physical log
            // space; any exit that does not initialize it has to take
            // the process down.
            let abort_guard = AbortOnDrop;

            let begin = node.lsn_offset();
            let end = node.next_lsn_offset();

            // step 3: map the range to a segment
            let rval = self.segments.assign_segment(begin, end);
            let sid = match rval.sid {
                Some(sid) => sid,
                None => {
                    // the range fell in an inter-segment dead zone; it
                    // has no physical home, so dropping the node is
                    // safe and we go again
                    trace!(
                        "allocation [{}, {}) hit a dead zone, retrying",
                        begin,
                        end
                    );
                    mem::forget(abort_guard);
                    self.block_list.remove_fast(node);
                    continue;
                }
            };

            let (tmp_nbytes, tmp_nrec, tmp_payload_bytes) = if rval.full_size
            {
                (nbytes, nrec, payload_bytes)
            } else {
                // downgraded to a filler: it spans exactly the bytes
                // between the claim and the closer of its own end and
                // the segment end
                let fill =
                    (std::cmp::min(end, sid.end_offset) - begin) as usize;
                assert!(fill >= MIN_LOG_BLOCK_SIZE);
                (fill, 0, fill - MIN_LOG_BLOCK_SIZE)
            };

            let lsn = sid.make_lsn(begin);
            let buf_offset = sid.buf_offset(begin);

            // step 4: claim buffer space, waiting for the daemon to
            // free some if the window is full
            let buf = loop {
                if let Some(buf) = self.ring.write_buf(buf_offset, tmp_nbytes)
                {
                    break buf;
                }

                // the buffer space we need frees up once the durable
                // offset passes the other end of the window. the
                // LSN-to-byte mapping is piecewise linear, so this may
                // guess high; the retry makes that harmless.
                let needed = begin.saturating_sub(self.ring.window_size());
                let mut state = self.daemon_mutex.lock();
                if self.waiting_for_durable.load(SeqCst) < needed {
                    self.waiting_for_durable.store(needed, SeqCst);
                }
                self.kick_daemon(&mut state);
                self.write_complete_cond.wait(&mut state);
            };

            // step 5: the header and trailing skip record always go
            // in, so the range parses even if the caller aborts
            let mut view = BlockView::new(buf);
            view.init(lsn, tmp_nrec, rval.next_lsn, tmp_payload_bytes);

            mem::forget(abort_guard);

            let x = Allocation {
                node: node as *const Node,
                block: buf.as_mut_ptr(),
                nbytes: tmp_nbytes,
                lsn,
            };

            if !rval.full_size {
                // step 6: publish the filler so recovery can walk past
                // the segment boundary, then claim again
                self.discard(x);
                continue;
            }

            return Ok(x);
        }
    }

    fn release(&self, mut x: Allocation) {
        debug_assert!(x.view().trailing_is_skip());

        let node = unsafe { &*x.node };
        self.block_list.remove_fast(node);

        // hopefully the daemon is already awake, but be ready to give
        // it a kick if need be
        if self.daemon_kick_count.load(SeqCst)
            < self.daemon_wait_count.load(SeqCst)
        {
            let mut state = self.daemon_mutex.lock();
            self.kick_daemon(&mut state);
        }
    }

    fn discard(&self, mut x: Allocation) {
        x.view().rewrite_as_skip();
        self.release(x);
    }

    pub(crate) fn cur_lsn_offset(&self) -> LsnOffset {
        let guard = pin();
        match self.block_list.peek_raw(&guard) {
            Some(node) => node.next_lsn_offset(),
            // the list only closes at shutdown, once the frontier and
            // the durable offset agree
            None => self.dur_lsn_offset(),
        }
    }

    pub(crate) fn dur_lsn_offset(&self) -> LsnOffset {
        self.durable_lsn_offset.load(SeqCst)
    }

    pub(crate) fn wait_for_durable(&self, target: LsnOffset) {
        while self.dur_lsn_offset() < target {
            let mut state = self.daemon_mutex.lock();
            if self.waiting_for_durable.load(SeqCst) < target {
                self.waiting_for_durable.store(target, SeqCst);
            }
            self.kick_daemon(&mut state);
            if self.dur_lsn_offset() >= target {
                return;
            }
            self.write_complete_cond.wait(&mut state);
        }
    }

    pub(crate) fn update_durable_mark(&self, target: LsnOffset) {
        self.wait_for_durable(target);
        let mut state = self.daemon_mutex.lock();
        while self.segments.get_durable_mark().offset < target {
            if self.waiting_for_dmark.load(SeqCst) < target {
                self.waiting_for_dmark.store(target, SeqCst);
            }
            self.kick_daemon(&mut state);
            self.write_complete_cond.wait(&mut state);
        }
    }

    /// Wake the daemon if it happens to be asleep. Callers must hold
    /// the daemon mutex; the state reference enforces that.
    pub(crate) fn kick_daemon(&self, _state: &mut DaemonState) {
        if self.daemon_kick_count.load(SeqCst)
            < self.daemon_wait_count.load(SeqCst)
        {
            self.daemon_kick_count.fetch_add(1, SeqCst);
            self.daemon_cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::default()
            .temporary(true)
            .segment_size(1024 * 1024)
            .log_buf_size(64 * 1024)
    }

    #[test]
    fn allocate_release_advances_watermark() {
        let log = test_config().open().unwrap();
        assert_eq!(log.cur_lsn_offset(), 0);
        assert_eq!(log.dur_lsn_offset(), 0);

        let mut x = log.allocate(1, 64).unwrap();
        let expected = block_size(1, 64);
        assert_eq!(x.lsn(), Lsn::new(0, 0));
        assert_eq!(x.len(), expected);
        assert_eq!(log.cur_lsn_offset(), expected as u64);

        x.payload()[..5].copy_from_slice(b"hello");
        x.finalize();
        log.release(x);

        log.wait_for_durable(expected as u64);
        assert_eq!(log.dur_lsn_offset(), expected as u64);
    }

    #[test]
    fn discard_leaves_parseable_skip() {
        let log = test_config().open().unwrap();
        let x = log.allocate(2, 128).unwrap();
        let total = x.len() as u64;
        log.discard(x);
        log.wait_for_durable(total);
        assert_eq!(log.dur_lsn_offset(), total);
    }

    #[test]
    fn wake_economy_is_balanced_at_quiescence() {
        let log = test_config().open().unwrap();
        for _ in 0..32 {
            let mut x = log.allocate(1, 8).unwrap();
            x.finalize();
            let lsn = x.lsn();
            let len = x.len() as u64;
            log.release(x);
            log.wait_for_durable(lsn.offset + len);
        }

        let waits = log.inner.daemon_wait_count.load(SeqCst);
        let kicks = log.inner.daemon_kick_count.load(SeqCst);
        assert!(
            waits >= kicks && waits - kicks <= 1,
            "wait count {} and kick count {} diverged",
            waits,
            kicks
        );
    }

    #[test]
    fn repeated_waits_return_immediately() {
        let log = test_config().open().unwrap();
        let mut x = log.allocate(0, 0).unwrap();
        x.finalize();
        let target = x.len() as u64;
        log.release(x);

        log.wait_for_durable(target);
        for _ in 0..10 {
            // already satisfied; must not block
            log.wait_for_durable(target);
        }
    }

    #[test]
    fn log_full_respects_reservation() {
        let config = Config::default()
            .temporary(true)
            .segment_size(4096)
            .num_segments(2)
            .log_buf_size(4096)
            .reserved_log_bytes(8 * 1024 - 256);
        let log = config.open().unwrap();

        // 2 * 4096 total capacity minus the reservation leaves only
        // 256 bytes of admissible in-flight log
        let x = log.allocate(0, 64).unwrap();
        match log.allocate(0, 512) {
            Err(Error::LogFull) => {}
            other => panic!("expected LogFull, got {:?}", other.map(|_| ())),
        }
        log.discard(x);
    }
}
