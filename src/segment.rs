//! The segment manager: maps LSN offsets to the fixed ring of on-disk
//! segment files, decides how an offset range lands relative to segment
//! boundaries, and owns the authoritative on-disk durable mark.
//!
//! Segment installation is a single CAS on the newest descriptor. When a
//! claim crosses a segment's end, the crossing thread installs the
//! successor before it returns, which is what lets the writer daemon
//! read `segnum + 1` without synchronization once it reaches the red
//! zone.
#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use crossbeam_epoch::{pin, unprotected, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::block::MIN_LOG_BLOCK_SIZE;
use crate::result::{Error, Result};
use crate::{arr_to_u32, arr_to_u64, crc32, u32_to_arr, u64_to_arr};
use crate::{Lsn, LsnOffset, SegmentNumber};

const MARK_LEN: usize = 16;

/// A descriptor for one installed segment. `Copy`, so callers hold
/// values rather than references into the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentId {
    pub segnum: SegmentNumber,
    pub start_offset: LsnOffset,
    /// Exclusive upper LSN-offset bound; `end_offset - start_offset`
    /// always equals the configured segment size.
    pub end_offset: LsnOffset,
    /// Absolute ring-buffer byte position of `start_offset`.
    pub byte_offset: u64,
}

impl SegmentId {
    /// Position of `lsn_offset` within this segment's file.
    pub(crate) fn offset(&self, lsn_offset: LsnOffset) -> u64 {
        assert!(lsn_offset >= self.start_offset);
        assert!(lsn_offset < self.end_offset);
        lsn_offset - self.start_offset
    }

    /// Position of `lsn_offset` within the ring buffer.
    pub(crate) fn buf_offset(&self, lsn_offset: LsnOffset) -> u64 {
        assert!(lsn_offset >= self.start_offset);
        assert!(lsn_offset <= self.end_offset);
        self.byte_offset + (lsn_offset - self.start_offset)
    }

    pub(crate) fn make_lsn(&self, lsn_offset: LsnOffset) -> Lsn {
        Lsn::new(self.segnum, lsn_offset)
    }

    /// Offsets at or past this bound cannot begin a block: the rest of
    /// the segment is the skip-record red zone.
    pub(crate) fn usable_end(&self) -> LsnOffset {
        self.end_offset - MIN_LOG_BLOCK_SIZE as u64
    }
}

/// The outcome of mapping a claimed range onto the segment ring.
pub(crate) struct SegmentAssignment {
    /// `None` when the range fell into an inter-segment dead zone and
    /// must be dropped and re-claimed.
    pub sid: Option<SegmentId>,
    /// `false` when the range straddles the segment end and must be
    /// downgraded to a filler skip block.
    pub full_size: bool,
    /// Where the block after this one begins: the claim's own end for
    /// a full-size block, the successor segment's start for a filler
    /// that closes its segment.
    pub next_lsn: Lsn,
}

pub(crate) struct SegmentManager {
    dir: PathBuf,
    segment_size: u64,
    num_segments: usize,
    tail: Atomic<SegmentId>,
    /// The tail segment's `end_offset`, read on the claim path to trim
    /// claims that would cross it.
    boundary: CachePadded<AtomicU64>,
    table: Mutex<Vec<Option<SegmentId>>>,
    durable_mark: Mutex<Lsn>,
    mark_file: File,
}

impl SegmentManager {
    pub(crate) fn start(
        dir: PathBuf,
        segment_size: u64,
        num_segments: usize,
    ) -> Result<SegmentManager> {
        std::fs::create_dir_all(&dir)?;

        let mark_path = dir.join("durable_mark");
        let mark_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&mark_path)?;

        let mark = if mark_file.metadata()?.len() >= MARK_LEN as u64 {
            read_mark(&mark_file)?
        } else {
            let mark = Lsn::new(0, 0);
            write_mark(&mark_file, mark)?;
            mark
        };

        debug!("starting segment manager with durable mark {}", mark);

        // the recovery pass runs before this core starts; whatever it
        // decided is durable becomes the start of a fresh segment
        let tail = SegmentId {
            segnum: mark.segnum,
            start_offset: mark.offset,
            end_offset: mark.offset + segment_size,
            byte_offset: mark.offset,
        };

        let mut table = vec![None; num_segments];
        table[tail.segnum as usize % num_segments] = Some(tail);

        Ok(SegmentManager {
            dir,
            segment_size,
            num_segments,
            boundary: CachePadded::new(AtomicU64::new(tail.end_offset)),
            tail: Atomic::new(tail),
            table: Mutex::new(table),
            durable_mark: Mutex::new(mark),
            mark_file,
        })
    }

    fn current(&self, guard: &Guard) -> SegmentId {
        *unsafe {
            self.tail
                .load(SeqCst, guard)
                .as_ref()
                .expect("tail segment is always installed")
        }
    }

    /// Trim a prospective claim `[start, start + nbytes)` so it never
    /// crosses the tail segment's usable area: a claim that would is
    /// cut at the boundary, turning it into an exact filler.
    pub(crate) fn claim_end(&self, start: LsnOffset, nbytes: u64) -> LsnOffset {
        let boundary = self.boundary.load(SeqCst);
        let usable = boundary - MIN_LOG_BLOCK_SIZE as u64;
        if start <= usable && start + nbytes > usable {
            boundary
        } else {
            start + nbytes
        }
    }

    pub(crate) fn get_segment(
        &self,
        segnum: SegmentNumber,
    ) -> Option<SegmentId> {
        let table = self.table.lock();
        table[segnum as usize % self.num_segments]
            .filter(|sid| sid.segnum == segnum)
    }

    /// Map the claimed range `[begin, end)` to a segment, installing
    /// the successor segment when the range crosses or lands past the
    /// current boundary.
    pub(crate) fn assign_segment(
        &self,
        begin: LsnOffset,
        end: LsnOffset,
    ) -> SegmentAssignment {
        let guard = pin();
        loop {
            let tail = self.current(&guard);

            if begin >= tail.start_offset {
                if begin > tail.usable_end() {
                    // the claim begins where no block fits; it belongs
                    // to whatever segment follows
                    self.install_next(&tail, begin, &guard);
                    continue;
                }

                if end <= tail.usable_end() {
                    return SegmentAssignment {
                        sid: Some(tail),
                        full_size: true,
                        next_lsn: tail.make_lsn(end),
                    };
                }

                if end >= tail.end_offset {
                    // the claim closes this segment; make sure its
                    // successor exists so the filler's skip record has
                    // somewhere to point
                    let next = self.install_next(&tail, end, &guard);
                    return SegmentAssignment {
                        sid: Some(tail),
                        full_size: false,
                        next_lsn: next.make_lsn(next.start_offset),
                    };
                }

                // the claim ends inside the red zone without reaching
                // the boundary (a stale trim); emit an undersized
                // empty block and leave the segment open
                return SegmentAssignment {
                    sid: Some(tail),
                    full_size: false,
                    next_lsn: tail.make_lsn(end),
                };
            }

            // begin sits behind the tail segment: either in its still
            // installed predecessor, or in a dead zone
            let prev_num = (tail.segnum as usize + self.num_segments - 1)
                % self.num_segments;
            if let Some(prev) = self.get_segment(prev_num as SegmentNumber) {
                let is_predecessor =
                    prev.byte_offset + self.segment_size == tail.byte_offset;
                if is_predecessor
                    && prev.start_offset <= begin
                    && begin <= prev.usable_end()
                {
                    if end <= prev.usable_end() {
                        return SegmentAssignment {
                            sid: Some(prev),
                            full_size: true,
                            next_lsn: prev.make_lsn(end),
                        };
                    }
                    if end >= prev.end_offset {
                        return SegmentAssignment {
                            sid: Some(prev),
                            full_size: false,
                            next_lsn: tail.make_lsn(tail.start_offset),
                        };
                    }
                    return SegmentAssignment {
                        sid: Some(prev),
                        full_size: false,
                        next_lsn: prev.make_lsn(end),
                    };
                }
            }

            trace!(
                "claim [{}, {}) fell in a dead zone behind segment {}",
                begin,
                end,
                tail.segnum
            );
            return SegmentAssignment {
                sid: None,
                full_size: false,
                next_lsn: tail.make_lsn(tail.start_offset),
            };
        }
    }

    /// Install the successor of `cur` with the proposed start offset,
    /// or return whatever successor a racing thread installed first.
    fn install_next(
        &self,
        cur: &SegmentId,
        proposed_start: LsnOffset,
        guard: &Guard,
    ) -> SegmentId {
        loop {
            let shared = self.tail.load(SeqCst, guard);
            let observed = *unsafe { shared.deref() };
            if observed.segnum != cur.segnum
                || observed.start_offset != cur.start_offset
            {
                // already advanced
                return observed;
            }

            let candidate = SegmentId {
                segnum: (cur.segnum as usize + 1) as SegmentNumber
                    % self.num_segments as SegmentNumber,
                start_offset: proposed_start,
                end_offset: proposed_start + self.segment_size,
                byte_offset: cur.byte_offset + self.segment_size,
            };

            match self.tail.compare_exchange(
                shared,
                Owned::new(candidate),
                SeqCst,
                SeqCst,
                guard,
            ) {
                Ok(_) => {
                    self.boundary.fetch_max(candidate.end_offset, SeqCst);
                    let mut table = self.table.lock();
                    table[candidate.segnum as usize % self.num_segments] =
                        Some(candidate);
                    drop(table);
                    unsafe {
                        guard.defer_destroy(shared);
                    }
                    debug!(
                        "installed segment {} spanning offsets [{}, {})",
                        candidate.segnum,
                        candidate.start_offset,
                        candidate.end_offset
                    );
                    return candidate;
                }
                Err(_) => {
                    // reload and either return the winner or retry
                    continue;
                }
            }
        }
    }

    /// Open the segment's file for positioned writes, creating and
    /// sizing it if this slot has not been used before.
    pub(crate) fn open_for_write(&self, sid: &SegmentId) -> Result<File> {
        let path = self.segment_path(sid.segnum);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(self.segment_size)?;
        trace!("opened segment file {:?} for writing", path);
        Ok(file)
    }

    pub(crate) fn segment_path(&self, segnum: SegmentNumber) -> PathBuf {
        self.dir.join(format!("{:08x}.log", segnum))
    }

    pub(crate) fn get_durable_mark(&self) -> Lsn {
        *self.durable_mark.lock()
    }

    /// Persist a new durable mark. The daemon calls this on a timer
    /// and on demand; the mark only ever moves forward.
    pub(crate) fn update_durable_mark(&self, lsn: Lsn) -> Result<()> {
        let mut mark = self.durable_mark.lock();
        assert!(mark.offset <= lsn.offset);
        write_mark(&self.mark_file, lsn)?;
        *mark = lsn;
        debug!("advanced durable mark to {}", lsn);
        Ok(())
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        unsafe {
            let tail = self.tail.load(SeqCst, unprotected());
            if !tail.is_null() {
                drop(tail.into_owned());
            }
        }
    }
}

fn read_mark(file: &File) -> Result<Lsn> {
    let mut buf = [0; MARK_LEN];
    pread_exact(file, &mut buf, 0)?;
    let stored_crc = arr_to_u32(&buf[0..4]);
    if stored_crc != crc32(&buf[4..]) {
        return Err(Error::Corruption { at: 0 });
    }
    Ok(Lsn::new(arr_to_u32(&buf[4..8]), arr_to_u64(&buf[8..16])))
}

fn write_mark(file: &File, lsn: Lsn) -> Result<()> {
    let mut buf = [0; MARK_LEN];
    buf[4..8].copy_from_slice(&u32_to_arr(lsn.segnum));
    buf[8..16].copy_from_slice(&u64_to_arr(lsn.offset));
    let crc = crc32(&buf[4..]);
    buf[0..4].copy_from_slice(&u32_to_arr(crc));
    pwrite_all(file, &buf, 0)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn pread_exact(
    file: &File,
    buf: &mut [u8],
    offset: u64,
) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

pub(crate) fn pwrite_all(
    file: &File,
    buf: &[u8],
    offset: u64,
) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(segment_size: u64) -> SegmentManager {
        let dir = std::env::temp_dir().join(format!(
            "vellum.segtest.{}.{}",
            std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos(),
            segment_size,
        ));
        SegmentManager::start(dir, segment_size, 4).unwrap()
    }

    const MIN: u64 = MIN_LOG_BLOCK_SIZE as u64;

    #[test]
    fn full_size_assignment() {
        let sm = manager(4096);
        let rval = sm.assign_segment(0, 128);
        let sid = rval.sid.unwrap();
        assert!(rval.full_size);
        assert_eq!(sid.segnum, 0);
        assert_eq!(rval.next_lsn, Lsn::new(0, 128));
        assert_eq!(sid.offset(128), 128);
        assert_eq!(sid.buf_offset(128), 128);
    }

    #[test]
    fn claims_are_trimmed_at_the_boundary() {
        let sm = manager(4096);
        // a claim fully below the usable end is untouched
        assert_eq!(sm.claim_end(0, 128), 128);
        // a claim that would cross is cut at the boundary exactly
        let usable = 4096 - MIN;
        assert_eq!(sm.claim_end(usable - 8, 128), 4096);
        assert_eq!(sm.claim_end(usable, MIN), 4096);
        // a claim past the boundary is untouched
        assert_eq!(sm.claim_end(4096, 128), 4096 + 128);
        // the daemon's empty shutdown claim is never trimmed
        assert_eq!(sm.claim_end(4096 - 8, 0), 4096 - 8);
    }

    #[test]
    fn straddle_installs_successor_and_reports_filler() {
        let sm = manager(4096);
        let begin = 4000;
        let end = sm.claim_end(begin, 200);
        assert_eq!(end, 4096);

        let rval = sm.assign_segment(begin, end);
        let sid = rval.sid.unwrap();
        assert!(!rval.full_size);
        assert_eq!(sid.segnum, 0);
        // the filler's skip record points at the successor's start
        assert_eq!(rval.next_lsn, Lsn::new(1, 4096));

        let next = sm.get_segment(1).unwrap();
        assert_eq!(next.start_offset, 4096);
        assert_eq!(next.byte_offset, 4096);
        assert_eq!(next.end_offset, 2 * 4096);
    }

    #[test]
    fn past_end_claim_becomes_first_block_of_successor() {
        let sm = manager(4096);
        let rval = sm.assign_segment(4096, 4096 + 100);
        let sid = rval.sid.unwrap();
        assert!(rval.full_size);
        assert_eq!(sid.segnum, 1);
        assert_eq!(sid.start_offset, 4096);
    }

    #[test]
    fn race_loser_lands_in_dead_zone() {
        let sm = manager(4096);
        // a later claim wins installation with its own begin
        let winner = sm.assign_segment(4200, 4300);
        assert!(winner.full_size);
        assert_eq!(winner.sid.unwrap().start_offset, 4200);

        // the earlier claim now has no physical home
        let loser = sm.assign_segment(4096, 4200);
        assert!(loser.sid.is_none());
    }

    #[test]
    fn straddler_after_successor_installed_still_gets_filler() {
        let sm = manager(4096);
        // a past-end claim installs segment 1 first
        let installer = sm.assign_segment(4100, 4200);
        assert_eq!(installer.sid.unwrap().segnum, 1);

        // the straddler still maps to segment 0, with its skip
        // pointing at the installed successor
        let rval = sm.assign_segment(4000, 4096);
        let sid = rval.sid.unwrap();
        assert!(!rval.full_size);
        assert_eq!(sid.segnum, 0);
        assert_eq!(rval.next_lsn, Lsn::new(1, 4100));
    }

    #[test]
    fn durable_mark_roundtrip() {
        let sm = manager(4096);
        assert_eq!(sm.get_durable_mark(), Lsn::new(0, 0));
        sm.update_durable_mark(Lsn::new(0, 2048)).unwrap();
        assert_eq!(sm.get_durable_mark(), Lsn::new(0, 2048));

        // a fresh manager over the same directory sees the mark
        let dir = sm.dir.clone();
        drop(sm);
        let sm2 = SegmentManager::start(dir, 4096, 4).unwrap();
        assert_eq!(sm2.get_durable_mark().offset, 2048);
    }
}
