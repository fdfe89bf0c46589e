//! The log write daemon. Its only job is to flush released blocks to
//! segment files and publish the durable watermark. In steady state new
//! blocks are released during each write, keeping it busy; whenever the
//! log is fully durable it sleeps until kicked. On a clean shutdown it
//! exits only after everything has reached disk. It is the system's
//! responsibility to ensure the stop flag is not raised while new log
//! records might still be generated.

use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_epoch::pin;
use log::{debug, trace};

use crate::allocator::Inner;
use crate::block::MIN_LOG_BLOCK_SIZE;
use crate::fatal;
use crate::segment::pwrite_all;

pub(crate) fn run(inner: &Arc<Inner>) {
    let mut dlsn = inner.segments.get_durable_mark();
    let mut durable_sid = inner
        .segments
        .get_segment(dlsn.segnum)
        .unwrap_or_else(|| fatal("durable segment missing at daemon start"));
    assert_eq!(inner.dur_lsn_offset(), dlsn.offset);
    let mut durable_byte = durable_sid.buf_offset(dlsn.offset);

    let mut active_file = match inner.segments.open_for_write(&durable_sid) {
        Ok(file) => file,
        Err(e) => fatal(&format!("unable to open active segment: {}", e)),
    };

    let update_dmark = |inner: &Arc<Inner>, sid, offset| {
        let lsn = crate::Lsn::new(sid, offset);
        if let Err(e) = inner.segments.update_durable_mark(lsn) {
            fatal(&format!("unable to persist the durable mark: {}", e));
        }
    };

    let mut timer = Instant::now();
    loop {
        // re-enter the reclamation epoch every iteration so retired
        // block-list nodes can actually be freed
        let guard = pin();

        // every durable_mark_timeout or so, and whenever a caller is
        // blocked on it, push the durable mark to disk
        let durable_now = inner.dur_lsn_offset();
        let dmark_offset = inner.segments.get_durable_mark().offset;
        let can_update = dmark_offset < durable_now;
        let want_update =
            dmark_offset < inner.waiting_for_dmark.load(SeqCst);
        let timed_out = timer.elapsed() >= inner.config.durable_mark_timeout;
        if can_update && (want_update || timed_out) {
            update_dmark(inner, durable_sid.segnum, durable_now);
            timer = Instant::now();
            if want_update {
                let _notified = inner.write_complete_cond.notify_all();
            }
        }

        // find the safe-to-flush prefix: everything below the oldest
        // live allocation has been released, so its bytes are in the
        // buffer. the list is primed with a sentinel, so the walk is
        // always defined, and releasing marks nodes dead rather than
        // removing them, so we sweep those out while we scan.
        let cur_offset = inner.cur_lsn_offset();
        let mut oldest_offset = cur_offset;
        for node in inner.block_list.sweep_iter(&guard) {
            oldest_offset = node.lsn_offset();
        }

        if oldest_offset == inner.dur_lsn_offset() {
            let mut state = inner.daemon_mutex.lock();

            // before blocking: did somebody ask for a durable-mark
            // advance we can satisfy locally?
            let dmark_offset = inner.segments.get_durable_mark().offset;
            let waiting_for_dmark = inner.waiting_for_dmark.load(SeqCst);
            if dmark_offset < waiting_for_dmark
                && waiting_for_dmark <= inner.dur_lsn_offset()
            {
                continue;
            }

            let _notified = inner.write_complete_cond.notify_all();

            if inner.dur_lsn_offset() == cur_offset && state.should_stop {
                if dmark_offset < inner.dur_lsn_offset() {
                    update_dmark(
                        inner,
                        durable_sid.segnum,
                        inner.dur_lsn_offset(),
                    );
                }

                // install a fresh sentinel and try to kill the list.
                // failure means a producer raced in after our read of
                // the frontier; go around again and deal with it.
                let sentinel = inner
                    .block_list
                    .push_with(&guard, |start| start)
                    .expect("only the daemon closes the block list");

                if sentinel.lsn_offset() == cur_offset
                    && inner.block_list.remove_and_kill(sentinel, &guard)
                {
                    let durable = inner.dur_lsn_offset();
                    if durable < inner.waiting_for_durable.load(SeqCst) {
                        fatal(
                            "thread(s) waiting for a past-end durable \
                             offset at log shutdown",
                        );
                    }
                    if durable < inner.waiting_for_dmark.load(SeqCst) {
                        fatal(
                            "thread(s) waiting for a past-end durable \
                             mark at log shutdown",
                        );
                    }
                    debug!("log write daemon exiting at offset {}", durable);
                    return;
                }

                inner.block_list.remove_fast(sentinel);
                continue;
            }

            if state.should_stop && oldest_offset != cur_offset {
                fatal(
                    "allocation(s) still in flight at log shutdown; \
                     refusing to lose claimed log space",
                );
            }

            // wait for a kick; spurious wakeups are acceptable
            inner.daemon_wait_count.fetch_add(1, SeqCst);
            inner.daemon_cond.wait(&mut state);
            continue;
        }

        // we have some amount of data to write out, possibly spanning
        // multiple segments. finish each segment before moving on.
        while inner.dur_lsn_offset() < oldest_offset {
            let durable_offset = inner.dur_lsn_offset();

            let (new_sid, new_offset, new_byte);
            if durable_sid.end_offset
                < oldest_offset + MIN_LOG_BLOCK_SIZE as u64
            {
                // the rest of this segment is red zone. any
                // allocation that landed there installed the next
                // segment before releasing, so reading it without
                // synchronization is safe.
                let next_segnum = (durable_sid.segnum as usize + 1)
                    % inner.config.num_segments;
                let next = inner
                    .segments
                    .get_segment(next_segnum as u32)
                    .unwrap_or_else(|| {
                        fatal("red zone reached without a successor segment")
                    });
                assert_eq!(
                    next.byte_offset,
                    durable_sid.byte_offset
                        + inner.config.segment_size as u64
                );
                new_sid = next;
                new_offset = next.start_offset;
                new_byte = next.byte_offset;
            } else {
                new_sid = durable_sid;
                new_offset = oldest_offset;
                new_byte = durable_sid.buf_offset(oldest_offset);
            }

            assert_eq!(durable_byte, inner.ring.read_begin());
            assert!(durable_byte < new_byte);

            // producers do not advance the buffer window because they
            // finish out of order; do it for them now that the safe
            // prefix is known
            inner.ring.advance_writer(new_byte);
            assert!(new_byte <= inner.ring.write_end());

            let nbytes = (new_byte - durable_byte) as usize;
            let buf = inner.ring.read_buf(durable_byte, nbytes);
            let file_offset = durable_sid.offset(durable_offset);
            trace!(
                "flushing offsets [{}, {}) to segment {} at file offset {}",
                durable_offset,
                durable_offset + nbytes as u64,
                durable_sid.segnum,
                file_offset
            );
            if let Err(e) = pwrite_all(&active_file, buf, file_offset) {
                fatal(&format!("incomplete log write: {}", e));
            }
            inner.ring.advance_reader(new_byte);

            // segment change?
            if new_sid.segnum != durable_sid.segnum {
                active_file = match inner.segments.open_for_write(&new_sid) {
                    Ok(file) => file,
                    Err(e) => fatal(&format!(
                        "unable to open next segment: {}",
                        e
                    )),
                };
                debug!(
                    "flush crossed into segment {} at offset {}",
                    new_sid.segnum, new_offset
                );
            }

            let state = inner.daemon_mutex.lock();
            if inner.dur_lsn_offset()
                < inner.waiting_for_durable.load(SeqCst)
            {
                let _notified = inner.write_complete_cond.notify_all();
            }
            durable_sid = new_sid;
            inner.durable_lsn_offset.store(new_offset, SeqCst);
            durable_byte = new_byte;
            drop(state);
        }

        dlsn = durable_sid.make_lsn(inner.dur_lsn_offset());
        trace!("durable watermark now {}", dlsn);
    }
}
