use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use quickcheck::{Arbitrary, Gen, QuickCheck, StdGen};
use rand::Rng;

use vellum::{
    block_size, Config, BLOCK_HEADER_LEN, MIN_LOG_BLOCK_SIZE, RECORD_SKIP,
    RECORD_SLOT_LEN,
};

fn test_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "vellum.test.{}.{}",
        name,
        std::time::UNIX_EPOCH.elapsed().unwrap().as_nanos()
    ))
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut arr = [0; 4];
    arr.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(arr)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut arr = [0; 8];
    arr.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(arr)
}

fn crc32(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf);
    hasher.finalize()
}

struct WalkedBlock {
    lsn_offset: u64,
    nrec: u32,
    payload: Vec<u8>,
}

/// Walk the on-disk log the way a recovery scanner would: from block
/// to block via each trailing skip record, hopping segment files when
/// a skip points into the next segment. Verifies every block checksum
/// along the way.
fn walk_log(
    dir: &Path,
    segment_size: u64,
    frontier: u64,
) -> Vec<WalkedBlock> {
    let mut segnum: u32 = 0;
    let mut seg_start: u64 = 0;
    let mut offset: u64 = 0;
    let mut file = fs::read(dir.join(format!("{:08x}.log", segnum))).unwrap();
    let mut out = vec![];

    while offset < frontier {
        let at = (offset - seg_start) as usize;
        let block = &file[at..];

        let checksum = u32_at(block, 0);
        let nrec = u32_at(block, 4);
        assert_eq!(u32_at(block, 8), segnum, "block at {} has wrong segnum", offset);
        assert_eq!(u64_at(block, 16), offset, "block header offset mismatch");

        let skip_at = BLOCK_HEADER_LEN + nrec as usize * RECORD_SLOT_LEN;
        assert_eq!(
            u32_at(block, skip_at),
            RECORD_SKIP,
            "trailing slot at {} is not a skip record",
            offset
        );
        let next_segnum = u32_at(block, skip_at + 4);
        let next_offset = u64_at(block, skip_at + 8);
        let payload_end = u32_at(block, skip_at + 16) as usize;

        let len = if next_segnum == segnum {
            (next_offset - offset) as usize
        } else {
            (seg_start + segment_size - offset) as usize
        };
        assert!(len >= MIN_LOG_BLOCK_SIZE);
        assert_eq!(
            checksum,
            crc32(&block[4..len]),
            "block at {} failed its checksum",
            offset
        );

        let payload_at = skip_at + RECORD_SLOT_LEN;
        out.push(WalkedBlock {
            lsn_offset: offset,
            nrec,
            payload: block[payload_at..payload_at + payload_end].to_vec(),
        });

        if next_segnum == segnum {
            offset = next_offset;
        } else {
            segnum = next_segnum;
            seg_start = next_offset;
            offset = next_offset;
            file =
                fs::read(dir.join(format!("{:08x}.log", segnum))).unwrap();
        }
    }
    assert_eq!(offset, frontier);
    out
}

#[test]
fn single_producer_bytes_reach_disk_in_order() {
    let dir = test_dir("single_producer");
    let config = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(64 * 1024);
    let log = config.open().unwrap();

    let nblocks = 100;
    let bsz = block_size(1, 256) as u64;
    for i in 0..nblocks {
        let mut x = log.allocate(1, 256).unwrap();
        assert_eq!(x.lsn().offset, i * bsz);
        for b in x.payload().iter_mut() {
            *b = i as u8;
        }
        x.finalize();
        log.release(x);
    }

    log.wait_for_durable(nblocks * bsz);
    assert_eq!(log.dur_lsn_offset(), nblocks * bsz);

    let blocks = walk_log(&dir, 1024 * 1024, nblocks * bsz);
    assert_eq!(blocks.len(), nblocks as usize);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.lsn_offset, i as u64 * bsz);
        assert_eq!(block.nrec, 1);
        assert_eq!(block.payload, vec![i as u8; 256]);
    }

    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn ring_backpressure_loses_nothing() {
    // ring of 4 KiB, blocks just over 1 KiB: the producer has to wait
    // for the daemon repeatedly, and nothing may be lost or reordered
    let dir = test_dir("backpressure");
    let config = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(4096);
    let log = config.open().unwrap();

    let nblocks = 20;
    let bsz = block_size(1, 1024) as u64;
    assert!(bsz > 1024);
    for i in 0..nblocks {
        let mut x = log.allocate(1, 1024).unwrap();
        for b in x.payload().iter_mut() {
            *b = i as u8;
        }
        x.finalize();
        log.release(x);
    }

    log.wait_for_durable(nblocks * bsz);
    assert_eq!(log.dur_lsn_offset(), nblocks * bsz);
    assert_eq!(log.cur_lsn_offset(), nblocks * bsz);

    let blocks = walk_log(&dir, 1024 * 1024, nblocks * bsz);
    assert_eq!(blocks.len(), nblocks as usize);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.payload, vec![i as u8; 1024]);
    }

    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn segment_edge_produces_one_filler() {
    let segment_size = 4096_u64;
    let dir = test_dir("segment_edge");
    let config = Config::default()
        .path(&dir)
        .segment_size(segment_size as usize)
        .log_buf_size(4096);
    let log = config.open().unwrap();

    let bsz = block_size(1, 256) as u64; // 328
    let fit = (segment_size - MIN_LOG_BLOCK_SIZE as u64) / bsz;
    let prev_end = fit * bsz;

    for i in 0..fit {
        let mut x = log.allocate(1, 256).unwrap();
        assert_eq!(x.lsn().offset, i * bsz);
        x.finalize();
        log.release(x);
    }

    // this one would straddle the boundary: a filler closes the
    // segment and the real allocation lands at the segment start
    let mut x = log.allocate(1, 256).unwrap();
    assert_eq!(x.lsn().segnum, 1);
    assert_eq!(x.lsn().offset, segment_size);
    x.finalize();
    log.release(x);

    log.wait_for_durable(segment_size + bsz);

    let blocks = walk_log(&dir, segment_size, segment_size + bsz);
    // `fit` real blocks, one filler, one block in the next segment
    assert_eq!(blocks.len(), fit as usize + 2);

    let filler = &blocks[fit as usize];
    assert_eq!(filler.lsn_offset, prev_end);
    assert_eq!(filler.nrec, 0);
    assert!(filler.payload.is_empty());

    let first_of_next = &blocks[fit as usize + 1];
    assert_eq!(first_of_next.lsn_offset, segment_size);

    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn many_producers_out_of_order_release() {
    let dir = test_dir("many_producers");
    let config = Config::default()
        .path(&dir)
        .segment_size(128 * 1024)
        .log_buf_size(64 * 1024);
    let log = Arc::new(config.open().unwrap());

    let n_threads: u32 = 8;
    let per_thread: u32 = 1000;

    let mut threads = vec![];
    for t in 0..n_threads {
        let log = Arc::clone(&log);
        threads.push(
            thread::Builder::new()
                .name(format!("producer-{}", t))
                .spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut written = HashMap::new();
                    let mut pending = VecDeque::new();
                    let mut last_offset = 0;

                    for i in 0..per_thread {
                        let mut x = log.allocate(1, 8).unwrap();

                        // offsets handed to one thread are monotone
                        assert!(
                            i == 0 || x.lsn().offset > last_offset,
                            "offsets went backwards"
                        );
                        last_offset = x.lsn().offset;

                        let tag = u64::from(t) << 32 | u64::from(i);
                        x.payload().copy_from_slice(&tag.to_le_bytes());
                        x.finalize();
                        written.insert(x.lsn().offset, tag);
                        pending.push_back(x);

                        // release out of order with a randomized lag
                        if pending.len() > 4 || rng.gen_ratio(1, 3) {
                            let at = rng.gen_range(0, pending.len());
                            let x = pending.swap_remove_back(at).unwrap();
                            log.release(x);
                        }
                    }
                    for x in pending {
                        log.release(x);
                    }
                    written
                })
                .unwrap(),
        );
    }

    let mut expected = HashMap::new();
    for t in threads {
        for (offset, tag) in t.join().unwrap() {
            assert!(
                expected.insert(offset, tag).is_none(),
                "two blocks claimed offset {}",
                offset
            );
        }
    }

    let frontier = log.cur_lsn_offset();
    log.wait_for_durable(frontier);
    assert!(log.dur_lsn_offset() >= frontier);

    let mut found = 0;
    for block in walk_log(&dir, 128 * 1024, frontier) {
        if block.nrec == 0 {
            continue; // filler
        }
        let tag = u64_at(&block.payload, 0);
        assert_eq!(
            expected.get(&block.lsn_offset),
            Some(&tag),
            "block at {} carries the wrong payload",
            block.lsn_offset
        );
        found += 1;
    }
    assert_eq!(found, (n_threads * per_thread) as usize);

    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn durable_mark_blocks_until_release() {
    let dir = test_dir("durable_mark");
    let config = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(4096);
    let log = Arc::new(config.open().unwrap());

    // with nothing allocated this returns immediately
    log.update_durable_mark(0);

    let mut x = log.allocate(0, 64).unwrap();
    let end = x.lsn().offset + x.len() as u64;
    x.finalize();

    let releaser = {
        let log = Arc::clone(&log);
        thread::Builder::new()
            .name("releaser".to_string())
            .spawn(move || {
                thread::sleep(std::time::Duration::from_millis(50));
                log.release(x);
            })
            .unwrap()
    };

    // blocks until the releaser runs, then the mark is persisted
    log.update_durable_mark(end);
    assert!(log.dur_lsn_offset() >= end);
    releaser.join().unwrap();

    drop(log);

    // a fresh allocator over the same directory starts at the mark
    let log = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(4096)
        .open()
        .unwrap();
    assert!(log.dur_lsn_offset() >= end);
    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn clean_shutdown_flushes_everything() {
    let dir = test_dir("clean_shutdown");
    let config = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(4096);
    let log = config.open().unwrap();

    let mut frontier = 0;
    for i in 0..50 {
        let mut x = log.allocate(1, 64).unwrap();
        for b in x.payload().iter_mut() {
            *b = i as u8;
        }
        x.finalize();
        frontier = x.lsn().offset + x.len() as u64;
        log.release(x);
    }

    // no explicit wait: dropping the allocator must flush the rest
    drop(log);

    let blocks = walk_log(&dir, 1024 * 1024, frontier);
    assert_eq!(blocks.len(), 50);

    let log = Config::default()
        .path(&dir)
        .segment_size(1024 * 1024)
        .log_buf_size(4096)
        .open()
        .unwrap();
    assert_eq!(log.dur_lsn_offset(), frontier);
    assert_eq!(log.cur_lsn_offset(), frontier);
    drop(log);
    fs::remove_dir_all(&dir).unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(u32, usize),
    Release,
    Discard,
    WaitDurable,
}

impl Arbitrary for Op {
    fn arbitrary<G: Gen>(g: &mut G) -> Op {
        match g.gen_range(0, 5) {
            0 | 1 => Op::Allocate(g.gen_range(0, 3), 8 * g.gen_range(0, 16)),
            2 => Op::Release,
            3 => Op::Discard,
            _ => Op::WaitDurable,
        }
    }
}

#[derive(Debug, Clone)]
struct OpVec {
    ops: Vec<Op>,
}

impl Arbitrary for OpVec {
    fn arbitrary<G: Gen>(g: &mut G) -> OpVec {
        let mut ops = vec![];
        for _ in 0..g.gen_range(1, 60) {
            ops.push(Op::arbitrary(g));
        }
        OpVec { ops }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = OpVec>> {
        let mut smaller = vec![];
        for i in 0..self.ops.len() {
            let mut clone = self.clone();
            clone.ops.remove(i);
            smaller.push(clone);
        }
        Box::new(smaller.into_iter())
    }
}

fn prop_allocator_works(ops: OpVec) -> bool {
    let config = Config::default()
        .temporary(true)
        .segment_size(8192)
        .log_buf_size(4096);
    let log = config.open().unwrap();

    let mut pending: VecDeque<vellum::Allocation> = VecDeque::new();
    let mut last_cur = 0;
    let mut last_dur = 0;

    for op in ops.ops {
        match op {
            Op::Allocate(nrec, payload) => {
                // keep the span between the oldest live block and the
                // frontier well under the ring capacity, or this
                // allocation would wait on a durable advance that can
                // never happen
                while let Some(front) = pending.front() {
                    let span = log.cur_lsn_offset()
                        + block_size(nrec, payload) as u64
                        - front.lsn().offset;
                    if span <= 2048 {
                        break;
                    }
                    let x = pending.pop_front().unwrap();
                    log.release(x);
                }

                let mut x = log.allocate(nrec, payload).unwrap();
                for b in x.payload().iter_mut() {
                    *b = 0x5A;
                }
                x.finalize();
                pending.push_back(x);
            }
            Op::Release => {
                if let Some(x) = pending.pop_front() {
                    log.release(x);
                }
            }
            Op::Discard => {
                if let Some(x) = pending.pop_back() {
                    log.discard(x);
                }
            }
            Op::WaitDurable => {
                // only safe targets: everything already released
                let target = pending
                    .front()
                    .map(|x| x.lsn().offset)
                    .unwrap_or_else(|| log.cur_lsn_offset());
                log.wait_for_durable(target);
                assert!(log.dur_lsn_offset() >= target);
            }
        }

        let cur = log.cur_lsn_offset();
        let dur = log.dur_lsn_offset();
        assert!(cur >= last_cur, "frontier moved backwards");
        assert!(dur >= last_dur, "durable offset moved backwards");
        assert!(dur <= cur, "durable offset passed the frontier");
        last_cur = cur;
        last_dur = dur;
    }

    for x in pending {
        log.release(x);
    }
    let frontier = log.cur_lsn_offset();
    log.wait_for_durable(frontier);
    assert_eq!(log.dur_lsn_offset(), frontier);

    true
}

#[test]
fn quickcheck_allocator_works() {
    QuickCheck::new()
        .gen(StdGen::new(rand::thread_rng(), 100))
        .tests(50)
        .max_tests(100)
        .quickcheck(prop_allocator_works as fn(OpVec) -> bool);
}

#[test]
fn allocator_bug_01() {
    // a discard directly at the segment boundary must leave the
    // boundary filler and the discarded block distinguishable
    use Op::*;
    prop_allocator_works(OpVec {
        ops: vec![
            Allocate(1, 64),
            Allocate(0, 0),
            Discard,
            Release,
            WaitDurable,
        ],
    });
}

#[test]
fn allocator_bug_02() {
    // waiting for a durable target with nothing in flight must not
    // hang on the daemon's idle path
    use Op::*;
    prop_allocator_works(OpVec {
        ops: vec![WaitDurable, WaitDurable],
    });
}
