//! The physical layout of one log block: a fixed header, `nrec + 1`
//! fixed-size record slots, then the payload area. Slot `nrec` is always
//! a skip record carrying the next block's LSN, so a recovery scanner can
//! walk past filler blocks and blocks whose writers aborted.

use crate::{arr_to_u32, arr_to_u64, crc32, u32_to_arr, u64_to_arr, Lsn};

/// Length of the block header in bytes.
///
/// layout, all little-endian:
///   \[0..4\)   checksum over everything after it
///   \[4..8\)   nrec
///   \[8..12\)  lsn segment number
///   \[12..16\) reserved, zero
///   \[16..24\) lsn offset
pub const BLOCK_HEADER_LEN: usize = 24;

/// Length of one record slot in bytes.
///
/// layout of a skip record, all little-endian:
///   \[0..4\)   record type
///   \[4..8\)   next lsn segment number
///   \[8..16\)  next lsn offset
///   \[16..20\) payload_end
///   \[20..24\) reserved, zero
pub const RECORD_SLOT_LEN: usize = 24;

/// The smallest possible block: a bare header plus its skip record.
/// Any block touching the last `MIN_LOG_BLOCK_SIZE` bytes of a segment
/// becomes a filler skip block.
pub const MIN_LOG_BLOCK_SIZE: usize = BLOCK_HEADER_LEN + RECORD_SLOT_LEN;

/// The record-type tag of a skip record.
pub const RECORD_SKIP: u32 = 1;

/// Returns the number of bytes occupied by a block carrying `nrec`
/// records and `payload_bytes` of payload, including the trailing
/// skip record.
pub const fn block_size(nrec: u32, payload_bytes: usize) -> usize {
    BLOCK_HEADER_LEN + (nrec as usize + 1) * RECORD_SLOT_LEN + payload_bytes
}

/// A view over the raw bytes of one reserved block in the log buffer.
pub(crate) struct BlockView<'a> {
    buf: &'a mut [u8],
}

impl<'a> BlockView<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> BlockView<'a> {
        assert!(buf.len() >= MIN_LOG_BLOCK_SIZE);
        BlockView { buf }
    }

    /// Write the header and the trailing skip record. The checksum is
    /// left zeroed; `finalize` computes it once the caller has written
    /// any payload.
    pub(crate) fn init(
        &mut self,
        lsn: Lsn,
        nrec: u32,
        next_lsn: Lsn,
        payload_bytes: usize,
    ) {
        assert_eq!(self.buf.len(), block_size(nrec, payload_bytes));
        self.buf[0..4].copy_from_slice(&[0; 4]);
        self.buf[4..8].copy_from_slice(&u32_to_arr(nrec));
        self.buf[8..12].copy_from_slice(&u32_to_arr(lsn.segnum));
        self.buf[12..16].copy_from_slice(&[0; 4]);
        self.buf[16..24].copy_from_slice(&u64_to_arr(lsn.offset));
        self.fill_skip_record(nrec, next_lsn, payload_bytes);
    }

    fn slot_range(&self, idx: u32) -> std::ops::Range<usize> {
        let start = BLOCK_HEADER_LEN + idx as usize * RECORD_SLOT_LEN;
        start..start + RECORD_SLOT_LEN
    }

    fn fill_skip_record(
        &mut self,
        idx: u32,
        next_lsn: Lsn,
        payload_bytes: usize,
    ) {
        let range = self.slot_range(idx);
        let slot = &mut self.buf[range];
        slot[0..4].copy_from_slice(&u32_to_arr(RECORD_SKIP));
        slot[4..8].copy_from_slice(&u32_to_arr(next_lsn.segnum));
        slot[8..16].copy_from_slice(&u64_to_arr(next_lsn.offset));
        slot[16..20].copy_from_slice(&u32_to_arr(payload_bytes as u32));
        slot[20..24].copy_from_slice(&[0; 4]);
    }

    pub(crate) fn nrec(&self) -> u32 {
        arr_to_u32(&self.buf[4..8])
    }

    pub(crate) fn lsn(&self) -> Lsn {
        Lsn::new(arr_to_u32(&self.buf[8..12]), arr_to_u64(&self.buf[16..24]))
    }

    pub(crate) fn checksum(&self) -> u32 {
        arr_to_u32(&self.buf[0..4])
    }

    pub(crate) fn record_type(&self, idx: u32) -> u32 {
        let range = self.slot_range(idx);
        arr_to_u32(&self.buf[range][0..4])
    }

    pub(crate) fn skip_next_lsn(&self, idx: u32) -> Lsn {
        let range = self.slot_range(idx);
        let slot = &self.buf[range];
        Lsn::new(arr_to_u32(&slot[4..8]), arr_to_u64(&slot[8..16]))
    }

    pub(crate) fn trailing_is_skip(&self) -> bool {
        self.record_type(self.nrec()) == RECORD_SKIP
    }

    /// The record slots the caller may fill, excluding the trailing
    /// skip record.
    pub(crate) fn records(&mut self) -> &mut [u8] {
        let nrec = self.nrec() as usize;
        let end = BLOCK_HEADER_LEN + nrec * RECORD_SLOT_LEN;
        &mut self.buf[BLOCK_HEADER_LEN..end]
    }

    /// The payload area after the record slots.
    pub(crate) fn payload(&mut self) -> &mut [u8] {
        let nrec = self.nrec() as usize;
        let start = BLOCK_HEADER_LEN + (nrec + 1) * RECORD_SLOT_LEN;
        &mut self.buf[start..]
    }

    pub(crate) fn full_checksum(&self) -> u32 {
        crc32(&self.buf[4..])
    }

    /// Stamp the checksum over the current contents. Called once the
    /// caller has written records and payload.
    pub(crate) fn finalize(&mut self) {
        let crc = self.full_checksum();
        self.buf[0..4].copy_from_slice(&u32_to_arr(crc));
    }

    /// Turn this block into an empty skip block: the trailing skip
    /// record moves to slot 0, its `payload_end` is zeroed, `nrec`
    /// drops to 0, and the checksum is recomputed over the result.
    pub(crate) fn rewrite_as_skip(&mut self) {
        let nrec = self.nrec();
        assert_eq!(self.record_type(nrec), RECORD_SKIP);

        let from = self.slot_range(nrec);
        let to = self.slot_range(0);
        self.buf.copy_within(from, to.start);

        // zero payload_end in the moved slot
        let slot = &mut self.buf[to];
        slot[16..20].copy_from_slice(&[0; 4]);

        self.buf[4..8].copy_from_slice(&[0; 4]);
        self.finalize();
    }
}
