//! The in-memory record of a piece that is currently being downloaded.

use std::time::{Duration, Instant};

use sha1::Sha1;

use crate::{block_count, Bitfield, PieceIndex, Sha1Hash, BLOCK_LEN};

/// A block buffered in memory, waiting to be hashed and written to disk.
#[derive(Debug)]
pub(super) struct BufferedBlock {
    /// The block's byte offset in its piece, a multiple of 16 KiB.
    pub offset: u32,
    /// The block's data.
    pub data: Vec<u8>,
}

/// An in-progress piece, buffering its downloaded blocks until they can be
/// hashed and written to disk in batches.
///
/// For optimal performance, blocks should arrive in contiguous runs of
/// `write_cache_line_size`, following the last such run, so that a worker may
/// hash and write them in a single batch. Otherwise at most
/// `write_buffer_capacity` blocks are buffered, after which the whole buffer
/// is flushed, hashed or not. Blocks that were flushed without hashing are
/// read back once the piece completes, since the piece hash must be fed in
/// strict offset order.
///
/// At most one worker may process a piece at a time. The `is_busy` flag is
/// the handoff boundary: it is set on the disk task before a worker job is
/// spawned and cleared there when the job's result is handled. The job takes
/// ownership of the extracted blocks and of the hash context and returns
/// them in its result, so the two sides never share mutable state.
pub(super) struct PartialPiece {
    /// The piece's index in the torrent.
    pub index: PieceIndex,
    /// The length of this piece in bytes.
    pub len: u32,
    /// The expected hash of the whole piece, from the metainfo.
    pub expected_hash: Sha1Hash,
    /// Blocks buffered in memory, in offset order. Only the disk task
    /// touches this.
    pub buffer: Vec<BufferedBlock>,
    /// The offsets of blocks currently owned by a worker (the work buffer).
    /// Disjoint from the offsets in `buffer`.
    pub work: Vec<u32>,
    /// One bit per block: marks blocks that are durably on disk.
    pub saved: Bitfield,
    /// A cached count of the bits set in `saved`.
    pub num_saved_blocks: usize,
    /// The first byte not yet fed to the incremental hasher. Always a
    /// multiple of 16 KiB or equal to `len`. Advanced only by handling the
    /// result of the owning worker's job.
    pub unhashed_offset: u32,
    /// The incremental hash context. `None` while a worker owns it.
    pub hasher: Option<Sha1>,
    /// Whether a worker job for this piece is in flight. While set, the
    /// disk task must not extract blocks or touch the hash state.
    pub is_busy: bool,
    /// When the buffered blocks must be flushed at the latest. Armed when
    /// a block lands in an empty buffer.
    pub expiry: Option<Instant>,
    /// If a write failed, when to retry it. While set, new worker jobs are
    /// only dispatched once the deadline passes.
    pub retry_at: Option<Instant>,
    /// The number of consecutive failed write attempts, driving the retry
    /// backoff.
    pub num_write_failures: u32,
    /// The piece's hash verdict, once known. Only a positive verdict is
    /// ever stored: a piece failing its hash check is dropped right away.
    /// Used so that a save retried after the verdict does not hash or
    /// report the piece completion again.
    pub verdict: Option<bool>,
}

impl PartialPiece {
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let num_blocks = block_count(len);
        Self {
            index,
            len,
            expected_hash,
            buffer: Vec::new(),
            work: Vec::new(),
            saved: Bitfield::repeat(false, num_blocks),
            num_saved_blocks: 0,
            unhashed_offset: 0,
            hasher: Some(Sha1::default()),
            is_busy: false,
            expiry: None,
            retry_at: None,
            num_write_failures: 0,
            verdict: None,
        }
    }

    /// The total number of blocks in piece (i.e. not just the ones we have).
    pub fn num_blocks(&self) -> usize {
        block_count(self.len)
    }

    /// Whether all blocks have been received, regardless of whether they are
    /// still buffered, owned by a worker, or already saved to disk.
    pub fn is_complete(&self) -> bool {
        self.num_saved_blocks + self.work.len() + self.buffer.len()
            == self.num_blocks()
    }

    /// Whether the block at the given offset has already been received.
    pub fn has_block(&self, offset: u32) -> bool {
        let index = (offset / BLOCK_LEN) as usize;
        self.saved[index]
            || self.work.contains(&offset)
            || self.buffer.iter().any(|block| block.offset == offset)
    }

    /// Places the block in the buffer, keeping it ordered by offset, and
    /// arms the expiry deadline if the buffer was empty.
    ///
    /// The caller must have rejected duplicate blocks beforehand.
    pub fn insert_block(
        &mut self,
        offset: u32,
        data: Vec<u8>,
        expiry_timeout: Duration,
    ) {
        debug_assert!(!self.has_block(offset));
        if self.buffer.is_empty() {
            self.expiry = Some(Instant::now() + expiry_timeout);
        }
        let pos = self
            .buffer
            .iter()
            .position(|block| block.offset > offset)
            .unwrap_or(self.buffer.len());
        self.buffer.insert(pos, BufferedBlock { offset, data });
    }

    /// Returns the number of blocks at the front of the buffer that are
    /// contiguous and start at the unhashed offset, i.e. that may be fed to
    /// the hasher right away.
    pub fn hashable_prefix_len(&self) -> usize {
        let mut expected_offset = self.unhashed_offset;
        let mut count = 0;
        for block in self.buffer.iter() {
            if block.offset != expected_offset {
                break;
            }
            expected_offset += block.data.len() as u32;
            count += 1;
        }
        count
    }

    /// Extracts the first `count` buffered blocks into the work buffer,
    /// handing their data to the caller (the worker job).
    pub fn extract_blocks(&mut self, count: usize) -> Vec<BufferedBlock> {
        debug_assert!(!self.is_busy);
        debug_assert!(count <= self.buffer.len());
        let blocks: Vec<_> = self.buffer.drain(..count).collect();
        self.work.extend(blocks.iter().map(|block| block.offset));
        if self.buffer.is_empty() {
            self.expiry = None;
        }
        blocks
    }

    /// Puts blocks whose save failed back into the buffer so that the save
    /// may be retried later.
    ///
    /// This is slightly expensive but write errors are expected to be rare,
    /// and when they do occur we have bigger problems.
    pub fn restore_buffer(&mut self, blocks: Vec<BufferedBlock>) {
        for block in blocks.into_iter() {
            self.work.retain(|offset| *offset != block.offset);
            let pos = self
                .buffer
                .iter()
                .position(|b| b.offset > block.offset)
                .unwrap_or(self.buffer.len());
            self.buffer.insert(pos, block);
        }
        if self.expiry.is_none() && !self.buffer.is_empty() {
            self.expiry = Some(Instant::now());
        }
    }

    /// Marks the blocks at the given offsets as durably saved to disk and
    /// releases them from the work buffer.
    pub fn mark_saved(&mut self, offsets: &[u32]) {
        for offset in offsets.iter() {
            let index = (offset / BLOCK_LEN) as usize;
            debug_assert!(!self.saved[index]);
            self.saved.set(index, true);
            self.num_saved_blocks += 1;
            self.work.retain(|o| o != offset);
        }
        debug_assert_eq!(self.num_saved_blocks, self.saved.count_ones());
    }

    /// The length of the block at the given offset.
    pub fn block_len_at(&self, offset: u32) -> u32 {
        (self.len - offset).min(BLOCK_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    const EXPIRY: Duration = Duration::from_secs(60);

    fn piece(num_blocks: u32) -> PartialPiece {
        PartialPiece::new(0, num_blocks * BLOCK_LEN, [0; 20])
    }

    fn block(offset: u32) -> Vec<u8> {
        vec![offset as u8; BLOCK_LEN as usize]
    }

    fn assert_invariants(piece: &PartialPiece) {
        // buffer is offset-ordered
        assert!(piece
            .buffer
            .windows(2)
            .all(|pair| pair[0].offset < pair[1].offset));
        // buffer and work buffer are disjoint
        assert!(piece
            .buffer
            .iter()
            .all(|block| !piece.work.contains(&block.offset)));
        // the saved bitmap count is cached correctly
        assert_eq!(piece.num_saved_blocks, piece.saved.count_ones());
        // the unhashed offset is block aligned or the piece length
        assert!(
            piece.unhashed_offset % BLOCK_LEN == 0
                || piece.unhashed_offset == piece.len
        );
    }

    #[test]
    fn test_buffer_stays_ordered() {
        let mut piece = piece(4);
        for offset in [2, 0, 3, 1] {
            piece.insert_block(offset * BLOCK_LEN, block(offset), EXPIRY);
            assert_invariants(&piece);
        }
        assert!(piece.is_complete());
        assert_eq!(piece.hashable_prefix_len(), 4);
    }

    #[test]
    fn test_hashable_prefix_stops_at_gap() {
        let mut piece = piece(8);
        for offset in [0, 1, 2, 4, 5] {
            piece.insert_block(offset * BLOCK_LEN, block(offset), EXPIRY);
        }
        assert_eq!(piece.hashable_prefix_len(), 3);
        assert!(!piece.is_complete());
    }

    #[test]
    fn test_extract_and_mark_saved() {
        let mut piece = piece(4);
        for offset in 0..4 {
            piece.insert_block(offset * BLOCK_LEN, block(offset), EXPIRY);
        }

        let blocks = piece.extract_blocks(2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(piece.work, vec![0, BLOCK_LEN]);
        assert_eq!(piece.buffer.len(), 2);
        assert_invariants(&piece);

        piece.mark_saved(&[0, BLOCK_LEN]);
        assert!(piece.work.is_empty());
        assert_eq!(piece.num_saved_blocks, 2);
        assert_invariants(&piece);

        // the piece still counts as fully received
        assert!(piece.is_complete());
    }

    #[test]
    fn test_restore_buffer_after_failed_write() {
        let mut piece = piece(4);
        for offset in 0..4 {
            piece.insert_block(offset * BLOCK_LEN, block(offset), EXPIRY);
        }

        let blocks = piece.extract_blocks(4);
        assert!(piece.buffer.is_empty());

        piece.restore_buffer(blocks);
        assert!(piece.work.is_empty());
        assert_eq!(piece.buffer.len(), 4);
        assert!(piece.is_complete());
        assert_invariants(&piece);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut piece = piece(4);
        piece.insert_block(0, block(0), EXPIRY);
        assert!(piece.has_block(0));

        piece.extract_blocks(1);
        // a block owned by a worker still counts as received
        assert!(piece.has_block(0));

        piece.mark_saved(&[0]);
        assert!(piece.has_block(0));
        assert!(!piece.has_block(BLOCK_LEN));
    }

    #[test]
    fn test_expiry_armed_on_first_block() {
        let mut piece = piece(2);
        assert!(piece.expiry.is_none());

        piece.insert_block(0, block(0), EXPIRY);
        assert!(piece.expiry.is_some());

        piece.extract_blocks(1);
        assert!(piece.expiry.is_none());
    }
}
