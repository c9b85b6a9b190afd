// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod alert;
mod avg;
pub mod conf;
mod counter;
mod disk;
mod download;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
mod ratelimit;
mod storage_info;
mod torrent;
mod tracker;

use std::sync::Arc;

use bitvec::prelude::{BitVec, Msb0};

use disk::buffer::DiskBuffer;

pub use storage_info::FileInfo;
pub use torrent::{
    PieceStats, Torrent, TorrentHandle, TorrentParams, TorrentStats,
};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes) except for
    /// the last block of the last piece, which may be shorter.
    pub len: u32,
}

impl BlockInfo {
    /// Creates a `BlockInfo` instance with the default length of 16 KiB.
    pub fn new(piece_index: PieceIndex, offset: u32) -> Self {
        Self {
            piece_index,
            offset,
            len: BLOCK_LEN,
        }
    }

    /// Returns the index of the block within its piece, assuming the default
    /// block length of 16 KiB.
    pub fn index_in_piece(&self) -> usize {
        // we need to use "lower than or equal" as this may be the last block in
        // which case it may be shorter than the default block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }

    /// Returns whether the block's offset is aligned and its length is within
    /// bounds for a piece of the given length.
    pub fn is_valid(&self, piece_len: u32) -> bool {
        self.offset % BLOCK_LEN == 0
            && self.len > 0
            && self.len <= BLOCK_LEN
            && self.offset + self.len <= piece_len
    }
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "block (piece: {}, offset: {}, len: {})",
            self.piece_index, self.offset, self.len
        )
    }
}

/// An immutable, shared view of a block's data, as stored in the read cache
/// and handed to peer sessions for transmission without copying.
pub(crate) type CachedBlock = Arc<DiskBuffer>;

/// A block that has been read from disk (or the read cache) and is ready to
/// be sent to a peer.
#[derive(Clone, Debug)]
pub(crate) struct Block {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The actual raw data of the block, shared with the read cache.
    pub data: CachedBlock,
}

impl Block {
    pub fn new(info: BlockInfo, data: CachedBlock) -> Self {
        debug_assert_eq!(info.len as usize, data.len());
        Self {
            piece_index: info.piece_index,
            offset: info.offset,
            data,
        }
    }

    /// Returns a `BlockInfo` representing the location of this block within
    /// its torrent.
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            offset: self.offset,
            len: self.data.len() as u32,
        }
    }
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the length of the block at the given index in a piece of the given
/// length.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    debug_assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN), 1);
        assert_eq!(block_count(BLOCK_LEN - 1), 1);
        assert_eq!(block_count(4 * BLOCK_LEN), 4);
        assert_eq!(block_count(4 * BLOCK_LEN - 935), 4);
        assert_eq!(block_count(4 * BLOCK_LEN + 1), 5);
    }

    #[test]
    fn test_block_len() {
        let piece_len = 4 * BLOCK_LEN - 935;
        assert_eq!(block_len(piece_len, 0), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 2), BLOCK_LEN);
        assert_eq!(block_len(piece_len, 3), BLOCK_LEN - 935);
    }

    #[test]
    fn test_block_info_validity() {
        let piece_len = 2 * BLOCK_LEN + 100;
        assert!(BlockInfo::new(0, 0).is_valid(piece_len));
        assert!(BlockInfo::new(0, BLOCK_LEN).is_valid(piece_len));
        // the last block may be shorter than the rest
        assert!(BlockInfo {
            piece_index: 0,
            offset: 2 * BLOCK_LEN,
            len: 100,
        }
        .is_valid(piece_len));
        // misaligned offset
        assert!(!BlockInfo {
            piece_index: 0,
            offset: 100,
            len: BLOCK_LEN,
        }
        .is_valid(piece_len));
        // block overhangs the end of piece
        assert!(!BlockInfo {
            piece_index: 0,
            offset: 2 * BLOCK_LEN,
            len: BLOCK_LEN,
        }
        .is_valid(piece_len));
        // zero length
        assert!(!BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 0,
        }
        .is_valid(piece_len));
    }
}
