use std::{collections::HashMap, net::SocketAddr};

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

/// The state of a single block within an ongoing piece download.
#[derive(Clone, Debug)]
enum Block {
    /// The block has not been requested from anyone.
    Free,
    /// The block has been requested from the peers in the list. Outside of
    /// endgame this is always a single peer; in endgame duplicate requests
    /// to several peers are allowed.
    Requested { peers: Vec<SocketAddr> },
    /// The block has arrived and been handed to the disk task.
    Received,
    /// The block is durably on disk.
    Written,
}

impl Default for Block {
    fn default() -> Self {
        Self::Free
    }
}

/// Tracks the completion of an ongoing piece download: which blocks are
/// free, requested (and from whom), received, and written to disk. It is
/// used to request missing blocks in piece and to attribute the piece to
/// its downloaders once its hash verdict is known.
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The blocks in this piece. The vec is preallocated to the number of
    /// blocks in piece.
    blocks: Vec<Block>,
    /// The number of unique blocks each peer has contributed. Used to
    /// notify all participants on completion and to single out the parole
    /// candidate if the piece fails its hash check.
    contributors: HashMap<SocketAddr, usize>,
    /// Set if this piece is downloaded exclusively by a peer on parole.
    parole_peer: Option<SocketAddr>,
}

/// What `post_hash_result` tells the caller about a concluded piece.
#[derive(Debug)]
pub(crate) struct HashResult {
    /// Every peer that contributed blocks to the piece. All of them are
    /// notified of the piece's fate.
    pub participants: Vec<SocketAddr>,
    /// On a failed hash check, the peer that contributed the most (or all)
    /// of the piece's blocks, to be put on parole.
    pub parole_candidate: Option<SocketAddr>,
}

impl PieceDownload {
    /// Creates a new piece download instance for the given piece.
    pub fn new(index: PieceIndex, len: u32) -> Self {
        let block_count = block_count(len);
        let mut blocks = Vec::new();
        blocks.resize_with(block_count, Default::default);
        Self {
            index,
            len,
            blocks,
            contributors: HashMap::new(),
            parole_peer: None,
        }
    }

    /// Creates a piece download that only the given peer, which is on
    /// parole, may participate in. This makes a failed hash check
    /// attributable to a single peer.
    pub fn new_parole(index: PieceIndex, len: u32, peer: SocketAddr) -> Self {
        let mut download = Self::new(index, len);
        download.parole_peer = Some(peer);
        download
    }

    /// Returns the index of the piece that is downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Returns the peer downloading this piece on parole, if any.
    pub fn parole_peer(&self) -> Option<SocketAddr> {
        self.parole_peer
    }

    /// Picks at most the requested number of blocks for the peer and marks
    /// them as requested by it.
    ///
    /// Only free blocks are picked, unless `allow_duplicates` is set (the
    /// endgame), in which case blocks requested from other peers may be
    /// picked a second time to unstick the final blocks of a download.
    pub fn pick_blocks(
        &mut self,
        peer: SocketAddr,
        count: usize,
        blocks: &mut Vec<BlockInfo>,
        allow_duplicates: bool,
    ) {
        // a parole piece is downloaded by its parole peer alone
        if let Some(parole_peer) = self.parole_peer {
            if parole_peer != peer {
                return;
            }
        }

        log::trace!(
            "Picking {} block(s) in piece {} (length: {}, blocks: {})",
            count,
            self.index,
            self.len,
            self.blocks.len(),
        );

        let mut picked = 0;

        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }

            match block {
                Block::Free => {
                    blocks.push(BlockInfo {
                        piece_index: self.index,
                        offset: i as u32 * BLOCK_LEN,
                        len: block_len(self.len, i),
                    });
                    *block = Block::Requested { peers: vec![peer] };
                    picked += 1;
                }
                Block::Requested { peers } if allow_duplicates => {
                    // don't request the same block from the same peer twice
                    if !peers.contains(&peer) {
                        blocks.push(BlockInfo {
                            piece_index: self.index,
                            offset: i as u32 * BLOCK_LEN,
                            len: block_len(self.len, i),
                        });
                        peers.push(peer);
                        picked += 1;
                    }
                }
                _ => {}
            }
        }

        if picked > 0 {
            log::debug!(
                "Picked {} block(s) for piece {}: {:?}",
                picked,
                self.index,
                &blocks[blocks.len() - picked..]
            );
        } else {
            log::trace!("Cannot pick any blocks in piece {}", self.index);
        }
    }

    /// Marks the block as received from the peer so that it is not picked
    /// again.
    ///
    /// Returns the other peers that have an outstanding request for the same
    /// block, so that the caller may send each a cancel message. This list
    /// is only non-empty in endgame.
    pub fn got_block(
        &mut self,
        peer: SocketAddr,
        block: &BlockInfo,
    ) -> Vec<SocketAddr> {
        log::trace!("Received piece {} block {}", self.index, block);

        debug_assert_eq!(block.piece_index, self.index);
        debug_assert!(block.offset < self.len);
        debug_assert!(block.len <= self.len);

        let slot = &mut self.blocks[block.index_in_piece()];
        let others = match slot {
            Block::Requested { peers } => {
                let others = peers
                    .iter()
                    .filter(|other| **other != peer)
                    .copied()
                    .collect();
                *slot = Block::Received;
                others
            }
            Block::Free => {
                // an unsolicited but nonetheless useful block
                *slot = Block::Received;
                Vec::new()
            }
            // a duplicate arrival in endgame; the block was already counted
            _ => return Vec::new(),
        };

        *self.contributors.entry(peer).or_insert(0) += 1;
        others
    }

    /// Releases the peer's outstanding request for the block, returning it
    /// to the free pool unless another peer still has it requested (which
    /// only happens in endgame).
    pub fn time_out(&mut self, peer: SocketAddr, block: &BlockInfo) {
        log::trace!(
            "Timing out piece {} block {} of peer {}",
            self.index,
            block,
            peer
        );

        debug_assert_eq!(block.piece_index, self.index);
        let slot = &mut self.blocks[block.index_in_piece()];
        if let Block::Requested { peers } = slot {
            peers.retain(|other| *other != peer);
            if peers.is_empty() {
                *slot = Block::Free;
            }
        }
    }

    /// Releases every outstanding request of the peer, e.g. when its
    /// session is dropped or it chokes us.
    pub fn cancel_peer(&mut self, peer: SocketAddr) {
        for slot in self.blocks.iter_mut() {
            if let Block::Requested { peers } = slot {
                peers.retain(|other| *other != peer);
                if peers.is_empty() {
                    *slot = Block::Free;
                }
            }
        }
    }

    /// Returns a received block to the free pool. Used when its disk save
    /// concluded without the block having been persisted, so that it is
    /// downloaded again.
    pub fn release_block(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_index, self.index);
        let slot = &mut self.blocks[block.index_in_piece()];
        if matches!(slot, Block::Received) {
            *slot = Block::Free;
        }
    }

    /// Marks the block as durably written to disk.
    pub fn mark_written(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_index, self.index);
        let slot = &mut self.blocks[block.index_in_piece()];
        debug_assert!(
            matches!(slot, Block::Received | Block::Written),
            "block {} written before being received",
            block
        );
        *slot = Block::Written;
    }

    /// Concludes the download with the piece's hash verdict.
    ///
    /// Returns the peers that participated in the download and, on a failed
    /// check, the peer that contributed the most unique blocks as the
    /// parole candidate.
    pub fn post_hash_result(&mut self, is_valid: bool) -> HashResult {
        let participants: Vec<_> = self.contributors.keys().copied().collect();
        let parole_candidate = if is_valid {
            None
        } else {
            self.contributors
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(peer, _)| *peer)
        };
        HashResult {
            participants,
            parole_candidate,
        }
    }

    /// Returns true if all of the piece's blocks have been received.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| matches!(block, Block::Received | Block::Written))
    }

    /// Returns the number of blocks that can still be picked (without
    /// duplicating requests).
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| matches!(block, Block::Free))
            .count()
    }

    /// Returns the number of blocks whose request is outstanding.
    pub fn count_requested_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| matches!(block, Block::Requested { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Asserts that the four block states partition the piece's blocks:
    /// every block is in exactly one state.
    fn assert_partition(download: &PieceDownload) {
        let free = download.count_missing_blocks();
        let requested = download.count_requested_blocks();
        let done = download
            .blocks
            .iter()
            .filter(|block| {
                matches!(block, Block::Received | Block::Written)
            })
            .count();
        assert_eq!(free + requested + done, download.blocks.len());
    }

    // Tests that repeatedly requesting as many blocks as are in the piece
    // returns all blocks, none of them previously picked.
    #[test]
    fn test_pick_all_blocks_one_by_one() {
        let piece_len = 6 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let block_count = block_count(piece_len);
        let mut picked = HashSet::with_capacity(block_count);

        for _ in 0..block_count {
            let mut blocks = Vec::new();
            download.pick_blocks(addr(1), 1, &mut blocks, false);
            assert_eq!(blocks.len(), 1);
            let block = *blocks.first().unwrap();
            // assert that this block hasn't been picked before
            assert!(!picked.contains(&block));
            picked.insert(block);
            assert_partition(&download);
        }

        // assert that we picked all blocks
        assert_eq!(picked.len(), block_count);
        assert_eq!(download.count_missing_blocks(), 0);
        assert_eq!(download.count_requested_blocks(), block_count);
    }

    // Tests that a received block is not picked again and that receiving
    // all blocks completes the download.
    #[test]
    fn test_receive_all_blocks() {
        let piece_len = 6 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), block_count(piece_len), &mut blocks, false);

        for block in blocks.iter() {
            let cancels = download.got_block(addr(1), block);
            assert!(cancels.is_empty());
            assert_partition(&download);
        }
        assert!(download.is_complete());

        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), block_count(piece_len), &mut blocks, false);
        assert!(blocks.is_empty());
    }

    // Tests that a timed out block becomes pickable again by another peer.
    #[test]
    fn test_time_out_frees_block() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), 1, &mut blocks, false);
        assert_eq!(blocks.len(), 1);

        download.time_out(addr(1), &blocks[0]);
        assert_eq!(download.count_missing_blocks(), 2);
        assert_partition(&download);

        let mut blocks = Vec::new();
        download.pick_blocks(addr(2), 2, &mut blocks, false);
        assert_eq!(blocks.len(), 2);
    }

    // Tests endgame duplicate requests: the same block may be requested
    // from several peers, receiving it reports the others for cancelling,
    // and a timeout of one duplicate doesn't free the block.
    #[test]
    fn test_endgame_duplicates_and_cancels() {
        let piece_len = BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), 1, &mut blocks, false);
        assert_eq!(blocks.len(), 1);
        let block = blocks[0];

        // without duplicates no more picks are possible
        let mut dup = Vec::new();
        download.pick_blocks(addr(2), 1, &mut dup, false);
        assert!(dup.is_empty());

        // in endgame the block may be requested from a second peer, but
        // not from the same peer twice
        download.pick_blocks(addr(2), 1, &mut dup, true);
        assert_eq!(dup.len(), 1);
        let mut same = Vec::new();
        download.pick_blocks(addr(2), 1, &mut same, true);
        assert!(same.is_empty());

        // a timeout of one duplicate keeps the request of the other
        download.time_out(addr(1), &block);
        assert_eq!(download.count_missing_blocks(), 0);
        assert_eq!(download.count_requested_blocks(), 1);
        download.pick_blocks(addr(1), 1, &mut Vec::new(), true);

        // the first arrival reports every other requester for cancelling
        let cancels = download.got_block(addr(2), &block);
        assert_eq!(cancels, vec![addr(1)]);
        assert_partition(&download);

        // the duplicate arrival from the slower peer reports nothing
        let cancels = download.got_block(addr(1), &block);
        assert!(cancels.is_empty());
    }

    // Tests that a failed hash check blames the largest contributor, while
    // a passed one blames no one.
    #[test]
    fn test_post_hash_result_parole_attribution() {
        let piece_len = 3 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        // peer 1 contributes two blocks, peer 2 one
        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), 2, &mut blocks, false);
        for block in blocks.iter() {
            download.got_block(addr(1), block);
        }
        let mut blocks = Vec::new();
        download.pick_blocks(addr(2), 1, &mut blocks, false);
        download.got_block(addr(2), &blocks[0]);

        let result = download.post_hash_result(false);
        let mut participants = result.participants.clone();
        participants.sort();
        assert_eq!(participants, vec![addr(1), addr(2)]);
        assert_eq!(result.parole_candidate, Some(addr(1)));

        let result = download.post_hash_result(true);
        assert!(result.parole_candidate.is_none());
    }

    // Tests that a parole download only serves its parole peer.
    #[test]
    fn test_parole_download_is_exclusive() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new_parole(0, piece_len, addr(1));

        let mut blocks = Vec::new();
        download.pick_blocks(addr(2), 2, &mut blocks, false);
        assert!(blocks.is_empty());

        download.pick_blocks(addr(1), 2, &mut blocks, false);
        assert_eq!(blocks.len(), 2);
    }

    // Tests that written blocks stay written and the partition covers all
    // transitions.
    #[test]
    fn test_written_blocks() {
        let piece_len = 2 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(addr(1), 2, &mut blocks, false);
        for block in blocks.iter() {
            download.got_block(addr(1), block);
            download.mark_written(block);
            assert_partition(&download);
        }
        assert!(download.is_complete());
        assert_eq!(download.count_missing_blocks(), 0);
        assert_eq!(download.count_requested_blocks(), 0);
    }
}
