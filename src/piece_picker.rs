use std::{cmp::Reverse, collections::HashSet, net::SocketAddr};

use rand::Rng;

use crate::{error::*, Bitfield, PieceIndex};

/// The priority group of pieces that have not been reprioritized. Pieces in
/// higher groups are picked first; pieces in group 0 are not downloaded at
/// all.
pub(crate) const DEFAULT_PRIORITY: u8 = 1;

/// The selection policy to apply when picking the next piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PickMode {
    /// Pick the piece with the lowest availability in the swarm, within the
    /// highest priority group the peer can serve. This is the default.
    RarestFirst,
    /// Pick pieces in index order. Used for streaming downloads.
    Sequential,
    /// Pick a random piece. Used at cold start, before availability
    /// statistics have accumulated, to spread initial picks across peers.
    Random,
}

/// The result of picking a piece for a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pick {
    pub index: PieceIndex,
    /// Whether the piece must be downloaded exclusively from the picked
    /// peer because it is on parole.
    pub is_parole: bool,
}

/// Metadata about a piece relevant for the piece picker.
#[derive(Clone, Copy)]
struct Piece {
    /// The number of connected peers that have this piece.
    frequency: usize,
    /// The piece's priority group. Higher groups are picked first.
    priority: u8,
    /// Whether we have already picked this piece and are currently
    /// downloading it. This flag is set when the piece is picked.
    ///
    /// This prevents picking the same piece again before the already
    /// running download finishes, which is what allows downloading multiple
    /// pieces simultaneously.
    is_pending: bool,
    /// A random value that breaks ordering ties so that picks of equally
    /// rare pieces are spread across peers.
    tiebreak: u32,
}

/// Tracks the piece availability of the swarm and picks the piece to
/// download next.
pub(crate) struct PiecePicker {
    /// Represents the pieces that we have downloaded.
    ///
    /// The bitfield is pre-allocated to the number of pieces in the torrent
    /// and each field that we have is set to true.
    own_pieces: Bitfield,
    /// We collect metadata about pieces in the torrent swarm in this
    /// vector. The vector is pre-allocated to the number of pieces in the
    /// torrent.
    pieces: Vec<Piece>,
    /// The order in which pieces are considered by the rarest-first policy.
    /// Rebuilt lazily when availability or priorities change.
    order: Vec<PieceIndex>,
    is_order_outdated: bool,
    /// Peers currently on parole due to a failed piece hash. Such a peer is
    /// only given pieces it downloads alone, until one of them validates.
    parole_peers: HashSet<SocketAddr>,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        let mut rng = rand::thread_rng();
        let pieces = (0..piece_count)
            .map(|_| Piece {
                frequency: 0,
                priority: DEFAULT_PRIORITY,
                is_pending: false,
                tiebreak: rng.gen(),
            })
            .collect();
        Self {
            own_pieces: Bitfield::repeat(false, piece_count),
            pieces,
            order: (0..piece_count).collect(),
            is_order_outdated: true,
            parole_peers: HashSet::new(),
        }
    }

    /// Returns the bitfield of the pieces we have.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    /// Returns the number of missing pieces that are needed to complete the
    /// download.
    pub fn count_missing_pieces(&self) -> usize {
        self.own_pieces.count_zeros()
    }

    /// Returns the number of pieces that are currently being downloaded.
    pub fn count_pending_pieces(&self) -> usize {
        self.pieces.iter().filter(|piece| piece.is_pending).count()
    }

    /// Whether the download has entered endgame: every block still missing
    /// belongs to a piece that is already being downloaded, so only
    /// duplicate requests can speed up the tail.
    pub fn is_in_endgame(&self) -> bool {
        let mut missing = 0;
        let mut pending = 0;
        for (index, piece) in self.pieces.iter().enumerate() {
            if !self.own_pieces[index] && piece.priority > 0 {
                missing += 1;
                if piece.is_pending {
                    pending += 1;
                }
            }
        }
        missing > 0 && missing == pending
    }

    /// Picks the next piece to download from the peer, or `None` if the
    /// peer has no piece we could start downloading now.
    ///
    /// The picked piece is marked as pending so repeated calls return
    /// distinct pieces. Once the download concludes, either
    /// [`Self::received_piece`] or [`Self::return_piece`] must be called.
    pub fn pick_piece(
        &mut self,
        available: &Bitfield,
        peer: SocketAddr,
        mode: PickMode,
    ) -> Option<Pick> {
        log::trace!("Picking next piece for {}", peer);
        debug_assert_eq!(available.len(), self.own_pieces.len());
        let is_parole = self.parole_peers.contains(&peer);

        let index = match mode {
            PickMode::RarestFirst => {
                if self.is_order_outdated {
                    self.rebuild_order();
                }
                self.order
                    .iter()
                    .copied()
                    .find(|index| self.is_pickable(*index, available))
            }
            PickMode::Sequential => (0..self.pieces.len())
                .find(|index| self.is_pickable(*index, available)),
            PickMode::Random => {
                let candidates: Vec<_> = (0..self.pieces.len())
                    .filter(|index| self.is_pickable(*index, available))
                    .collect();
                if candidates.is_empty() {
                    None
                } else {
                    let pick =
                        rand::thread_rng().gen_range(0..candidates.len());
                    Some(candidates[pick])
                }
            }
        }?;

        // set the pending flag on the piece so that this piece is not
        // picked again until its download concludes
        self.pieces[index].is_pending = true;
        log::trace!("Picked piece {} for {}", index, peer);
        Some(Pick { index, is_parole })
    }

    fn is_pickable(&self, index: PieceIndex, available: &Bitfield) -> bool {
        let piece = &self.pieces[index];
        !self.own_pieces[index]
            && !piece.is_pending
            && piece.priority > 0
            && piece.frequency > 0
            && available[index]
    }

    /// Sorts the pick order by descending priority group, then ascending
    /// availability, with a stable random tiebreak.
    fn rebuild_order(&mut self) {
        let pieces = &self.pieces;
        self.order.sort_unstable_by_key(|index| {
            let piece = &pieces[*index];
            (Reverse(piece.priority), piece.frequency, piece.tiebreak)
        });
        self.is_order_outdated = false;
    }

    /// Registers the availability of a peer's pieces and returns whether we
    /// are interested in the peer, i.e. whether it has a piece we lack.
    pub fn register_availability(&mut self, pieces: &Bitfield) -> Result<bool> {
        log::trace!(
            "Registering availability of {} piece(s)",
            pieces.count_ones()
        );
        if pieces.len() != self.own_pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        for (index, peer_has_piece) in pieces.iter().by_vals().enumerate() {
            if peer_has_piece {
                self.pieces[index].frequency += 1;
            }
        }
        self.is_order_outdated = true;
        Ok(self.is_interested(pieces))
    }

    /// Registers the availability of a single new piece of a peer (e.g. on
    /// a have message) and returns whether this makes the peer interesting.
    pub fn register_piece_availability(
        &mut self,
        index: PieceIndex,
    ) -> Result<bool> {
        log::trace!("Registering piece {} availability", index);
        if index >= self.pieces.len() {
            return Err(Error::InvalidPieceIndex);
        }
        self.pieces[index].frequency += 1;
        self.is_order_outdated = true;
        Ok(!self.own_pieces[index])
    }

    /// Removes a disconnecting peer's pieces from the availability counts.
    pub fn decrease_availability(&mut self, pieces: &Bitfield) {
        log::trace!(
            "Decreasing availability of {} piece(s)",
            pieces.count_ones()
        );
        debug_assert_eq!(pieces.len(), self.own_pieces.len());
        for (index, peer_has_piece) in pieces.iter().by_vals().enumerate() {
            if peer_has_piece {
                debug_assert!(self.pieces[index].frequency > 0);
                self.pieces[index].frequency =
                    self.pieces[index].frequency.saturating_sub(1);
            }
        }
        self.is_order_outdated = true;
    }

    /// Determines if we are interested in the given pieces. This happens if
    /// the pieces contain at least one piece that we don't have.
    pub fn is_interested(&self, pieces: &Bitfield) -> bool {
        for (has_piece, peer_has_piece) in self
            .own_pieces
            .iter()
            .by_vals()
            .zip(pieces.iter().by_vals())
        {
            if !has_piece && peer_has_piece {
                return true;
            }
        }
        false
    }

    /// Tells the piece picker that we have downloaded and verified the
    /// piece at the given index.
    pub fn received_piece(&mut self, index: PieceIndex) {
        log::trace!("Registering received piece {}", index);
        debug_assert!(index < self.pieces.len());
        self.own_pieces.set(index, true);
        // clear the pending flag: if the piece is ever re-downloaded, not
        // resetting it would cause us to never pick it again
        self.pieces[index].is_pending = false;
    }

    /// Returns a piece whose download concluded without a valid hash to the
    /// pickable pool.
    pub fn return_piece(&mut self, index: PieceIndex) {
        log::trace!("Returning piece {} for re-download", index);
        debug_assert!(index < self.pieces.len());
        debug_assert!(!self.own_pieces[index]);
        self.pieces[index].is_pending = false;
    }

    /// Assigns the piece to a priority group. Higher groups are picked
    /// first; group 0 is never picked.
    pub fn set_priority(&mut self, index: PieceIndex, group: u8) {
        debug_assert!(index < self.pieces.len());
        self.pieces[index].priority = group;
        self.is_order_outdated = true;
    }

    /// Puts the peer on parole: until one of its exclusively downloaded
    /// pieces validates, it is only given parole pieces.
    pub fn put_on_parole(&mut self, peer: SocketAddr) {
        log::info!("Putting {} on parole", peer);
        self.parole_peers.insert(peer);
    }

    /// Lifts the peer's parole after one of its parole pieces validated.
    pub fn lift_parole(&mut self, peer: SocketAddr) {
        if self.parole_peers.remove(&peer) {
            log::info!("Lifting parole of {}", peer);
        }
    }

    pub fn is_on_parole(&self, peer: &SocketAddr) -> bool {
        self.parole_peers.contains(peer)
    }

    /// Clears any parole bookkeeping of a disconnected peer.
    pub fn forget_peer(&mut self, peer: SocketAddr) {
        self.parole_peers.remove(&peer);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn picker_with_full_availability(piece_count: usize) -> PiecePicker {
        let mut picker = PiecePicker::new(piece_count);
        let available_pieces = Bitfield::repeat(true, piece_count);
        picker.register_availability(&available_pieces).unwrap();
        picker
    }

    // Tests that repeatedly requesting as many pieces as are in the piece
    // picker returns all pieces, none of them previously picked.
    #[test]
    fn test_pick_all_pieces() {
        let piece_count = 15;
        let mut picker = picker_with_full_availability(piece_count);
        let available = Bitfield::repeat(true, piece_count);

        let mut picked = HashSet::with_capacity(piece_count);

        for _ in 0..piece_count {
            let pick = picker
                .pick_piece(&available, addr(1), PickMode::RarestFirst)
                .expect("no piece picked");
            assert!(!pick.is_parole);
            // assert that this piece hasn't been picked before
            assert!(!picked.contains(&pick.index));
            picked.insert(pick.index);
        }

        // assert that we picked all pieces
        assert_eq!(picked.len(), piece_count);
        assert!(picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .is_none());
    }

    // Tests registering a received piece causes the piece picker to not
    // pick that piece again.
    #[test]
    fn test_received_piece() {
        let piece_count = 15;
        let mut picker = picker_with_full_availability(piece_count);
        let available = Bitfield::repeat(true, piece_count);
        assert!(picker.own_pieces.not_any());

        let owned_pieces = [3, 10, 5];
        for index in owned_pieces.iter() {
            picker.received_piece(*index);
            assert!(picker.own_pieces[*index]);
        }

        for _ in 0..piece_count - owned_pieces.len() {
            let pick = picker
                .pick_piece(&available, addr(1), PickMode::RarestFirst)
                .unwrap();
            assert!(owned_pieces.iter().all(|owned| *owned != pick.index));
        }
    }

    // Tests that the rarest-first policy always picks a piece with minimum
    // availability among the pieces the peer has, within the highest
    // priority group.
    #[test]
    fn test_rarest_first_picks_minimum_availability() {
        let piece_count = 8;
        let mut picker = picker_with_full_availability(piece_count);

        // pieces 2 and 5 are held by two more peers, piece 6 by one more
        let mut more = Bitfield::repeat(false, piece_count);
        more.set(2, true);
        more.set(5, true);
        more.set(6, true);
        picker.register_availability(&more).unwrap();
        let mut more = Bitfield::repeat(false, piece_count);
        more.set(2, true);
        more.set(5, true);
        picker.register_availability(&more).unwrap();

        let available = Bitfield::repeat(true, piece_count);
        // the first five picks must be among the five rarest pieces
        let rarest: HashSet<usize> = [0, 1, 3, 4, 7].iter().copied().collect();
        for _ in 0..rarest.len() {
            let pick = picker
                .pick_piece(&available, addr(1), PickMode::RarestFirst)
                .unwrap();
            assert!(rarest.contains(&pick.index));
        }
        // then the more common piece 6, then 2 and 5
        let pick = picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .unwrap();
        assert_eq!(pick.index, 6);
    }

    // Tests that pieces in a higher priority group are picked before rarer
    // pieces of a lower group, and that group 0 is never picked.
    #[test]
    fn test_priority_groups() {
        let piece_count = 4;
        let mut picker = picker_with_full_availability(piece_count);

        // piece 3 is the most common but highest priority; piece 0 must
        // never be downloaded
        let mut more = Bitfield::repeat(false, piece_count);
        more.set(3, true);
        picker.register_availability(&more).unwrap();
        picker.set_priority(3, 7);
        picker.set_priority(0, 0);

        let available = Bitfield::repeat(true, piece_count);
        let pick = picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .unwrap();
        assert_eq!(pick.index, 3);

        let mut rest = Vec::new();
        while let Some(pick) =
            picker.pick_piece(&available, addr(1), PickMode::RarestFirst)
        {
            rest.push(pick.index);
        }
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 2]);
    }

    // Tests that the sequential mode picks pieces in index order.
    #[test]
    fn test_sequential_mode() {
        let piece_count = 6;
        let mut picker = picker_with_full_availability(piece_count);

        // make later pieces rarer, which sequential mode must ignore
        let mut more = Bitfield::repeat(true, piece_count);
        more.set(4, false);
        more.set(5, false);
        picker.register_availability(&more).unwrap();

        let available = Bitfield::repeat(true, piece_count);
        for expected in 0..piece_count {
            let pick = picker
                .pick_piece(&available, addr(1), PickMode::Sequential)
                .unwrap();
            assert_eq!(pick.index, expected);
        }
    }

    // Tests that only pieces the peer has are picked.
    #[test]
    fn test_respects_peer_availability() {
        let piece_count = 4;
        let mut picker = picker_with_full_availability(piece_count);

        let mut available = Bitfield::repeat(false, piece_count);
        available.set(2, true);
        let pick = picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .unwrap();
        assert_eq!(pick.index, 2);
        assert!(picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .is_none());
    }

    // Tests that the piece picker correctly determines whether we are
    // interested in a variety of piece sets.
    #[test]
    fn test_is_interested() {
        // empty piece picker
        let piece_count = 15;
        let picker = PiecePicker::new(piece_count);

        // we are interested if peer has all pieces
        let available_pieces = Bitfield::repeat(true, piece_count);
        assert!(picker.is_interested(&available_pieces));

        // we are also interested if peer has at least a single piece
        let mut available_pieces = Bitfield::repeat(false, piece_count);
        available_pieces.set(0, true);
        assert!(picker.is_interested(&available_pieces));

        // half full piece picker
        let mut picker = PiecePicker::new(piece_count);
        for index in 0..8 {
            picker.received_piece(index);
        }

        // we are not interested in peer that has the same pieces we do
        let mut available_pieces = Bitfield::repeat(false, piece_count);
        for index in 0..8 {
            available_pieces.set(index, true);
        }
        assert!(!picker.is_interested(&available_pieces));

        // we are interested in peer that has at least a single piece we
        // don't
        let mut available_pieces = Bitfield::repeat(false, piece_count);
        for index in 0..9 {
            available_pieces.set(index, true);
        }
        assert!(picker.is_interested(&available_pieces));
    }

    // Tests endgame detection: it starts once every missing piece is being
    // downloaded and ends when the download completes.
    #[test]
    fn test_endgame_detection() {
        let piece_count = 3;
        let mut picker = picker_with_full_availability(piece_count);
        let available = Bitfield::repeat(true, piece_count);

        picker.received_piece(0);
        assert!(!picker.is_in_endgame());

        picker.pick_piece(&available, addr(1), PickMode::RarestFirst);
        assert!(!picker.is_in_endgame());
        picker.pick_piece(&available, addr(1), PickMode::RarestFirst);
        assert!(picker.is_in_endgame());

        picker.received_piece(1);
        picker.received_piece(2);
        assert!(!picker.is_in_endgame());
    }

    // Tests that a returned piece (failed hash check) becomes pickable
    // again, and that parole status follows the picker's bookkeeping.
    #[test]
    fn test_parole_and_return_piece() {
        let piece_count = 2;
        let mut picker = picker_with_full_availability(piece_count);
        let available = Bitfield::repeat(true, piece_count);

        let pick = picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .unwrap();
        assert!(!pick.is_parole);

        // the piece failed its hash check: the downloader goes on parole
        // and the piece becomes pickable again
        picker.return_piece(pick.index);
        picker.put_on_parole(addr(1));
        assert!(picker.is_on_parole(&addr(1)));

        let repick = picker
            .pick_piece(&available, addr(1), PickMode::RarestFirst)
            .unwrap();
        assert!(repick.is_parole);

        // other peers are unaffected
        let other = picker
            .pick_piece(&available, addr(2), PickMode::RarestFirst)
            .unwrap();
        assert!(!other.is_parole);

        picker.lift_parole(addr(1));
        assert!(!picker.is_on_parole(&addr(1)));
    }

    // Tests the random cold start mode eventually reaches all pieces.
    #[test]
    fn test_random_mode() {
        let piece_count = 10;
        let mut picker = picker_with_full_availability(piece_count);
        let available = Bitfield::repeat(true, piece_count);

        let mut picked = HashSet::new();
        while let Some(pick) =
            picker.pick_piece(&available, addr(1), PickMode::Random)
        {
            assert!(picked.insert(pick.index));
        }
        assert_eq!(picked.len(), piece_count);
    }
}
