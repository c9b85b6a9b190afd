use std::time::Duration;

/// Aggregated statistics of a torrent, published every second via the
/// [alert channel](crate::alert).
#[derive(Clone, Debug, Default)]
pub struct TorrentStats {
    /// How long the torrent has been running.
    pub run_duration: Duration,

    /// The state of this torrent's pieces.
    pub pieces: PieceStats,

    /// The current payload download rate, in bytes per second, summed over
    /// all peer sessions.
    pub download_rate: u64,
    /// The current payload upload rate, in bytes per second, summed over
    /// all peer sessions.
    pub upload_rate: u64,
    /// The total payload bytes downloaded over the torrent's lifetime.
    pub downloaded_payload_count: u64,
    /// The total payload bytes uploaded over the torrent's lifetime.
    pub uploaded_payload_count: u64,

    /// The number of connected peers.
    pub peer_count: usize,
}

/// Statistics of a torrent's pieces.
#[derive(Clone, Copy, Debug, Default)]
pub struct PieceStats {
    /// The number of pieces currently being downloaded.
    pub pending: usize,
    /// The number of downloaded and verified pieces.
    pub complete: usize,
    /// The number of pieces in the torrent.
    pub total: usize,
}

impl PieceStats {
    /// Returns whether the torrent is a seed.
    pub fn is_seed(&self) -> bool {
        self.complete == self.total
    }

    /// Returns whether the torrent is in endgame mode (about to finish the
    /// download).
    pub fn is_in_endgame(&self) -> bool {
        self.pending + self.complete == self.total
    }
}
