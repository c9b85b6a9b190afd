//! Engine configuration.
//!
//! All components take their tunables from here. [`Conf::new`] fills in
//! defaults that are sensible for a desktop client; embedders may override
//! any field before starting the engine.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The configuration of the whole engine.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub disk: DiskConf,
    pub peer: PeerConf,
    pub rate: RateConf,
}

impl Conf {
    pub fn new(download_dir: impl Into<PathBuf>, client_id: PeerId) -> Self {
        let download_dir = download_dir.into();
        Self {
            engine: EngineConf { client_id },
            torrent: TorrentConf::new(download_dir.clone()),
            disk: DiskConf::new(download_dir),
            peer: PeerConf::default(),
            rate: RateConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,
    /// How often the choking algorithm re-evaluates which peers to unchoke.
    pub rechoke_interval: Duration,
    /// How often the optimistic unchoke slot is rotated to another choked
    /// peer.
    pub optimistic_unchoke_interval: Duration,
    /// The number of peers kept unchoked at a time, including the optimistic
    /// slot.
    pub max_unchoked_peers: usize,
    /// Whether pieces are downloaded in index order instead of rarest
    /// first. Used for streaming.
    pub sequential_download: bool,
}

impl TorrentConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            rechoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            max_unchoked_peers: 4,
            sequential_download: false,
        }
    }
}

/// Configuration of the disk IO subsystem.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// The number of contiguous, in-order blocks that triggers a batched
    /// hash-and-write of a piece's buffered blocks.
    pub write_cache_line_size: usize,
    /// The number of blocks a piece may buffer in memory before its largest
    /// contiguous run is flushed to disk, hashed or not.
    pub write_buffer_capacity: usize,
    /// The number of blocks pulled into the read cache by a single read-ahead.
    pub read_cache_line_size: usize,
    /// The total capacity of the read cache, in blocks.
    pub read_cache_capacity: usize,
    /// Whether a cache miss pulls in subsequent blocks of the piece or only
    /// the requested block.
    pub read_ahead: bool,
    /// How many additional blocks a piece may buffer after a failed disk
    /// write while the save is being retried. Blocks arriving beyond this
    /// bound are dropped.
    pub max_buffered_blocks_after_write_error: usize,
    /// How long a piece's buffered blocks may linger in memory before they
    /// are flushed regardless of batching considerations.
    pub write_buffer_expiry: Duration,
    /// The directory in which torrent resume data is stored.
    pub resume_data_dir: PathBuf,
}

impl DiskConf {
    pub fn new(resume_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            write_cache_line_size: 16,
            write_buffer_capacity: 128,
            read_cache_line_size: 8,
            read_cache_capacity: 2048,
            read_ahead: true,
            max_buffered_blocks_after_write_error: 64,
            write_buffer_expiry: Duration::from_secs(60),
            resume_data_dir: resume_data_dir.into(),
        }
    }
}

/// Configuration of peer sessions.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// A keep-alive message is sent if nothing else was sent for this long.
    pub keep_alive_interval: Duration,
    /// The session is dropped if no message is received for this long.
    pub inactivity_timeout: Duration,
    /// The maximum number of block requests a peer may have queued with us.
    pub max_incoming_requests: usize,
    /// The number of requests the session keeps outstanding when a download
    /// starts, before slow start has adjusted the queue size.
    pub start_request_queue_len: usize,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(120),
            max_incoming_requests: 64,
            start_request_queue_len: 4,
        }
    }
}

/// Rate limits, in bytes per second. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateConf {
    /// The engine-wide download limit.
    pub global_down: Option<u64>,
    /// The engine-wide upload limit.
    pub global_up: Option<u64>,
    /// The per-torrent download limit.
    pub torrent_down: Option<u64>,
    /// The per-torrent upload limit.
    pub torrent_up: Option<u64>,
}
