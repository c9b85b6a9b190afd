use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, RwLock,
    },
    task, time,
};

use crate::{
    alert::{Alert, AlertReceiver, AlertSender},
    conf::Conf,
    disk::{
        self, BatchWrite, BlockError, DiskHandle, PieceCompletion,
        TorrentAlert, TorrentAlertReceiver,
    },
    download::PieceDownload,
    error::*,
    metainfo::Metainfo,
    peer::{self, PeerSession, SessionTelemetry},
    piece_picker::PiecePicker,
    ratelimit::{self, RateLimiter},
    storage_info::StorageInfo,
    tracker::{self, Announce, AnnounceResponse, Event, Tracker},
    Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

pub use stats::{PieceStats, TorrentStats};

pub mod error;
mod stats;

/// The channel on which peer sessions and the torrent's own background
/// tasks send commands to the torrent task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

pub(crate) enum Command {
    /// A peer session stopped and removed itself from the shared state.
    PeerDisconnected { addr: SocketAddr },
    /// The result of an announce performed on a background task.
    TrackerResult(Box<Result<AnnounceResponse, tracker::TrackerError>>),
    /// Assign a piece to a priority group.
    SetPiecePriority { index: PieceIndex, group: u8 },
    /// Shut the torrent down, gracefully or abruptly.
    Shutdown { graceful: bool },
}

/// The torrent's shared context, which peer sessions access through a weak
/// reference: the torrent frontend holds the lifetime-extending reference,
/// so a torrent's shutdown is not blocked by its sessions.
pub(crate) struct TorrentContext {
    /// The torrent's id, unique in this engine.
    pub id: TorrentId,
    /// The torrent's info hash, derived from its metainfo. This is used to
    /// identify the torrent with peers and trackers.
    pub info_hash: Sha1Hash,
    /// The arbitrary client id, chosen by the user of this library. This is
    /// advertised to peers and trackers.
    pub client_id: PeerId,
    /// Storage related information, shared with sessions and the disk task.
    pub storage: StorageInfo,
    /// Tracks the availability of our and the swarm's pieces and picks the
    /// piece to download next.
    pub piece_picker: RwLock<PiecePicker>,
    /// The pieces currently being downloaded, shared among the sessions
    /// that contribute blocks to them.
    pub downloads: RwLock<HashMap<PieceIndex, RwLock<PieceDownload>>>,
    /// Command channels of the connected peer sessions. Used to route
    /// endgame cancels to the sessions holding duplicate requests.
    pub peer_chans: RwLock<HashMap<SocketAddr, peer::Sender>>,
    /// The channel to the torrent task itself.
    pub chan: Sender,
    /// Whether pieces are picked in index order (streaming) instead of
    /// rarest first.
    pub sequential_download: bool,
}

/// The parameters for creating a torrent.
pub struct TorrentParams {
    /// The id to assign to the torrent, unique within the application.
    pub id: TorrentId,
    /// The parsed metainfo of the torrent.
    pub metainfo: Metainfo,
    /// The engine configuration.
    pub conf: Conf,
    /// If set, the torrent accepts incoming peer connections on this
    /// address.
    pub listen_addr: Option<SocketAddr>,
    /// Addresses of known peers (e.g. seeds) to connect to in addition to
    /// the ones learned from the tracker.
    pub peers: Vec<SocketAddr>,
}

/// A cloneable handle for controlling a running torrent.
#[derive(Clone)]
pub struct TorrentHandle {
    id: TorrentId,
    chan: Sender,
    disk: DiskHandle,
    piece_count: usize,
}

impl TorrentHandle {
    /// Stops the torrent. A graceful shutdown announces the stop to the
    /// tracker, drains peer sessions, and saves resume data.
    pub fn shutdown(&self, graceful: bool) {
        self.chan.send(Command::Shutdown { graceful }).ok();
    }

    /// Assigns a piece to a priority group. Pieces in higher groups are
    /// downloaded first; pieces in group 0 are not downloaded at all.
    pub fn set_piece_priority(&self, index: PieceIndex, group: u8) {
        self.chan
            .send(Command::SetPiecePriority { index, group })
            .ok();
    }

    /// Moves the torrent's download root into another directory.
    pub async fn move_download(
        &self,
        new_dir: impl Into<std::path::PathBuf>,
    ) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.disk.move_torrent(self.id, new_dir.into(), chan)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Renames the torrent's download root.
    pub async fn rename(&self, name: String) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.disk.rename_torrent(self.id, name, chan)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Completely removes the torrent's downloaded files and resume data.
    /// The torrent should be shut down first.
    pub async fn erase_files(&self) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.disk.erase_torrent_files(self.id, chan)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Deletes the torrent's resume data, retaining its files. Useful when
    /// the user no longer wants to seed a torrent but wishes to keep it.
    pub async fn erase_resume_data(&self) -> Result<()> {
        let (chan, port) = oneshot::channel();
        self.disk.erase_resume_data(self.id, chan)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Rehashes all pieces of the torrent on disk and returns the bitfield
    /// of the pieces that verified.
    pub async fn check_integrity(&self) -> Result<Bitfield> {
        let (chan, port) = oneshot::channel();
        let pieces = Bitfield::repeat(true, self.piece_count);
        self.disk.check_storage_integrity(self.id, pieces, chan)?;
        port.await.map_err(|_| Error::Channel)?
    }

    /// Hashes arbitrary data on the disk task's worker pool.
    pub async fn create_sha1_digest(&self, data: Vec<u8>) -> Result<Sha1Hash> {
        let (chan, port) = oneshot::channel();
        self.disk.create_sha1_digest(data, chan)?;
        port.await.map_err(|_| Error::Channel)
    }

    /// Resizes the disk task's shared block read cache.
    pub fn set_read_cache_capacity(&self, num_blocks: usize) -> Result<()> {
        self.disk.set_read_cache_capacity(num_blocks)
    }
}

/// The connection state the torrent keeps per connected peer.
struct PeerHandle {
    chan: peer::Sender,
    telemetry: Arc<SessionTelemetry>,
    /// Whether the choking algorithm currently has the peer unchoked.
    is_unchoked: bool,
}

/// The resume data blob persisted via the disk task, letting a torrent
/// restart without re-downloading verified pieces.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeData {
    /// The raw bytes of the bitfield of completed pieces.
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    downloaded: u64,
    uploaded: u64,
}

/// The maximum number of concurrent peer connections per torrent.
const MAX_CONNECTED_PEERS: usize = 50;

/// How long to wait before re-announcing when the tracker did not provide
/// an interval or the announce failed.
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// A single torrent and the tasks serving it: its peer sessions, its slice
/// of the disk task, and its tracker announcements.
pub struct Torrent {
    ctx: Arc<TorrentContext>,
    conf: Conf,
    /// The handle to the disk task, used to issue commands on it. A copy of
    /// this handle is passed down to each peer session.
    disk: DiskHandle,
    /// The port on which we're receiving disk IO notifications of block
    /// write results and piece completions.
    disk_alert_port: TorrentAlertReceiver,
    /// The port on which peer sessions and background tasks send commands.
    cmd_port: Receiver,
    /// The connected peer sessions.
    peers: HashMap<SocketAddr, PeerHandle>,
    /// Addresses of peers learned from the tracker or given at creation,
    /// connected to as capacity allows.
    known_peers: HashSet<SocketAddr>,
    /// The torrent's tracker, if its announce URL was a UDP tracker.
    tracker: Option<Tracker>,
    /// When the next announce is due.
    next_announce: Instant,
    is_announcing: bool,
    has_scraped: bool,
    /// The port advertised to the tracker for incoming connections.
    listen_addr: Option<SocketAddr>,
    /// The shared rate limiter, driven by its own refill task.
    limiter: Arc<RateLimiter>,
    alert_chan: AlertSender,
    start_time: Instant,
    last_rechoke: Instant,
    /// The peer in the optimistic unchoke slot and when the slot last
    /// rotated.
    optimistic_unchoke: Option<SocketAddr>,
    last_optimistic_rotation: Instant,
    /// Payload totals of sessions that have disconnected; added to the
    /// live session totals for stats and announces.
    lifetime_downloaded: u64,
    lifetime_uploaded: u64,
    /// Set once the completion alert and announce have been sent.
    is_complete_announced: bool,
    /// Set once the started event has been announced to the tracker.
    has_sent_started: bool,
    /// Set while a graceful shutdown is draining the peer sessions.
    is_shutting_down: bool,
}

impl Torrent {
    /// Sets up everything a torrent needs to run: spawns the disk task and
    /// allocates the torrent on it, restores resume data if present,
    /// spawns the rate limiter's refill task, and resolves the tracker.
    ///
    /// Returns the torrent, a handle for controlling it, and the channel on
    /// which the torrent posts alerts. The torrent itself is inert until
    /// [`Self::start`] is called.
    pub async fn new(
        params: TorrentParams,
    ) -> Result<(Self, TorrentHandle, AlertReceiver)> {
        let TorrentParams {
            id,
            metainfo,
            conf,
            listen_addr,
            peers,
        } = params;

        let storage = StorageInfo::new(&metainfo, &conf.torrent.download_dir)?;
        let info_hash = metainfo.create_info_hash()?;
        let piece_hashes = metainfo.info.pieces.clone();

        // spawn the disk task and allocate the torrent on it
        let (_, disk, mut disk_port) = disk::spawn(conf.disk.clone())?;
        disk.allocate_new_torrent(id, storage.clone(), piece_hashes)?;
        let disk_alert_port = match disk_port.recv().await {
            Some(disk::Alert::TorrentAllocation(Ok(allocation))) => {
                debug_assert_eq!(allocation.id, id);
                allocation.alert_port
            }
            Some(disk::Alert::TorrentAllocation(Err(e))) => {
                log::error!("Torrent {} could not be allocated: {}", id, e);
                return Err(Error::Torrent {
                    id,
                    error: error::TorrentError::Allocation(e.to_string()),
                });
            }
            None => return Err(Error::Channel),
        };

        // restore the pieces recorded in the resume data, verifying them
        // against the data actually on disk
        let mut piece_picker = PiecePicker::new(storage.piece_count);
        let (mut lifetime_downloaded, mut lifetime_uploaded) = (0, 0);
        if let Some(resume_data) = load_resume_data(&disk, id).await {
            let mut claimed = Bitfield::from_vec(resume_data.pieces);
            claimed.resize(storage.piece_count, false);
            let (chan, port) = oneshot::channel();
            disk.check_storage_integrity(id, claimed, chan)?;
            if let Ok(Ok(verified)) = port.await.map_err(|_| Error::Channel)
            {
                for index in verified.iter_ones() {
                    piece_picker.received_piece(index);
                }
                log::info!(
                    "Torrent {} resumed with {} verified piece(s)",
                    id,
                    verified.count_ones()
                );
            }
            lifetime_downloaded = resume_data.downloaded;
            lifetime_uploaded = resume_data.uploaded;
        }

        let limiter = RateLimiter::new(conf.rate);
        limiter.add_torrent(id);
        ratelimit::spawn(Arc::clone(&limiter));

        // the tracker task is shared by every torrent announcing to it; as
        // this torrent spawned it, it is its only user for now
        let tracker = match metainfo
            .announce
            .as_deref()
            .and_then(udp_tracker_addr)
        {
            Some(addr) => match tracker::spawn(addr).await {
                Ok((_, tracker)) => Some(tracker),
                Err(e) => {
                    log::warn!("Torrent {} tracker unusable: {}", id, e);
                    None
                }
            },
            None => None,
        };

        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let ctx = Arc::new(TorrentContext {
            id,
            info_hash,
            client_id: conf.engine.client_id,
            storage,
            piece_picker: RwLock::new(piece_picker),
            downloads: RwLock::new(HashMap::new()),
            peer_chans: RwLock::new(HashMap::new()),
            chan: cmd_chan.clone(),
            sequential_download: conf.torrent.sequential_download,
        });

        let handle = TorrentHandle {
            id,
            chan: cmd_chan,
            disk: disk.clone(),
            piece_count: ctx.storage.piece_count,
        };

        let now = Instant::now();
        let torrent = Self {
            ctx,
            conf,
            disk,
            disk_alert_port,
            cmd_port,
            peers: HashMap::new(),
            known_peers: peers.into_iter().collect(),
            tracker,
            next_announce: now,
            is_announcing: false,
            has_scraped: false,
            listen_addr,
            limiter,
            alert_chan,
            start_time: now,
            last_rechoke: now,
            optimistic_unchoke: None,
            last_optimistic_rotation: now,
            lifetime_downloaded,
            lifetime_uploaded,
            is_complete_announced: false,
            has_sent_started: false,
            is_shutting_down: false,
        };
        Ok((torrent, handle, alert_port))
    }

    /// Runs the torrent until it is shut down via its handle.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.ctx.id);
        self.start_time = Instant::now();

        let listener = match self.listen_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                log::info!(
                    "Torrent {} listening on {}",
                    self.ctx.id,
                    listener.local_addr()?
                );
                Some(listener)
            }
            None => None,
        };

        let mut tick_timer = time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    if self.tick().await? {
                        break;
                    }
                }
                disk_alert = self.disk_alert_port.recv() => {
                    match disk_alert {
                        Some(alert) => self.handle_disk_alert(alert).await?,
                        None => break,
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                accept_result = accept(&listener) => {
                    match accept_result {
                        Ok((socket, addr)) => {
                            self.handle_incoming_connection(socket, addr)
                                .await;
                        }
                        Err(e) => {
                            log::warn!("Listener accept error: {}", e);
                        }
                    }
                }
            }
        }

        log::info!("Torrent {} stopped", self.ctx.id);
        Ok(())
    }

    /// The torrent's periodic duties: announcing, connecting peers,
    /// rechoking, and publishing stats.
    ///
    /// Returns true once a graceful shutdown has finished draining.
    async fn tick(&mut self) -> Result<bool> {
        if self.is_shutting_down {
            if self.peers.is_empty() {
                self.finalize_shutdown().await?;
                return Ok(true);
            }
            return Ok(false);
        }

        let now = Instant::now();

        // schedule the next announce
        if self.tracker.is_some()
            && !self.is_announcing
            && now >= self.next_announce
        {
            let event = if self.has_sent_started {
                None
            } else {
                self.has_sent_started = true;
                Some(Event::Started)
            };
            self.spawn_announce(event);
        }

        self.connect_to_peers().await;

        if now.saturating_duration_since(self.last_rechoke)
            >= self.conf.torrent.rechoke_interval
        {
            self.last_rechoke = now;
            self.rechoke().await;
        }

        self.publish_stats().await;
        Ok(false)
    }

    /// Starts an announce on a background task so that tracker timeouts
    /// never stall the torrent's event loop.
    fn spawn_announce(&mut self, event: Option<Event>) {
        let tracker = match &self.tracker {
            Some(tracker) => tracker.clone(),
            None => return,
        };
        self.is_announcing = true;

        let (downloaded, uploaded) = self.payload_totals();
        let params = Announce {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self
                .listen_addr
                .map(|addr| addr.port())
                .unwrap_or_default(),
            downloaded,
            uploaded,
            left: self.bytes_left(),
            peer_count: Some(50),
            event,
        };
        let chan = self.ctx.chan.clone();
        task::spawn(async move {
            let result = tracker.announce(params).await;
            chan.send(Command::TrackerResult(Box::new(result))).ok();
        });
    }

    /// An approximation of the bytes left to download, reported to the
    /// tracker.
    fn bytes_left(&self) -> u64 {
        let piece_len = self.ctx.storage.piece_len as u64;
        let missing = self
            .ctx
            .piece_picker
            .try_read()
            .map(|piece_picker| piece_picker.count_missing_pieces() as u64)
            .unwrap_or(self.ctx.storage.piece_count as u64);
        (missing * piece_len).min(self.ctx.storage.download_len)
    }

    /// The torrent's lifetime payload totals: the running sessions' tallies
    /// plus what disconnected sessions transferred.
    fn payload_totals(&self) -> (u64, u64) {
        let mut downloaded = self.lifetime_downloaded;
        let mut uploaded = self.lifetime_uploaded;
        for peer in self.peers.values() {
            downloaded +=
                peer.telemetry.downloaded_total.load(Ordering::Relaxed);
            uploaded += peer.telemetry.uploaded_total.load(Ordering::Relaxed);
        }
        (downloaded, uploaded)
    }

    /// Connects to known peers up to the connection limit.
    async fn connect_to_peers(&mut self) {
        let connectable: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .filter(|addr| !self.peers.contains_key(addr))
            .take(MAX_CONNECTED_PEERS.saturating_sub(self.peers.len()))
            .copied()
            .collect();
        for addr in connectable.into_iter() {
            self.spawn_session(addr, None).await;
        }
    }

    /// Accepts an incoming peer connection, if there is capacity for it.
    async fn handle_incoming_connection(
        &mut self,
        socket: TcpStream,
        addr: SocketAddr,
    ) {
        if self.is_shutting_down
            || self.peers.len() >= MAX_CONNECTED_PEERS
            || self.peers.contains_key(&addr)
        {
            log::info!("Rejecting incoming connection from {}", addr);
            return;
        }
        log::info!("Accepting incoming connection from {}", addr);
        self.spawn_session(addr, Some(socket)).await;
    }

    /// Creates a peer session and spawns its task. An existing socket makes
    /// it an inbound session, otherwise the session connects out.
    async fn spawn_session(
        &mut self,
        addr: SocketAddr,
        socket: Option<TcpStream>,
    ) {
        let telemetry = Arc::new(SessionTelemetry::default());
        let (mut session, chan) = PeerSession::new(
            Arc::downgrade(&self.ctx),
            self.ctx.id,
            self.disk.clone(),
            addr,
            Arc::clone(&self.limiter),
            Arc::clone(&telemetry),
            self.conf.peer.clone(),
        );
        // register the session before it starts so that endgame cancels
        // can be routed to it
        self.ctx.peer_chans.write().await.insert(addr, chan.clone());
        self.peers.insert(
            addr,
            PeerHandle {
                chan,
                telemetry,
                is_unchoked: false,
            },
        );
        task::spawn(async move {
            let result = match socket {
                Some(socket) => session.start_inbound(socket).await,
                None => session.start_outbound().await,
            };
            if let Err(e) = result {
                log::info!("Peer {} session stopped: {}", addr, e);
            }
        });
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::PeerDisconnected { addr } => {
                if let Some(peer) = self.peers.remove(&addr) {
                    log::info!("Peer {} disconnected", addr);
                    self.lifetime_downloaded += peer
                        .telemetry
                        .downloaded_total
                        .load(Ordering::Relaxed);
                    self.lifetime_uploaded +=
                        peer.telemetry.uploaded_total.load(Ordering::Relaxed);
                }
                if self.optimistic_unchoke == Some(addr) {
                    self.optimistic_unchoke = None;
                }
            }
            Command::SetPiecePriority { index, group } => {
                if index < self.ctx.storage.piece_count {
                    self.ctx
                        .piece_picker
                        .write()
                        .await
                        .set_priority(index, group);
                }
            }
            Command::TrackerResult(result) => {
                self.is_announcing = false;
                match *result {
                    Ok(response) => self.handle_announce_response(response),
                    Err(e) => {
                        log::warn!(
                            "Torrent {} announce error: {}",
                            self.ctx.id,
                            e
                        );
                        self.next_announce =
                            Instant::now() + DEFAULT_ANNOUNCE_INTERVAL;
                    }
                }
            }
            Command::Shutdown { graceful } => {
                log::info!(
                    "Torrent {} shutting down (graceful: {})",
                    self.ctx.id,
                    graceful
                );
                self.spawn_announce(Some(Event::Stopped));
                for peer in self.peers.values() {
                    peer.chan
                        .send(peer::Command::Shutdown { graceful })
                        .ok();
                }
                if !graceful || self.peers.is_empty() {
                    self.finalize_shutdown().await?;
                    return Ok(true);
                }
                self.is_shutting_down = true;
            }
        }
        Ok(false)
    }

    /// Saves resume data and stops the torrent's collaborator tasks.
    async fn finalize_shutdown(&mut self) -> Result<()> {
        let (downloaded, uploaded) = self.payload_totals();
        let resume_data = ResumeData {
            pieces: self
                .ctx
                .piece_picker
                .read()
                .await
                .own_pieces()
                .as_raw_slice()
                .to_vec(),
            downloaded,
            uploaded,
        };
        match serde_bencode::to_bytes(&resume_data) {
            Ok(blob) => {
                let (chan, port) = oneshot::channel();
                if self.disk.save_resume_data(self.ctx.id, blob, chan).is_ok()
                {
                    if let Ok(Err(e)) = port.await {
                        log::warn!("Failed to save resume data: {}", e);
                    }
                }
            }
            Err(e) => log::warn!("Failed to encode resume data: {}", e),
        }

        if let Some(tracker) = &self.tracker {
            tracker.shutdown();
        }
        self.limiter.remove_torrent(self.ctx.id);
        // conclude the torrent's pending disk state, then stop the task
        self.disk.remove_torrent(self.ctx.id)?;
        self.disk.shutdown()?;
        Ok(())
    }

    fn handle_announce_response(&mut self, response: AnnounceResponse) {
        log::info!(
            "Torrent {} announce: {} seeders, {} leechers, {} peer(s)",
            self.ctx.id,
            response.seeder_count,
            response.leecher_count,
            response.peers.len()
        );
        self.next_announce = Instant::now()
            + response.interval.max(Duration::from_secs(10));
        for addr in response.peers.into_iter() {
            self.known_peers.insert(addr);
        }

        // log the swarm statistics once per session, out of band
        if !self.has_scraped {
            self.has_scraped = true;
            if let Some(tracker) = &self.tracker {
                let tracker = tracker.clone();
                let info_hash = self.ctx.info_hash;
                let id = self.ctx.id;
                task::spawn(async move {
                    match tracker.scrape(vec![info_hash]).await {
                        Ok(entries) => {
                            if let Some(entry) = entries.first() {
                                log::info!(
                                    "Torrent {} swarm: {} seeders, \
                                    {} leechers, {} downloads",
                                    id,
                                    entry.seeder_count,
                                    entry.leecher_count,
                                    entry.download_count,
                                );
                            }
                        }
                        Err(e) => {
                            log::debug!("Torrent {} scrape error: {}", id, e)
                        }
                    }
                });
            }
        }
    }

    /// Routes the disk task's save results and piece completions into the
    /// shared download state and the sessions.
    async fn handle_disk_alert(&mut self, alert: TorrentAlert) -> Result<()> {
        match alert {
            TorrentAlert::BatchWrite(batch) => {
                self.handle_batch_write(batch).await?;
            }
            TorrentAlert::ReadError { block_info, error } => {
                // the requesting peer simply won't be served; it will
                // re-request the block
                log::warn!("Error reading {}: {}", block_info, error);
            }
        }
        Ok(())
    }

    async fn handle_batch_write(&mut self, batch: BatchWrite) -> Result<()> {
        let BatchWrite { saves, piece } = batch;

        // record the save results in the affected downloads
        {
            let downloads = self.ctx.downloads.read().await;
            for (block, result) in saves.iter() {
                let download = match downloads.get(&block.piece_index) {
                    Some(download) => download,
                    None => continue,
                };
                match result {
                    Ok(()) => {
                        download.write().await.mark_written(block);
                    }
                    // concluded by the piece completion below
                    Err(BlockError::CorruptDataDropped) => {}
                    Err(e) => {
                        // the block was not persisted; free it so that it
                        // is downloaded again
                        log::warn!("Save of {} concluded with: {}", block, e);
                        download.write().await.release_block(block);
                    }
                }
            }
        }

        if let Some(PieceCompletion { index, is_valid }) = piece {
            let download =
                self.ctx.downloads.write().await.remove(&index);
            let (participants, parole_candidate, parole_peer) = match download
            {
                Some(download) => {
                    let mut download = download.into_inner();
                    let parole_peer = download.parole_peer();
                    let result = download.post_hash_result(is_valid);
                    (result.participants, result.parole_candidate, parole_peer)
                }
                None => (Vec::new(), None, None),
            };

            if is_valid {
                log::info!("Piece {} completed and verified", index);
                {
                    let mut piece_picker =
                        self.ctx.piece_picker.write().await;
                    piece_picker.received_piece(index);
                    // a verified parole piece clears its peer's parole
                    if let Some(peer) = parole_peer {
                        piece_picker.lift_parole(peer);
                    }
                }
                // everyone is sent a have message
                for peer in self.peers.values() {
                    peer.chan.send(peer::Command::PieceCompleted(index)).ok();
                }
                self.check_completion().await;
            } else {
                log::warn!("Piece {} failed hash check", index);
                {
                    let mut piece_picker =
                        self.ctx.piece_picker.write().await;
                    piece_picker.return_piece(index);
                    // the largest contributor goes on parole; it is only
                    // given exclusive pieces until one of them verifies
                    if let Some(candidate) = parole_candidate {
                        if piece_picker.is_on_parole(&candidate) {
                            log::debug!("{} is already on parole", candidate);
                        } else {
                            piece_picker.put_on_parole(candidate);
                        }
                    }
                }
                log::debug!(
                    "Piece {} participants: {:?}",
                    index,
                    participants
                );
            }
        }
        Ok(())
    }

    /// If every piece is downloaded and verified, the user is alerted and
    /// the tracker told, once.
    async fn check_completion(&mut self) {
        if self.is_complete_announced {
            return;
        }
        let missing = self
            .ctx
            .piece_picker
            .read()
            .await
            .count_missing_pieces();
        if missing == 0 {
            log::info!("Torrent {} download complete", self.ctx.id);
            self.is_complete_announced = true;
            self.alert_chan
                .send(Alert::TorrentComplete(self.ctx.id))
                .ok();
            self.spawn_announce(Some(Event::Completed));
        }
    }

    /// The choking algorithm, re-run every 10 seconds: the peers with the
    /// best transfer rates are unchoked, plus one rotating optimistic
    /// unchoke slot through which new peers get a chance to prove
    /// themselves.
    async fn rechoke(&mut self) {
        let is_seed = self
            .ctx
            .piece_picker
            .read()
            .await
            .count_missing_pieces()
            == 0;

        // order interested peers by the rate relevant for our role: what
        // they give us while we leech, what they take while we seed
        let mut candidates: Vec<(SocketAddr, u64)> = self
            .peers
            .iter()
            .filter(|(_, peer)| {
                peer.telemetry.is_peer_interested.load(Ordering::Relaxed)
            })
            .map(|(addr, peer)| {
                let rate = if is_seed {
                    peer.telemetry.upload_rate.load(Ordering::Relaxed)
                } else {
                    peer.telemetry.download_rate.load(Ordering::Relaxed)
                };
                (*addr, rate)
            })
            .collect();
        candidates.sort_unstable_by(|a, b| b.1.cmp(&a.1));

        let max_unchoked = self.conf.torrent.max_unchoked_peers;
        let mut to_unchoke: Vec<SocketAddr> = candidates
            .iter()
            .take(max_unchoked.saturating_sub(1))
            .map(|(addr, _)| *addr)
            .collect();

        // rotate the optimistic unchoke slot to a random choked but
        // interested peer
        let now = Instant::now();
        if now.saturating_duration_since(self.last_optimistic_rotation)
            >= self.conf.torrent.optimistic_unchoke_interval
        {
            self.last_optimistic_rotation = now;
            let choked_interested: Vec<SocketAddr> = candidates
                .iter()
                .map(|(addr, _)| *addr)
                .filter(|addr| !to_unchoke.contains(addr))
                .collect();
            self.optimistic_unchoke = if choked_interested.is_empty() {
                None
            } else {
                let pick = rand::thread_rng()
                    .gen_range(0..choked_interested.len());
                Some(choked_interested[pick])
            };
        }
        if let Some(optimistic) = self.optimistic_unchoke {
            if self.peers.contains_key(&optimistic)
                && !to_unchoke.contains(&optimistic)
                && to_unchoke.len() < max_unchoked
            {
                to_unchoke.push(optimistic);
            }
        }

        // steer the sessions; redundant transitions are suppressed both
        // here and in the sessions
        for (addr, peer) in self.peers.iter_mut() {
            let unchoke = to_unchoke.contains(addr);
            if unchoke != peer.is_unchoked {
                peer.is_unchoked = unchoke;
                let cmd = if unchoke {
                    peer::Command::Unchoke
                } else {
                    peer::Command::Choke
                };
                peer.chan.send(cmd).ok();
            }
        }
    }

    /// Publishes the per-second statistics snapshot on the alert channel.
    async fn publish_stats(&mut self) {
        let (pending, complete) = {
            let piece_picker = self.ctx.piece_picker.read().await;
            let complete = self.ctx.storage.piece_count
                - piece_picker.count_missing_pieces();
            (piece_picker.count_pending_pieces(), complete)
        };
        let (downloaded, uploaded) = self.payload_totals();
        let mut download_rate = 0;
        let mut upload_rate = 0;
        for peer in self.peers.values() {
            download_rate +=
                peer.telemetry.download_rate.load(Ordering::Relaxed);
            upload_rate += peer.telemetry.upload_rate.load(Ordering::Relaxed);
        }

        let stats = TorrentStats {
            run_duration: self.start_time.elapsed(),
            pieces: PieceStats {
                pending,
                complete,
                total: self.ctx.storage.piece_count,
            },
            download_rate,
            upload_rate,
            downloaded_payload_count: downloaded,
            uploaded_payload_count: uploaded,
            peer_count: self.peers.len(),
        };
        self.alert_chan
            .send(Alert::TorrentStats {
                id: self.ctx.id,
                stats,
            })
            .ok();
    }
}

/// Waits for an incoming connection, or forever if there is no listener.
async fn accept(
    listener: &Option<TcpListener>,
) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => futures::future::pending().await,
    }
}

/// Loads and decodes the torrent's resume data, if any. A blob that fails
/// to decode is erased so it doesn't wedge future restarts.
async fn load_resume_data(
    disk: &DiskHandle,
    id: TorrentId,
) -> Option<ResumeData> {
    let (chan, port) = oneshot::channel();
    disk.load_resume_data(id, chan).ok()?;
    let blob = port.await.ok()?.ok()?;
    match serde_bencode::from_bytes(&blob) {
        Ok(resume_data) => Some(resume_data),
        Err(e) => {
            log::warn!("Torrent {} resume data corrupt: {}", id, e);
            let (chan, _port) = oneshot::channel();
            disk.erase_resume_data(id, chan).ok();
            None
        }
    }
}

/// Extracts the `host:port` endpoint of a UDP tracker announce URL. HTTP
/// trackers are not supported by this engine.
fn udp_tracker_addr(announce_url: &str) -> Option<String> {
    let rest = announce_url.strip_prefix("udp://")?;
    let endpoint = rest.split('/').next().unwrap_or(rest);
    if endpoint.contains(':') {
        Some(endpoint.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_tracker_addr() {
        assert_eq!(
            udp_tracker_addr("udp://tracker.example.org:1337/announce"),
            Some("tracker.example.org:1337".to_string())
        );
        assert_eq!(
            udp_tracker_addr("udp://10.0.0.1:80"),
            Some("10.0.0.1:80".to_string())
        );
        // http trackers are outside this engine's scope
        assert_eq!(udp_tracker_addr("http://tracker.example.org/announce"), None);
        // a udp tracker without a port is unusable
        assert_eq!(udp_tracker_addr("udp://tracker.example.org"), None);
    }

    #[test]
    fn test_resume_data_roundtrip() {
        let resume_data = ResumeData {
            pieces: vec![0b1010_0000, 0b0000_0001],
            downloaded: 123_456,
            uploaded: 789,
        };
        let blob = serde_bencode::to_bytes(&resume_data).unwrap();
        let decoded: ResumeData = serde_bencode::from_bytes(&blob).unwrap();
        assert_eq!(decoded.pieces, resume_data.pieces);
        assert_eq!(decoded.downloaded, resume_data.downloaded);
        assert_eq!(decoded.uploaded, resume_data.uploaded);
    }
}
