use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    sync::RwLock,
    time,
};
use tokio_util::codec::{Encoder, Framed, FramedRead};

use crate::{
    conf::PeerConf,
    disk::DiskHandle,
    download::PieceDownload,
    piece_picker::PickMode,
    ratelimit::{Direction, RateLimiter},
    torrent::{self, TorrentContext},
    Block, BlockInfo, PieceIndex, TorrentId,
};
use codec::*;
use send_buffer::SendBuffer;
use state::*;

pub(crate) use error::PeerError;
pub(crate) use state::ConnectionState;

mod codec;
pub(crate) mod error;
mod send_buffer;
mod state;
#[macro_use]
mod peer_log;

use error::Result;

/// The channel on which other parts of the engine can send a command to the
/// peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    /// The result of reading a block from disk, to be sent to the peer.
    Block(Block),
    /// A piece of the torrent completed and verified; the peer is sent
    /// a have message.
    PieceCompleted(PieceIndex),
    /// Another session received this block first (endgame); cancel our
    /// outstanding duplicate request for it, if any.
    Cancel(BlockInfo),
    /// The choking algorithm decided to choke the peer.
    Choke,
    /// The choking algorithm decided to unchoke the peer.
    Unchoke,
    /// Shut the session down. A graceful shutdown waits for the outgoing
    /// send buffer to drain; an abrupt one cancels everything in flight.
    Shutdown { graceful: bool },
}

/// Per-session statistics shared with the torrent, which reads them when
/// running the choking algorithm and aggregating torrent stats.
#[derive(Default)]
pub(crate) struct SessionTelemetry {
    /// The session's payload download rate, in bytes per second.
    pub download_rate: AtomicU64,
    /// The session's payload upload rate, in bytes per second.
    pub upload_rate: AtomicU64,
    /// The total payload bytes downloaded from the peer.
    pub downloaded_total: AtomicU64,
    /// The total payload bytes uploaded to the peer.
    pub uploaded_total: AtomicU64,
    /// Whether the remote peer is interested in our pieces.
    pub is_peer_interested: AtomicBool,
}

/// After how many bytes of quota a single vectored write is cut; keeps one
/// session from monopolizing the upload allowance of its torrent.
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// A stopped or active connection with another BitTorrent peer.
///
/// This entity implements the BitTorrent wire protocol: it is responsible
/// for exchanging the BitTorrent messages that drive a download. It only
/// concerns itself with the network aspect of things: disk IO, for example,
/// is delegated to the [disk task](crate::disk::DiskHandle).
///
/// A peer session may be started in two modes:
/// - outbound: for connecting to another BitTorrent peer;
/// - inbound: for starting a session from an existing incoming TCP
///   connection.
///
/// The only difference in the above two is how the handshake is handled at
/// the beginning of the connection. From then on the session mechanisms are
/// identical.
///
/// The session holds only a weak reference to its torrent's shared context,
/// upgraded for the duration of one event at a time, so a torrent's
/// shutdown is never blocked by its peer sessions.
pub(crate) struct PeerSession {
    /// Shared information of the torrent, if it is still alive.
    torrent: Weak<TorrentContext>,
    /// The torrent's id, for disk and rate limiter calls.
    torrent_id: TorrentId,
    /// The entity used to save downloaded file blocks to disk.
    disk: DiskHandle,
    /// The command channel on which peer session is being sent messages.
    ///
    /// A copy of this is kept within peer session as disk block reads are
    /// communicated back to session directly via its command port.
    cmd_chan: Sender,
    /// The port on which peer session receives commands.
    cmd_port: Receiver,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related state and statistics.
    state: SessionState,
    /// Our pending requests that we sent to peer. It represents the blocks
    /// that we are expecting.
    ///
    /// If we receive a block whose request entry is in here, the entry is
    /// removed. A block that is not in this list is dropped.
    ///
    /// Since the Fast extension is not supported (yet), this is emptied
    /// when we're choked, as in that case we don't expect outstanding
    /// requests to be served.
    ///
    /// Note that if a request for a piece's block is in this queue, there
    /// _must_ be a corresponding entry for the piece download in the
    /// torrent's shared download map.
    outgoing_requests: HashSet<BlockInfo>,
    /// The requests we got from peer, bounded by the configured maximum.
    ///
    /// The request's entry is removed from here when the block is queued
    /// for transmission or when the peer cancels it.
    incoming_requests: HashSet<BlockInfo>,
    /// The outgoing bytes, accrued until the socket (and the rate limiter)
    /// accepts them.
    send_buffer: SendBuffer,
    /// The shared rate limiter; every payload byte in either direction is
    /// accounted against the torrent's and the global quota.
    limiter: Arc<RateLimiter>,
    /// Statistics shared with the torrent.
    telemetry: Arc<SessionTelemetry>,
    conf: PeerConf,
    /// Set when the upload quota is exhausted; cleared on the next refill.
    is_send_blocked: bool,
    /// Download payload bytes consumed beyond the granted quota. While
    /// non-zero, no further messages are read from the peer.
    down_debt: usize,
}

impl PeerSession {
    /// Creates a new session with the peer at the given address.
    ///
    /// # Important
    ///
    /// This constructor only initializes the session components but does
    /// not actually start it. See [`Self::start_outbound`] and
    /// [`Self::start_inbound`].
    pub fn new(
        torrent: Weak<TorrentContext>,
        torrent_id: TorrentId,
        disk: DiskHandle,
        addr: SocketAddr,
        limiter: Arc<RateLimiter>,
        telemetry: Arc<SessionTelemetry>,
        conf: PeerConf,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let start_request_queue_len = conf.start_request_queue_len;
        (
            Self {
                torrent,
                torrent_id,
                disk,
                cmd_chan: cmd_chan.clone(),
                cmd_port,
                addr,
                state: SessionState::new(start_request_queue_len),
                outgoing_requests: HashSet::new(),
                incoming_requests: HashSet::new(),
                send_buffer: SendBuffer::new(),
                limiter,
                telemetry,
                conf,
                is_send_blocked: false,
                down_debt: 0,
            },
            cmd_chan,
        )
    }

    /// Starts an outbound peer session.
    ///
    /// This method tries to connect to the peer at the address given in the
    /// constructor, send a handshake, and start the session.
    /// It returns if the connection is closed or an error occurs.
    pub async fn start_outbound(&mut self) -> Result<()> {
        peer_info!(self, "Starting outbound session");
        let result = self.run_outbound().await;
        self.cleanup().await;
        result
    }

    /// Starts an inbound peer session from an existing TCP connection.
    ///
    /// The method waits for the peer to send its handshake, responds with
    /// a handshake, and starts the session.
    /// It returns if the connection is closed or an error occurs.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        peer_info!(self, "Starting inbound session");
        let result = self.run_inbound(socket).await;
        self.cleanup().await;
        result
    }

    async fn run_outbound(&mut self) -> Result<()> {
        peer_info!(self, "Connecting to peer");
        self.state.connection = ConnectionState::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        peer_info!(self, "Connected to peer");

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.state.connection = ConnectionState::Handshaking;
        let (info_hash, client_id) = {
            let torrent = self.torrent()?;
            (torrent.info_hash, torrent.client_id)
        };
        let handshake = Handshake::new(info_hash, client_id);
        peer_info!(self, "Sending handshake");
        self.state.uploaded_protocol_counter += handshake.len();
        socket.send(handshake).await?;

        // receive peer's handshake
        peer_info!(self, "Waiting for peer handshake");
        match socket.next().await {
            Some(peer_handshake) => {
                self.handle_handshake(peer_handshake?, info_hash)?;
                self.run(socket).await
            }
            None => {
                peer_info!(self, "Peer hung up before handshaking");
                Ok(())
            }
        }
    }

    async fn run_inbound(&mut self, socket: TcpStream) -> Result<()> {
        self.state.connection = ConnectionState::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        // the inbound peer sends the first handshake
        peer_info!(self, "Waiting for peer handshake");
        let peer_handshake = match socket.next().await {
            Some(peer_handshake) => peer_handshake?,
            None => {
                peer_info!(self, "Peer hung up before handshaking");
                return Ok(());
            }
        };
        let (info_hash, client_id) = {
            let torrent = self.torrent()?;
            (torrent.info_hash, torrent.client_id)
        };
        self.handle_handshake(peer_handshake, info_hash)?;

        // we reply with our handshake
        let handshake = Handshake::new(info_hash, client_id);
        peer_info!(self, "Sending handshake");
        self.state.uploaded_protocol_counter += handshake.len();
        socket.send(handshake).await?;

        self.run(socket).await
    }

    /// Verifies the peer's handshake and records the peer's identity.
    fn handle_handshake(
        &mut self,
        peer_handshake: Handshake,
        info_hash: [u8; 20],
    ) -> Result<()> {
        peer_info!(self, "Received peer handshake");
        peer_trace!(self, "Peer handshake: {:?}", peer_handshake);
        // the codec only returns a handshake if the protocol string in it
        // is valid
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

        self.state.downloaded_protocol_counter += peer_handshake.len();

        // verify that the advertised torrent info hash is the same as ours
        if peer_handshake.info_hash != info_hash {
            peer_info!(self, "Peer handshake invalid info hash");
            // abort session, info hash is invalid
            return Err(PeerError::InvalidInfoHash);
        }

        self.state.peer = Some(PeerInfo {
            id: peer_handshake.peer_id,
            pieces: None,
        });
        Ok(())
    }

    /// Runs the session after the handshakes have been exchanged.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<()> {
        // Now that we have the handshake, we need to switch to the peer
        // message codec. Note that we have to keep the read buffer of the
        // handshake codec, as it may contain bytes of any message the peer
        // may have sent after the handshake.
        let piece_count = {
            let torrent = self.torrent()?;
            torrent.storage.piece_count
        };
        let parts = socket.into_parts();
        let (read_half, mut write_half) = parts.io.into_split();
        // the longest legitimate frame the peer may send is either a piece
        // message or, for large torrents, its bitfield
        let max_frame_len = (piece_count as u32 + 7) / 8 + 16;
        let mut stream =
            FramedRead::new(read_half, PeerCodec::new(max_frame_len));
        *stream.read_buffer_mut() = parts.read_buf;

        // this is the beginning of the session, which is the only time
        // a peer is allowed to advertise their pieces; if we have pieces
        // available, send a bitfield message
        {
            let torrent = self.torrent()?;
            let piece_picker = torrent.piece_picker.read().await;
            let own_pieces = piece_picker.own_pieces();
            if own_pieces.any() {
                peer_info!(self, "Sending piece availability");
                self.queue_message(Message::Bitfield(own_pieces.clone()));
            }
        }

        // enter the piece availability exchange state
        self.state.connection = ConnectionState::AvailabilityExchange;
        peer_info!(self, "Session state: {:?}", self.state.connection);
        self.state.last_incoming_message_time = Some(Instant::now());

        // used for collecting session stats and driving timeouts every
        // second
        let mut tick_timer = time::interval(Duration::from_secs(1));
        let limiter = Arc::clone(&self.limiter);

        // start the loop for receiving messages from peer and commands from
        // other parts of the engine
        loop {
            // a graceful shutdown completes once the send buffer is drained
            if self.state.connection == ConnectionState::Disconnecting
                && self.send_buffer.is_empty()
            {
                peer_info!(self, "Session drained, disconnecting");
                break;
            }

            tokio::select! {
                maybe_msg = stream.next(), if self.down_debt == 0 => {
                    match maybe_msg {
                        Some(msg) => {
                            let msg = msg?;
                            self.state.last_incoming_message_time =
                                Some(Instant::now());
                            self.handle_incoming_message(msg).await?;
                        }
                        None => {
                            peer_info!(self, "Peer closed the connection");
                            break;
                        }
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
                _ = tick_timer.tick() => {
                    self.tick().await?;
                }
                _ = limiter.wait(Direction::Up), if self.is_send_blocked => {
                    self.is_send_blocked = false;
                }
                _ = limiter.wait(Direction::Down), if self.down_debt > 0 => {
                    let granted = self.limiter.request(
                        Direction::Down,
                        self.torrent_id,
                        self.down_debt,
                    );
                    self.down_debt -= granted;
                }
            }

            self.flush(&mut write_half).await?;
        }

        Ok(())
    }

    /// Drains as much of the send buffer into the socket as the upload
    /// quota allows.
    async fn flush(&mut self, conn: &mut OwnedWriteHalf) -> Result<()> {
        while !self.send_buffer.is_empty() && !self.is_send_blocked {
            let want = self.send_buffer.len().min(MAX_WRITE_CHUNK);
            let granted =
                self.limiter
                    .request(Direction::Up, self.torrent_id, want);
            if granted == 0 {
                self.is_send_blocked = true;
                break;
            }
            let write_count = {
                let bufs = self.send_buffer.get_send_buffers(granted);
                conn.write_vectored(&bufs).await?
            };
            if write_count == 0 {
                return Err(PeerError::Io(
                    std::io::ErrorKind::WriteZero.into(),
                ));
            }
            self.send_buffer.consume(write_count);
            self.state.last_outgoing_message_time = Some(Instant::now());
        }
        Ok(())
    }

    /// Handles a message received while in the availability exchange or
    /// connected state.
    async fn handle_incoming_message(&mut self, msg: Message) -> Result<()> {
        peer_debug!(self, "Received message {:?}", msg.id());

        // handle the bitfield message separately as it may only be received
        // directly after the handshake
        if self.state.connection == ConnectionState::AvailabilityExchange {
            if let Message::Bitfield(bitfield) = msg {
                self.handle_bitfield_msg(bitfield).await?;
            } else {
                // it's not mandatory to send a bitfield message right after
                // the handshake
                self.handle_msg(msg).await?;
            }

            if self.state.connection == ConnectionState::AvailabilityExchange
            {
                self.state.connection = ConnectionState::Connected;
                peer_info!(
                    self,
                    "Session state: {:?}",
                    self.state.connection
                );
            }
        } else {
            self.handle_msg(msg).await?;
        }
        Ok(())
    }

    /// Handles the bitfield message the peer may send right after the
    /// handshake.
    async fn handle_bitfield_msg(
        &mut self,
        mut bitfield: crate::Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(
            self.state.connection,
            ConnectionState::AvailabilityExchange
        );
        peer_info!(self, "Handling peer Bitfield message");

        let torrent = self.torrent()?;

        // The bitfield raw data that is sent over the wire may be longer
        // than the logical pieces it represents, if the number of pieces in
        // torrent is not a multiple of 8. Therefore, we need to slice off
        // the last part of the bitfield.
        bitfield.resize(torrent.storage.piece_count, false);

        // register peer's pieces with piece picker and determine our
        // interest in it
        let is_interested = torrent
            .piece_picker
            .write()
            .await
            .register_availability(&bitfield)
            .map_err(|_| PeerError::InvalidPieceIndex)?;
        if let Some(peer_info) = &mut self.state.peer {
            peer_info.pieces = Some(bitfield);
        }

        if is_interested && !self.state.is_interested {
            self.state.is_interested = true;
            peer_info!(self, "Interested in peer");
            self.queue_message(Message::Interested);
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        // record protocol message size
        self.state.downloaded_protocol_counter += msg.protocol_len();
        match msg {
            Message::Bitfield(_) => {
                peer_info!(
                    self,
                    "Peer sent bitfield message not after handshake"
                );
                return Err(PeerError::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                peer_trace!(self, "Peer sent keep alive");
            }
            Message::Choke => {
                if !self.state.is_choked {
                    peer_info!(self, "Peer choked us");
                    self.state.is_choked = true;
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.free_outgoing_requests().await;
                }
            }
            Message::Unchoke => {
                if self.state.is_choked {
                    peer_info!(self, "Peer unchoked us");
                    self.state.is_choked = false;

                    // if we're interested, start sending requests
                    if self.state.is_interested {
                        self.state.prepare_for_download();
                        // now that we are allowed to request blocks, start
                        // the download pipeline
                        self.make_requests().await?;
                    }
                }
            }
            Message::Interested => {
                if !self.state.is_peer_interested {
                    peer_info!(self, "Peer became interested");
                    self.state.is_peer_interested = true;
                    self.telemetry
                        .is_peer_interested
                        .store(true, Ordering::Relaxed);
                }
            }
            Message::NotInterested => {
                if self.state.is_peer_interested {
                    peer_info!(self, "Peer no longer interested");
                    self.state.is_peer_interested = false;
                    self.telemetry
                        .is_peer_interested
                        .store(false, Ordering::Relaxed);
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block_msg(piece_index, offset, data).await?;

                // we may be able to make more requests now that a block has
                // arrived
                self.make_requests().await?;
            }
            Message::Request(block_info) => {
                self.handle_request_msg(block_info).await?;
            }
            Message::Have { piece_index } => {
                self.handle_have_msg(piece_index).await?;
            }
            Message::Cancel(block_info) => {
                peer_debug!(
                    self,
                    "Received 'cancel' message for {}",
                    block_info
                );
                self.incoming_requests.remove(&block_info);
            }
            Message::Port { port } => {
                // we don't participate in the DHT, so this is a no-op
                peer_trace!(self, "Peer's DHT port: {}", port);
            }
        }

        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    ///
    /// The number of requests kept outstanding is the session's target
    /// request queue size, grown by slow start and adjusted by the download
    /// rate, see [`SessionState`].
    async fn make_requests(&mut self) -> Result<()> {
        if self.state.is_choked || !self.state.is_interested {
            return Ok(());
        }
        let target_request_queue_len =
            self.state.target_request_queue_len.unwrap_or_default();
        let peer_pieces = match self
            .state
            .peer
            .as_ref()
            .and_then(|peer| peer.pieces.as_ref())
        {
            Some(pieces) => pieces.clone(),
            // the peer has not sent a bitfield or have message yet
            None => return Ok(()),
        };
        let torrent = self.torrent()?;

        let mut requests = Vec::new();
        let in_endgame = torrent.piece_picker.read().await.is_in_endgame();

        // If we have active downloads, prefer to continue those. This will
        // result in fewer in-progress pieces. In endgame, duplicate
        // requests for blocks requested from other peers are allowed, to
        // unstick the final blocks of the download.
        {
            let downloads = torrent.downloads.read().await;
            for download in downloads.values() {
                let outgoing_request_count =
                    requests.len() + self.outgoing_requests.len();
                if outgoing_request_count >= target_request_queue_len {
                    break;
                }
                let to_request_count =
                    target_request_queue_len - outgoing_request_count;

                let mut download = download.write().await;
                if !peer_pieces[download.piece_index()]
                    || download.is_complete()
                {
                    continue;
                }
                peer_trace!(
                    self,
                    "Trying to continue download {} \
                    ({} free, {} requested block(s))",
                    download.piece_index(),
                    download.count_missing_blocks(),
                    download.count_requested_blocks(),
                );
                download.pick_blocks(
                    self.addr,
                    to_request_count,
                    &mut requests,
                    in_endgame,
                );
            }
        }

        // while we can make more requests we start new download(s)
        loop {
            let outgoing_request_count =
                requests.len() + self.outgoing_requests.len();
            if outgoing_request_count >= target_request_queue_len {
                break;
            }
            let to_request_count =
                target_request_queue_len - outgoing_request_count;

            let pick = {
                let mut piece_picker = torrent.piece_picker.write().await;
                // before any meaningful availability statistics accumulate,
                // pick at random to spread initial picks across peers
                let mode = if torrent.sequential_download {
                    PickMode::Sequential
                } else if piece_picker.own_pieces().count_ones() < 4 {
                    PickMode::Random
                } else {
                    PickMode::RarestFirst
                };
                piece_picker.pick_piece(&peer_pieces, self.addr, mode)
            };
            match pick {
                Some(pick) => {
                    peer_debug!(self, "Picked piece {}", pick.index);
                    let piece_len = torrent
                        .storage
                        .piece_len(pick.index)
                        .map_err(|_| PeerError::InvalidPieceIndex)?;
                    let mut download = if pick.is_parole {
                        PieceDownload::new_parole(
                            pick.index,
                            piece_len,
                            self.addr,
                        )
                    } else {
                        PieceDownload::new(pick.index, piece_len)
                    };
                    download.pick_blocks(
                        self.addr,
                        to_request_count,
                        &mut requests,
                        false,
                    );
                    torrent
                        .downloads
                        .write()
                        .await
                        .insert(pick.index, RwLock::new(download));
                }
                None => {
                    peer_trace!(
                        self,
                        "Could not pick more pieces (pending requests: {})",
                        self.outgoing_requests.len(),
                    );
                    break;
                }
            }
        }

        if !requests.is_empty() {
            peer_debug!(
                self,
                "Requesting {} block(s) ({} pending)",
                requests.len(),
                self.outgoing_requests.len()
            );
            self.state.last_outgoing_request_time = Some(Instant::now());
            for request in requests.into_iter() {
                self.outgoing_requests.insert(request);
                self.queue_message(Message::Request(request));
            }
        }

        Ok(())
    }

    /// Verifies block validity, registers the download with its piece, and
    /// hands the block to the disk task.
    async fn handle_block_msg(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_info = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        peer_debug!(self, "Received {}", block_info);

        // account the payload against the download quota; an overdraft
        // pauses reading from this peer until the quota refills
        let granted = self.limiter.request(
            Direction::Down,
            self.torrent_id,
            data.len(),
        );
        self.down_debt += data.len() - granted;

        // remove block from our pending requests queue
        if !self.outgoing_requests.remove(&block_info) {
            peer_warn!(self, "Received not requested {}", block_info);
            // silently ignore this block if we didn't expect it
            return Ok(());
        }

        // update download stats (this also grows the slow start window)
        self.state.update_download_stats(block_info.len);

        let torrent = self.torrent()?;

        // mark the block as downloaded with its respective piece download
        // instance; in endgame, other peers with duplicate requests for
        // this block are sent a cancel
        let cancels = {
            let downloads = torrent.downloads.read().await;
            match downloads.get(&piece_index) {
                Some(download) => {
                    download.write().await.got_block(self.addr, &block_info)
                }
                None => Vec::new(),
            }
        };
        if !cancels.is_empty() {
            let peer_chans = torrent.peer_chans.read().await;
            for other in cancels.iter() {
                if let Some(chan) = peer_chans.get(other) {
                    chan.send(Command::Cancel(block_info)).ok();
                }
            }
        }

        // validate and save the block to disk by sending a write command to
        // the disk task
        self.disk.save_block(torrent.id, block_info, data)?;

        Ok(())
    }

    /// Handles a block request of the peer: the requested block is fetched
    /// from the disk task (or its read cache) and queued for transmission.
    async fn handle_request_msg(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<()> {
        peer_debug!(self, "Received request: {}", block_info);

        // peers are not allowed to request blocks while they are choked
        if self.state.is_peer_choked {
            peer_warn!(self, "Choked peer sent request");
            return Err(PeerError::RequestWhileChoked);
        }

        let torrent = self.torrent()?;

        // validate the request
        let piece_len = torrent
            .storage
            .piece_len(block_info.piece_index)
            .map_err(|_| PeerError::InvalidBlockInfo)?;
        if !block_info.is_valid(piece_len) {
            peer_warn!(self, "Peer requested invalid {}", block_info);
            return Err(PeerError::InvalidBlockInfo);
        }

        // check if peer is not already requesting this block
        if self.incoming_requests.contains(&block_info) {
            peer_warn!(self, "Peer sent duplicate block request");
            return Ok(());
        }

        // requests beyond the configured queue bound are dropped; a well
        // behaved peer throttles itself long before this
        if self.incoming_requests.len() >= self.conf.max_incoming_requests {
            peer_warn!(self, "Peer's request queue full, dropping request");
            return Ok(());
        }

        peer_trace!(self, "Issuing disk IO fetch for {}", block_info);
        self.incoming_requests.insert(block_info);

        // the disk task sends the read result directly to our command port
        self.disk
            .fetch_block(torrent.id, block_info, self.cmd_chan.clone())?;

        Ok(())
    }

    /// Handles the peer announcing a newly downloaded piece.
    async fn handle_have_msg(&mut self, piece_index: PieceIndex) -> Result<()> {
        peer_debug!(
            self,
            "Received 'have' message for piece {}",
            piece_index
        );
        let torrent = self.torrent()?;

        if piece_index >= torrent.storage.piece_count {
            return Err(PeerError::InvalidPieceIndex);
        }

        // record the piece with the peer's bitfield, creating one if the
        // peer didn't send one after the handshake
        if let Some(peer_info) = &mut self.state.peer {
            let pieces = peer_info.pieces.get_or_insert_with(|| {
                crate::Bitfield::repeat(false, torrent.storage.piece_count)
            });
            if pieces[piece_index] {
                // nothing new
                return Ok(());
            }
            pieces.set(piece_index, true);
        }

        // need to recalculate interest with each received piece
        let is_interested = torrent
            .piece_picker
            .write()
            .await
            .register_piece_availability(piece_index)
            .map_err(|_| PeerError::InvalidPieceIndex)?;
        if is_interested && !self.state.is_interested {
            self.state.is_interested = true;
            peer_info!(self, "Interested in peer");
            self.queue_message(Message::Interested);
        }
        Ok(())
    }

    /// Handles a command sent by the torrent or the disk task.
    ///
    /// Returns true if the session should shut down.
    async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Block(block) => self.send_block(block),
            Command::PieceCompleted(piece_index) => {
                self.announce_new_piece(piece_index).await?;
            }
            Command::Cancel(block_info) => {
                // another session received the block first; withdraw our
                // duplicate request
                if self.outgoing_requests.remove(&block_info) {
                    peer_debug!(self, "Cancelling request for {}", block_info);
                    self.queue_message(Message::Cancel(block_info));
                }
            }
            Command::Choke => {
                if !self.state.is_peer_choked {
                    peer_info!(self, "Choking peer");
                    self.state.is_peer_choked = true;
                    // withdraw the service of the peer's queued requests
                    self.incoming_requests.clear();
                    self.queue_message(Message::Choke);
                }
            }
            Command::Unchoke => {
                if self.state.is_peer_choked {
                    peer_info!(self, "Unchoking peer");
                    self.state.is_peer_choked = false;
                    self.queue_message(Message::Unchoke);
                }
            }
            Command::Shutdown { graceful } => {
                if !graceful || self.send_buffer.is_empty() {
                    peer_info!(self, "Shutting down session");
                    return Ok(true);
                }
                peer_info!(self, "Draining session before shutdown");
                self.state.connection = ConnectionState::Disconnecting;
            }
        }
        Ok(false)
    }

    /// Announces a newly completed and verified piece to the peer with
    /// a have message, and updates our interest in the peer.
    async fn announce_new_piece(
        &mut self,
        piece_index: PieceIndex,
    ) -> Result<()> {
        self.queue_message(Message::Have { piece_index });

        // downloading the piece may have ended our interest in the peer
        if self.state.is_interested {
            let torrent = self.torrent()?;
            let is_interested = match self
                .state
                .peer
                .as_ref()
                .and_then(|peer| peer.pieces.as_ref())
            {
                Some(pieces) => {
                    torrent.piece_picker.read().await.is_interested(pieces)
                }
                None => false,
            };
            if !is_interested {
                peer_info!(self, "No longer interested in peer");
                self.state.is_interested = false;
                self.queue_message(Message::NotInterested);
            }
        }
        Ok(())
    }

    /// Queues a block read from disk for transmission, unless the peer has
    /// cancelled its request in the meantime.
    fn send_block(&mut self, block: Block) {
        let info = block.info();
        peer_trace!(self, "Read from disk {}", info);

        // remove peer's pending request; it may have been cancelled while
        // the disk read was in flight
        if !self.incoming_requests.remove(&info) {
            peer_debug!(self, "No matching request entry for {}", info);
            return;
        }

        peer_debug!(self, "Sending {}", info);
        // the block message header is a small owned buffer, while the block
        // data is a view of the cached block, transmitted without copying
        self.send_buffer
            .append_bytes(block_message_header(&info).to_vec());
        self.send_buffer.append_block(block.data);
        self.state.uploaded_payload_counter += info.len as u64;
    }

    /// Encodes the message into the send buffer. The actual transmission
    /// happens in [`Self::flush`], subject to the upload rate limit.
    fn queue_message(&mut self, msg: Message) {
        let mut encoded = BytesMut::with_capacity(msg.protocol_len() as usize);
        self.state.uploaded_protocol_counter += msg.protocol_len();
        // encoding a message into a byte buffer cannot fail
        PeerCodec::default()
            .encode(msg, &mut encoded)
            .expect("message encoding failed");
        self.send_buffer.append_bytes(encoded.to_vec());
    }

    /// Updates statistics and performs the session's periodic duties:
    /// request timeouts, keep-alives, and the inactivity timeout.
    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();

        // if we have pending requests and more time has elapsed since the
        // last request than the current timeout value, the request timed
        // out: slow start ends, the request queue shrinks, and the blocks
        // become pickable again for other sessions
        if !self.outgoing_requests.is_empty() {
            // a steadily served pipeline is not timed out just because the
            // last request message itself is old
            let last_progress = self
                .state
                .last_outgoing_request_time
                .max(self.state.last_incoming_block_time);
            if let Some(last_progress) = last_progress {
                let elapsed = now.saturating_duration_since(last_progress);
                let request_timeout = self.state.request_timeout();
                if elapsed > request_timeout {
                    peer_warn!(
                        self,
                        "Request timeout after {} ms (timeouts: {})",
                        elapsed.as_millis(),
                        self.state.timed_out_request_count + 1,
                    );
                    self.state.register_request_timeout();
                    self.free_outgoing_requests().await;
                    self.make_requests().await?;
                }
            }
        }

        // if nothing was sent to the peer for a while, keep the connection
        // alive
        let send_idle = self
            .state
            .last_outgoing_message_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if send_idle >= self.conf.keep_alive_interval {
            peer_debug!(self, "Sending keep alive");
            self.queue_message(Message::KeepAlive);
        }

        // a peer that hasn't sent anything within the inactivity window is
        // dropped
        if let Some(last_incoming_message_time) =
            self.state.last_incoming_message_time
        {
            if now.saturating_duration_since(last_incoming_message_time)
                >= self.conf.inactivity_timeout
            {
                peer_warn!(self, "Inactivity timeout");
                return Err(PeerError::InactivityTimeout);
            }
        }

        self.state.tick();
        self.telemetry.download_rate.store(
            self.state.downloaded_payload_counter.avg(),
            Ordering::Relaxed,
        );
        self.telemetry.upload_rate.store(
            self.state.uploaded_payload_counter.avg(),
            Ordering::Relaxed,
        );
        self.telemetry.downloaded_total.store(
            self.state.downloaded_payload_counter.total(),
            Ordering::Relaxed,
        );
        self.telemetry.uploaded_total.store(
            self.state.uploaded_payload_counter.total(),
            Ordering::Relaxed,
        );

        peer_trace!(
            self,
            "Stats: down rate: {} b/s (peak: {} b/s, total: {} b) \
            queue: {}, rtt: {} ms",
            self.state.downloaded_payload_counter.avg(),
            self.state.downloaded_payload_counter.peak(),
            self.state.downloaded_payload_counter.total(),
            self.state.target_request_queue_len.unwrap_or(0),
            self.state.avg_request_rtt.mean().as_millis(),
        );

        Ok(())
    }

    /// Returns every outstanding request of ours to its piece download so
    /// that other sessions may pick the blocks up.
    async fn free_outgoing_requests(&mut self) {
        let torrent = match self.torrent.upgrade() {
            Some(torrent) => torrent,
            None => {
                self.outgoing_requests.clear();
                return;
            }
        };
        let downloads = torrent.downloads.read().await;
        for block in self.outgoing_requests.drain() {
            if let Some(download) = downloads.get(&block.piece_index) {
                download.write().await.time_out(self.addr, &block);
            }
        }
    }

    /// Removes this session's footprint from the shared torrent state.
    /// Called exactly once, when the session stops.
    async fn cleanup(&mut self) {
        self.state.connection = ConnectionState::Disconnected;
        let torrent = match self.torrent.upgrade() {
            Some(torrent) => torrent,
            None => return,
        };

        // release our outstanding requests for other sessions
        {
            let downloads = torrent.downloads.read().await;
            for download in downloads.values() {
                download.write().await.cancel_peer(self.addr);
            }
        }
        self.outgoing_requests.clear();

        // withdraw this peer's piece availability
        if let Some(pieces) =
            self.state.peer.as_ref().and_then(|peer| peer.pieces.as_ref())
        {
            let mut piece_picker = torrent.piece_picker.write().await;
            piece_picker.decrease_availability(pieces);
            piece_picker.forget_peer(self.addr);
        }

        torrent.peer_chans.write().await.remove(&self.addr);
        torrent
            .chan
            .send(torrent::Command::PeerDisconnected { addr: self.addr })
            .ok();
    }

    /// Upgrades the weak back-reference to the torrent for the duration of
    /// one event's handling.
    fn torrent(&self) -> Result<Arc<TorrentContext>> {
        self.torrent.upgrade().ok_or(PeerError::TorrentGone)
    }
}
