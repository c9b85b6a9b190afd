//! The UDP tracker client, per BEP 15.
//!
//! One tracker instance (and one UDP socket) is shared by every torrent
//! announcing to that tracker. Requests are correlated with responses by
//! their transaction id, so announces of several torrents may be in flight
//! at once over the single socket. The tracker's connection handshake is
//! performed lazily and its connection id is reused until it expires.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task, time,
};

use crate::{PeerId, Sha1Hash};

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// The magic constant identifying the BitTorrent UDP tracker protocol.
const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// A request is retransmitted with exponential backoff; after this many
/// unanswered retries it fails.
const MAX_RETRIES: u32 = 8;

/// A tracker connection id may be reused for a minute after the connect
/// exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// The receive buffer is sized for the longest expected datagram. A scrape
/// request is bounded to 74 info hashes for the same reason:
/// 74 * 12 + 8 bytes of response fit within this.
const MAX_DATAGRAM_LEN: usize = 1500;

/// The largest number of info hashes a single scrape request may carry.
pub(crate) const MAX_SCRAPE_HASHES: usize = 74;

/// The delay before the n-th retransmission of an unanswered request:
/// 15 * 2^n seconds, n in [0, 8].
fn retry_delay(num_retries: u32) -> Duration {
    Duration::from_secs(15 * (1 << num_retries.min(MAX_RETRIES)))
}

/// The possible errors that may occur when contacting the tracker.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// The tracker did not respond within the retry budget.
    Timeout,
    /// The tracker's response could not be parsed.
    InvalidResponse,
    /// The tracker rejected the request with an error message.
    Rejected(String),
    /// The tracker's host name did not resolve to any address.
    NoEndpoint,
    /// The channel to the tracker task died.
    Channel,
    /// A network error occurred.
    Io(std::io::Error),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use TrackerError::*;
        match self {
            Timeout => write!(fmt, "tracker timeout"),
            InvalidResponse => write!(fmt, "invalid tracker response"),
            Rejected(reason) => {
                write!(fmt, "tracker rejected request: {}", reason)
            }
            NoEndpoint => write!(fmt, "tracker address did not resolve"),
            Channel => write!(fmt, "channel error"),
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The optional announce event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// The first request to tracker must include this value.
    Started,
    /// Must be sent to the tracker when the client becomes a seeder. Must
    /// not be present if the client started as a seeder.
    Completed,
    /// Must be sent to tracker if the client is shutting down gracefully.
    Stopped,
}

impl Event {
    /// The on-wire id of the event; the absence of an event is sent as 0.
    fn to_wire(event: Option<Event>) -> u32 {
        match event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        }
    }
}

/// Parameters for announcing to a tracker.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port on which we are listening.
    pub port: u16,
    /// Number of bytes downloaded so far.
    pub downloaded: u64,
    /// Number of bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes left to download.
    pub left: u64,
    /// The number of peers the client wishes to receive from the tracker.
    /// If omitted, -1 is sent to let the tracker determine the number.
    pub peer_count: Option<usize>,
    /// Only need be set during the special events defined in [`Event`].
    /// Otherwise, when just requesting peers, no event needs to be set.
    pub event: Option<Event>,
}

/// The tracker's answer to an announce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AnnounceResponse {
    /// The number of seconds the client should wait before reannouncing.
    pub interval: Duration,
    pub leecher_count: usize,
    pub seeder_count: usize,
    pub peers: Vec<SocketAddr>,
}

/// One torrent's swarm statistics in a scrape response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ScrapeEntry {
    pub seeder_count: usize,
    /// The number of times the torrent completed.
    pub download_count: usize,
    pub leecher_count: usize,
}

/// The cloneable handle to a spawned tracker task. Each torrent announcing
/// to the tracker keeps a copy.
#[derive(Clone)]
pub(crate) struct Tracker {
    cmd_chan: CommandSender,
    addr: String,
}

impl Tracker {
    /// Sends an announce request to the tracker with the specified
    /// parameters and waits for the tracker's reply.
    ///
    /// # Important
    ///
    /// The tracker may not be contacted more often than the interval
    /// returned in the first announce response.
    pub async fn announce(&self, params: Announce) -> Result<AnnounceResponse> {
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Announce { params, chan })
            .map_err(|_| TrackerError::Channel)?;
        port.await.map_err(|_| TrackerError::Channel)?
    }

    /// Requests the swarm statistics of up to 74 torrents, returned in the
    /// order of the given info hashes.
    pub async fn scrape(
        &self,
        info_hashes: Vec<Sha1Hash>,
    ) -> Result<Vec<ScrapeEntry>> {
        debug_assert!(info_hashes.len() <= MAX_SCRAPE_HASHES);
        let (chan, port) = oneshot::channel();
        self.cmd_chan
            .send(Command::Scrape { info_hashes, chan })
            .map_err(|_| TrackerError::Channel)?;
        port.await.map_err(|_| TrackerError::Channel)?
    }

    /// Shuts down the tracker task. In-flight requests fail.
    pub fn shutdown(&self) {
        self.cmd_chan.send(Command::Shutdown).ok();
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "'{}'", self.addr)
    }
}

type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

enum Command {
    Announce {
        params: Announce,
        chan: oneshot::Sender<Result<AnnounceResponse>>,
    },
    Scrape {
        info_hashes: Vec<Sha1Hash>,
        chan: oneshot::Sender<Result<Vec<ScrapeEntry>>>,
    },
    Shutdown,
}

/// Spawns the shared task serving one tracker, resolving its address first.
///
/// `addr` is the tracker's `host:port` pair (the `udp://` scheme and any
/// path of the announce URL must already be stripped by the caller).
pub(crate) async fn spawn(
    addr: String,
) -> Result<(task::JoinHandle<()>, Tracker)> {
    // if DNS resolves to multiple endpoints, they are tried in order,
    // stickily: the next is only tried when the current one fails
    let endpoints: Vec<SocketAddr> = lookup_host(addr.as_str())
        .await?
        .filter(|endpoint| endpoint.is_ipv4())
        .collect();
    if endpoints.is_empty() {
        return Err(TrackerError::NoEndpoint);
    }
    log::info!("Tracker {} resolved to {:?}", addr, endpoints);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(endpoints[0]).await?;

    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
    let mut tracker_task = TrackerTask {
        socket,
        endpoints,
        current_endpoint: 0,
        conn: ConnState::Disconnected,
        pending: HashMap::new(),
        cmd_port,
    };
    let join_handle = task::spawn(async move { tracker_task.run().await });

    Ok((join_handle, Tracker { cmd_chan, addr }))
}

/// The tracker's connection handshake state.
enum ConnState {
    Disconnected,
    /// A connect request with the given transaction id is in flight.
    Connecting { transaction_id: u32 },
    /// The connection id may be used until it expires.
    Connected {
        connection_id: u64,
        expires_at: Instant,
    },
}

/// What a pending transaction is waiting for.
enum PendingKind {
    Connect,
    Announce {
        params: Announce,
        chan: oneshot::Sender<Result<AnnounceResponse>>,
    },
    Scrape {
        info_hashes: Vec<Sha1Hash>,
        chan: oneshot::Sender<Result<Vec<ScrapeEntry>>>,
    },
}

/// A request awaiting its response, keyed by transaction id in the task.
struct Pending {
    kind: PendingKind,
    /// The number of retransmissions performed so far.
    num_retries: u32,
    /// When the current attempt times out.
    deadline: Instant,
}

struct TrackerTask {
    socket: UdpSocket,
    endpoints: Vec<SocketAddr>,
    current_endpoint: usize,
    conn: ConnState,
    /// Each in-flight request is keyed by its transaction id; received
    /// datagrams are demultiplexed via the id.
    pending: HashMap<u32, Pending>,
    cmd_port: CommandReceiver,
}

impl TrackerTask {
    async fn run(&mut self) {
        // only one outstanding receive at a time; the buffer is sized for
        // the longest expected response
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        loop {
            let next_deadline = self
                .pending
                .values()
                .map(|pending| pending.deadline)
                .min()
                .unwrap_or_else(|| {
                    Instant::now() + Duration::from_secs(3600)
                });

            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Announce { params, chan }) => {
                            self.submit(PendingKind::Announce {
                                params,
                                chan,
                            })
                            .await;
                        }
                        Some(Command::Scrape { info_hashes, chan }) => {
                            self.submit(PendingKind::Scrape {
                                info_hashes,
                                chan,
                            })
                            .await;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down tracker task");
                            self.fail_all_pending(TrackerError::Channel);
                            return;
                        }
                    }
                }
                recv_result = self.socket.recv(&mut buf) => {
                    match recv_result {
                        Ok(len) => self.handle_datagram(&buf[..len]).await,
                        Err(e) => {
                            log::warn!("Tracker socket error: {}", e);
                            self.rotate_endpoint().await;
                        }
                    }
                }
                _ = time::sleep_until(time::Instant::from_std(next_deadline)) => {
                    self.handle_timeouts().await;
                }
            }
        }
    }

    /// Registers a new request and sends it, going through the connect
    /// handshake first if no valid connection id is held.
    async fn submit(&mut self, kind: PendingKind) {
        let transaction_id = self.new_transaction_id();
        self.pending.insert(
            transaction_id,
            Pending {
                kind,
                num_retries: 0,
                deadline: Instant::now() + retry_delay(0),
            },
        );
        self.send_request(transaction_id).await;
    }

    fn new_transaction_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// The connection id, if the handshake has been performed and has not
    /// expired yet.
    fn connection_id(&self) -> Option<u64> {
        match &self.conn {
            ConnState::Connected {
                connection_id,
                expires_at,
            } if Instant::now() < *expires_at => Some(*connection_id),
            _ => None,
        }
    }

    /// Sends (or resends) the datagram of the pending request with the
    /// given transaction id. If the tracker connection is missing or
    /// expired, a connect exchange is started instead and the request is
    /// sent once it completes.
    async fn send_request(&mut self, transaction_id: u32) {
        let connection_id = match self.connection_id() {
            Some(connection_id) => connection_id,
            None => {
                self.ensure_connecting().await;
                return;
            }
        };
        let pending = match self.pending.get(&transaction_id) {
            Some(pending) => pending,
            None => return,
        };

        let packet = match &pending.kind {
            PendingKind::Connect => {
                debug_assert!(false, "connect submitted as request");
                return;
            }
            PendingKind::Announce { params, .. } => {
                encode_announce_request(connection_id, transaction_id, params)
            }
            PendingKind::Scrape { info_hashes, .. } => {
                encode_scrape_request(
                    connection_id,
                    transaction_id,
                    info_hashes,
                )
            }
        };
        log::debug!(
            "Sending tracker request (transaction: {}, {} bytes)",
            transaction_id,
            packet.len()
        );
        if let Err(e) = self.socket.send(&packet).await {
            log::warn!("Tracker send error: {}", e);
            self.rotate_endpoint().await;
        }
    }

    /// Starts the connect exchange unless one is already in flight.
    async fn ensure_connecting(&mut self) {
        if let ConnState::Connecting { .. } = self.conn {
            return;
        }
        let transaction_id = self.new_transaction_id();
        self.conn = ConnState::Connecting { transaction_id };
        self.pending.insert(
            transaction_id,
            Pending {
                kind: PendingKind::Connect,
                num_retries: 0,
                deadline: Instant::now() + retry_delay(0),
            },
        );
        self.send_connect(transaction_id).await;
    }

    async fn send_connect(&mut self, transaction_id: u32) {
        log::debug!(
            "Sending tracker connect (transaction: {})",
            transaction_id
        );
        let packet = encode_connect_request(transaction_id);
        if let Err(e) = self.socket.send(&packet).await {
            log::warn!("Tracker send error: {}", e);
            self.rotate_endpoint().await;
        }
    }

    /// Demultiplexes a received datagram to the pending request with its
    /// transaction id.
    async fn handle_datagram(&mut self, mut buf: &[u8]) {
        if buf.len() < 8 {
            log::debug!("Tracker datagram too short");
            return;
        }
        let action = buf.get_u32();
        let transaction_id = buf.get_u32();

        let pending = match self.pending.remove(&transaction_id) {
            Some(pending) => pending,
            None => {
                log::debug!(
                    "Tracker response with unknown transaction {}",
                    transaction_id
                );
                return;
            }
        };

        match pending.kind {
            PendingKind::Connect => {
                if action != ACTION_CONNECT || buf.len() < 8 {
                    log::warn!("Invalid tracker connect response");
                    self.conn = ConnState::Disconnected;
                    return;
                }
                let connection_id = buf.get_u64();
                log::debug!(
                    "Tracker connection established (id: {})",
                    connection_id
                );
                self.conn = ConnState::Connected {
                    connection_id,
                    expires_at: Instant::now() + CONNECTION_ID_TTL,
                };
                // send the requests that were waiting for the handshake
                let waiting: Vec<u32> =
                    self.pending.keys().copied().collect();
                for transaction_id in waiting.into_iter() {
                    self.send_request(transaction_id).await;
                }
            }
            PendingKind::Announce { chan, .. } => {
                let result = if action == ACTION_ERROR {
                    Err(parse_error_response(buf))
                } else if action == ACTION_ANNOUNCE {
                    parse_announce_response(buf)
                } else {
                    Err(TrackerError::InvalidResponse)
                };
                chan.send(result).ok();
            }
            PendingKind::Scrape { info_hashes, chan } => {
                let result = if action == ACTION_ERROR {
                    Err(parse_error_response(buf))
                } else if action == ACTION_SCRAPE {
                    parse_scrape_response(buf, info_hashes.len())
                } else {
                    Err(TrackerError::InvalidResponse)
                };
                chan.send(result).ok();
            }
        }
    }

    /// Retransmits every request whose deadline passed, with exponential
    /// backoff; a request out of retries fails, which also advances to the
    /// next resolved endpoint.
    async fn handle_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(transaction_id, _)| *transaction_id)
            .collect();

        let mut endpoint_failed = false;
        for transaction_id in expired.into_iter() {
            let pending = match self.pending.get_mut(&transaction_id) {
                Some(pending) => pending,
                None => continue,
            };
            if pending.num_retries >= MAX_RETRIES {
                log::warn!(
                    "Tracker request {} failed after {} retries",
                    transaction_id,
                    pending.num_retries
                );
                let pending = self
                    .pending
                    .remove(&transaction_id)
                    .expect("pending tracker request missing");
                match pending.kind {
                    PendingKind::Connect => {
                        self.conn = ConnState::Disconnected;
                        // requests waiting for this handshake fail with it
                        self.fail_all_pending(TrackerError::Timeout);
                    }
                    PendingKind::Announce { chan, .. } => {
                        chan.send(Err(TrackerError::Timeout)).ok();
                    }
                    PendingKind::Scrape { chan, .. } => {
                        chan.send(Err(TrackerError::Timeout)).ok();
                    }
                }
                endpoint_failed = true;
                continue;
            }

            let is_connect = matches!(pending.kind, PendingKind::Connect);
            pending.num_retries += 1;
            let num_retries = pending.num_retries;
            pending.deadline = now + retry_delay(num_retries);
            log::debug!(
                "Retrying tracker request {} (attempt {})",
                transaction_id,
                num_retries
            );
            if is_connect {
                self.send_connect(transaction_id).await;
            } else {
                self.send_request(transaction_id).await;
            }
        }

        if endpoint_failed {
            self.rotate_endpoint().await;
        }
    }

    /// Fails every pending non-connect request with a copy of the error.
    fn fail_all_pending(&mut self, error: TrackerError) {
        let pending = std::mem::take(&mut self.pending);
        for (_, entry) in pending.into_iter() {
            let error = match &error {
                TrackerError::Timeout => TrackerError::Timeout,
                _ => TrackerError::Channel,
            };
            match entry.kind {
                PendingKind::Connect => {}
                PendingKind::Announce { chan, .. } => {
                    chan.send(Err(error)).ok();
                }
                PendingKind::Scrape { chan, .. } => {
                    chan.send(Err(error)).ok();
                }
            }
        }
    }

    /// The current endpoint failed: reconnect the socket to the next
    /// resolved endpoint (wrapping around) and drop the tracker connection
    /// state, which belongs to the old endpoint.
    async fn rotate_endpoint(&mut self) {
        if self.endpoints.len() > 1 {
            self.current_endpoint =
                (self.current_endpoint + 1) % self.endpoints.len();
            let endpoint = self.endpoints[self.current_endpoint];
            log::info!("Switching to tracker endpoint {}", endpoint);
            if let Err(e) = self.socket.connect(endpoint).await {
                log::warn!("Tracker endpoint connect error: {}", e);
            }
        }
        self.conn = ConnState::Disconnected;
    }
}

fn encode_connect_request(transaction_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_MAGIC);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

/// Builds the fixed size, 98 byte announce request.
fn encode_announce_request(
    connection_id: u64,
    transaction_id: u32,
    params: &Announce,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.extend_from_slice(&params.info_hash);
    buf.extend_from_slice(&params.peer_id);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_u32(Event::to_wire(params.event));
    // let the tracker determine our IP address
    buf.put_u32(0);
    // the key identifies this client across IP changes
    buf.put_u32(rand::thread_rng().gen());
    buf.put_i32(
        params
            .peer_count
            .map(|count| count as i32)
            .unwrap_or(-1),
    );
    buf.put_u16(params.port);
    debug_assert_eq!(buf.len(), 98);
    buf
}

fn encode_scrape_request(
    connection_id: u64,
    transaction_id: u32,
    info_hashes: &[Sha1Hash],
) -> BytesMut {
    debug_assert!(info_hashes.len() <= MAX_SCRAPE_HASHES);
    let mut buf = BytesMut::with_capacity(16 + 20 * info_hashes.len());
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_SCRAPE);
    buf.put_u32(transaction_id);
    for info_hash in info_hashes.iter() {
        buf.extend_from_slice(info_hash);
    }
    buf
}

/// Parses the body of an announce response (after the action and
/// transaction id): the interval, the swarm counts, and the compact list of
/// 6 byte IPv4 peer records.
fn parse_announce_response(mut buf: &[u8]) -> Result<AnnounceResponse> {
    if buf.len() < 12 || (buf.len() - 12) % 6 != 0 {
        return Err(TrackerError::InvalidResponse);
    }
    let interval = Duration::from_secs(buf.get_u32() as u64);
    let leecher_count = buf.get_u32() as usize;
    let seeder_count = buf.get_u32() as usize;

    let mut peers = Vec::with_capacity(buf.len() / 6);
    while buf.remaining() >= 6 {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16();
        peers.push(SocketAddr::new(IpAddr::V4(ip), port));
    }

    Ok(AnnounceResponse {
        interval,
        leecher_count,
        seeder_count,
        peers,
    })
}

/// Parses the body of a scrape response: 12 bytes of counts per requested
/// info hash, in request order.
fn parse_scrape_response(
    mut buf: &[u8],
    num_hashes: usize,
) -> Result<Vec<ScrapeEntry>> {
    if buf.len() < num_hashes * 12 {
        return Err(TrackerError::InvalidResponse);
    }
    let mut entries = Vec::with_capacity(num_hashes);
    for _ in 0..num_hashes {
        entries.push(ScrapeEntry {
            seeder_count: buf.get_u32() as usize,
            download_count: buf.get_u32() as usize,
            leecher_count: buf.get_u32() as usize,
        });
    }
    Ok(entries)
}

fn parse_error_response(buf: &[u8]) -> TrackerError {
    TrackerError::Rejected(String::from_utf8_lossy(buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_params() -> Announce {
        Announce {
            info_hash: [0xab; 20],
            peer_id: *b"tide-2025-10-01-0000",
            port: 6881,
            downloaded: 1234,
            uploaded: 256,
            left: 100_000,
            peer_count: Some(50),
            event: Some(Event::Started),
        }
    }

    // The retransmission schedule is 15 * 2^n seconds with at most eight
    // retries: 15, 30, 60, 120, 240, 480, 960, 1920.
    #[test]
    fn test_retry_schedule() {
        let mut delays = Vec::new();
        for num_retries in 0..MAX_RETRIES {
            delays.push(retry_delay(num_retries).as_secs());
        }
        assert_eq!(delays, vec![15, 30, 60, 120, 240, 480, 960, 1920]);
    }

    #[test]
    fn test_connect_request_layout() {
        let packet = encode_connect_request(0xdead_beef);
        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[0..8], &PROTOCOL_MAGIC.to_be_bytes());
        assert_eq!(&packet[8..12], &ACTION_CONNECT.to_be_bytes());
        assert_eq!(&packet[12..16], &0xdead_beefu32.to_be_bytes());
    }

    // The announce request must be exactly 98 bytes, per BEP 15.
    #[test]
    fn test_announce_request_layout() {
        let params = announce_params();
        let packet = encode_announce_request(0x1122_3344, 0x5566, &params);
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &0x1122_3344u64.to_be_bytes());
        assert_eq!(&packet[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&packet[12..16], &0x5566u32.to_be_bytes());
        assert_eq!(&packet[16..36], &params.info_hash);
        assert_eq!(&packet[36..56], &params.peer_id);
        assert_eq!(&packet[56..64], &params.downloaded.to_be_bytes());
        assert_eq!(&packet[64..72], &params.left.to_be_bytes());
        assert_eq!(&packet[72..80], &params.uploaded.to_be_bytes());
        // started event
        assert_eq!(&packet[80..84], &2u32.to_be_bytes());
        assert_eq!(&packet[92..96], &50i32.to_be_bytes());
        assert_eq!(&packet[96..98], &params.port.to_be_bytes());
    }

    #[test]
    fn test_scrape_request_layout() {
        let hashes = vec![[1u8; 20], [2u8; 20]];
        let packet = encode_scrape_request(7, 8, &hashes);
        assert_eq!(packet.len(), 16 + 40);
        assert_eq!(&packet[8..12], &ACTION_SCRAPE.to_be_bytes());
        assert_eq!(&packet[16..36], &hashes[0]);
        assert_eq!(&packet[36..56], &hashes[1]);

        // the maximum scrape request still fits within a datagram
        assert!(16 + 20 * MAX_SCRAPE_HASHES <= MAX_DATAGRAM_LEN);
        assert!(8 + 12 * MAX_SCRAPE_HASHES <= MAX_DATAGRAM_LEN);
    }

    #[test]
    fn test_parse_announce_response() {
        let mut buf = BytesMut::new();
        buf.put_u32(1800);
        buf.put_u32(3);
        buf.put_u32(5);
        // two compact peer records
        buf.extend_from_slice(&[192, 168, 0, 10]);
        buf.put_u16(49123);
        buf.extend_from_slice(&[10, 0, 0, 1]);
        buf.put_u16(6881);

        let response = parse_announce_response(&buf).unwrap();
        assert_eq!(
            response,
            AnnounceResponse {
                interval: Duration::from_secs(1800),
                leecher_count: 3,
                seeder_count: 5,
                peers: vec![
                    SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)),
                        49123,
                    ),
                    SocketAddr::new(
                        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                        6881,
                    ),
                ],
            }
        );
    }

    #[test]
    fn test_parse_announce_response_without_peers() {
        let mut buf = BytesMut::new();
        buf.put_u32(900);
        buf.put_u32(0);
        buf.put_u32(1);
        let response = parse_announce_response(&buf).unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_parse_invalid_announce_response() {
        // truncated header
        assert!(parse_announce_response(&[0; 11]).is_err());
        // a peer list that is not a multiple of six bytes
        assert!(parse_announce_response(&[0; 15]).is_err());
    }

    #[test]
    fn test_parse_scrape_response() {
        let mut buf = BytesMut::new();
        for counts in [[5u32, 100, 3], [0, 0, 0]] {
            for count in counts {
                buf.put_u32(count);
            }
        }
        let entries = parse_scrape_response(&buf, 2).unwrap();
        assert_eq!(
            entries,
            vec![
                ScrapeEntry {
                    seeder_count: 5,
                    download_count: 100,
                    leecher_count: 3,
                },
                ScrapeEntry {
                    seeder_count: 0,
                    download_count: 0,
                    leecher_count: 0,
                },
            ]
        );

        assert!(parse_scrape_response(&buf, 3).is_err());
    }

    #[test]
    fn test_parse_error_response() {
        let error = parse_error_response(b"torrent not registered");
        assert!(matches!(
            error,
            TrackerError::Rejected(reason) if reason == "torrent not registered"
        ));
    }
}
