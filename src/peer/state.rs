use std::time::{Duration, Instant};

use crate::{avg::SlidingDurationAvg, counter::Counter, Bitfield, PeerId, BLOCK_LEN};

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield
    /// exchange occurs after the handshake and not later. It is set once
    /// the handshakes are exchanged and changed as soon as we receive the
    /// bitfield or the first message that is not a bitfield. Any subsequent
    /// bitfield messages are rejected and the connection is dropped, as per
    /// the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
    /// The session is shutting down: a graceful stop drains the send
    /// buffer and outstanding disk writes before disconnecting.
    Disconnecting,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
#[derive(Debug)]
pub(super) struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    pub id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pub pieces: Option<Bitfield>,
}

/// The mutable state of a peer session, driving the session's protocol
/// decisions.
pub(super) struct SessionState {
    /// Information about the peer, set after a successful handshake.
    pub peer: Option<PeerInfo>,

    /// The current state of the connection.
    pub connection: ConnectionState,

    /// Whether the session is in slow start.
    ///
    /// To keep up with the transport layer's slow start algorithm (which
    /// unlike its name, exponentially increases window size), a session
    /// starts out in slow start as well, wherein the target request queue
    /// size is increased by one every time one of our requests got served,
    /// doubling the queue size with each round trip. The first request
    /// timeout ends slow start.
    pub in_slow_start: bool,

    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    pub is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    pub is_peer_interested: bool,

    /// Counts the bytes received during protocol chatter.
    pub downloaded_protocol_counter: Counter,
    /// Counts the bytes sent during protocol chatter.
    pub uploaded_protocol_counter: Counter,
    /// Counts the downloaded payload bytes.
    pub downloaded_payload_counter: Counter,
    /// Counts the uploaded payload bytes.
    pub uploaded_payload_counter: Counter,

    /// The target request queue size is the number of block requests we
    /// keep outstanding to fully saturate the link.
    ///
    /// Each peer session needs to maintain an "optimal request queue size"
    /// value (approximately the bandwidth-delay product), which is the
    /// number of block requests it keeps outstanding to fully saturate the
    /// link.
    ///
    /// While in slow start the queue grows by one with each served request;
    /// afterwards it tracks the bandwidth-delay product B x D,
    /// recalculated every tick. A request timeout halves the queue, with
    /// a floor of two, so that a single stale peer doesn't keep a large
    /// stuck pipeline.
    ///
    /// Only set once we start downloading.
    pub target_request_queue_len: Option<usize>,

    /// The number of requests that have timed out in this session.
    pub timed_out_request_count: usize,

    /// The last time some requests were sent to the peer.
    pub last_outgoing_request_time: Option<Instant>,
    /// Updated with the time of receipt of the most recently received
    /// requested block.
    pub last_incoming_block_time: Option<Instant>,
    /// The time any message was last received from the peer, driving the
    /// inactivity timeout.
    pub last_incoming_message_time: Option<Instant>,
    /// The time we last sent anything to the peer, driving keep-alives.
    pub last_outgoing_message_time: Option<Instant>,

    /// This is the average network round-trip-time between issuing
    /// a request and receiving the next block.
    ///
    /// Note that it doesn't have to be the same block since peers are not
    /// required to serve our requests in order, so this is more of
    /// a general approximation.
    pub avg_request_rtt: SlidingDurationAvg,

    /// The configured initial request queue size, applied when a download
    /// (re)starts.
    start_request_queue_len: usize,
}

impl SessionState {
    /// When we check whether to exit slow start mode we want to allow for
    /// some error margin. This is because there may be "micro-fluctuations"
    /// in the download rate but over a longer time the download rate may
    /// still be increasing significantly.
    const SLOW_START_ERROR_MARGIN: u64 = 10_000;

    /// A request that was not served within four round trips (but at least
    /// two seconds) is considered timed out.
    const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

    /// The request queue is never halved below this.
    const MIN_REQUEST_QUEUE_LEN: usize = 2;

    pub fn new(start_request_queue_len: usize) -> Self {
        Self {
            peer: None,
            connection: ConnectionState::default(),
            in_slow_start: false,
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            downloaded_protocol_counter: Counter::default(),
            uploaded_protocol_counter: Counter::default(),
            downloaded_payload_counter: Counter::default(),
            uploaded_payload_counter: Counter::default(),
            target_request_queue_len: None,
            timed_out_request_count: 0,
            last_outgoing_request_time: None,
            last_incoming_block_time: None,
            last_incoming_message_time: None,
            last_outgoing_message_time: None,
            // an inverted gain of 8 makes the steady-state update an EWMA
            // with a gain of 1/8
            avg_request_rtt: SlidingDurationAvg::new(8),
            start_request_queue_len,
        }
    }

    /// Prepares the session for requesting downloads. Called when the peer
    /// unchokes us.
    pub fn prepare_for_download(&mut self) {
        debug_assert!(!self.is_choked);

        self.in_slow_start = true;
        // reset the target request queue size, which will be adjusted as the
        // download progresses
        self.target_request_queue_len = Some(self.start_request_queue_len);
    }

    /// Updates various statistics around a block download.
    ///
    /// This should be called every time a block is received.
    pub fn update_download_stats(&mut self, block_len: u32) {
        let now = Instant::now();

        // update the request round trip time
        if let Some(last_outgoing_request_time) =
            &self.last_outgoing_request_time
        {
            let request_rtt = now.duration_since(*last_outgoing_request_time);
            self.avg_request_rtt.update(request_rtt);
        }

        self.downloaded_payload_counter += block_len as u64;
        self.last_incoming_block_time = Some(now);

        // if we're in slow-start mode, we need to increase the target queue
        // size every time a block is received
        if self.in_slow_start {
            if let Some(target_request_queue_len) =
                &mut self.target_request_queue_len
            {
                *target_request_queue_len += 1;
                log::trace!(
                    "Request queue incremented in slow-start to {}",
                    *target_request_queue_len
                );
            }
        }
    }

    /// Records a request timeout: slow start is over and the request queue
    /// is halved, with a floor of two outstanding requests.
    pub fn register_request_timeout(&mut self) {
        self.timed_out_request_count += 1;
        self.in_slow_start = false;
        if let Some(target_request_queue_len) =
            &mut self.target_request_queue_len
        {
            *target_request_queue_len = (*target_request_queue_len / 2)
                .max(Self::MIN_REQUEST_QUEUE_LEN);
            log::info!(
                "Request queue halved to {} after timeout",
                *target_request_queue_len
            );
        }
    }

    /// The timeout for outstanding requests: four times the average round
    /// trip time, but at least two seconds.
    pub fn request_timeout(&self) -> Duration {
        let timeout = 4 * self.avg_request_rtt.mean();
        timeout.max(Self::MIN_REQUEST_TIMEOUT)
    }

    /// Updates various statistics and session state.
    ///
    /// This should be called every second.
    pub fn tick(&mut self) {
        self.maybe_exit_slow_start();
        self.update_target_request_queue_len();
        self.reset_counters();
    }

    /// Check if we need to exit slow start.
    ///
    /// We leave slow start if the download rate has not increased
    /// significantly since the last round.
    fn maybe_exit_slow_start(&mut self) {
        if !self.is_choked
            && self.in_slow_start
            && self.target_request_queue_len.is_some()
            && self.downloaded_payload_counter.round() > 0
            && self.downloaded_payload_counter.round()
                + Self::SLOW_START_ERROR_MARGIN
                < self.downloaded_payload_counter.avg()
        {
            self.in_slow_start = false;
        }
    }

    /// Adjusts the target request queue size based on the current download
    /// statistics.
    ///
    /// This does nothing while the peer is in slow start mode, as in that
    /// case the request queue size is increased by one every time a block
    /// is received.
    fn update_target_request_queue_len(&mut self) {
        if let Some(target_request_queue_len) =
            &mut self.target_request_queue_len
        {
            let prev_queue_len = *target_request_queue_len;

            if !self.in_slow_start {
                let download_rate = self.downloaded_payload_counter.avg();
                // guard against integer truncation and round up as
                // overestimating the link capacity is cheaper than
                // underestimating it
                *target_request_queue_len =
                    ((download_rate + (BLOCK_LEN - 1) as u64)
                        / BLOCK_LEN as u64) as usize;
            }

            if *target_request_queue_len < Self::MIN_REQUEST_QUEUE_LEN {
                *target_request_queue_len = Self::MIN_REQUEST_QUEUE_LEN;
            }

            if prev_queue_len != *target_request_queue_len {
                log::debug!(
                    "Request queue changed from {} to {}",
                    prev_queue_len,
                    *target_request_queue_len
                );
            }
        }
    }

    /// Marks the end of the round for the various throughput rate counters.
    fn reset_counters(&mut self) {
        for counter in [
            &mut self.downloaded_payload_counter,
            &mut self.uploaded_payload_counter,
            &mut self.uploaded_protocol_counter,
            &mut self.downloaded_protocol_counter,
        ] {
            counter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests the slow start lifecycle: the queue grows with each served
    // block, and a timeout ends slow start and halves the queue with
    // a floor.
    #[test]
    fn test_slow_start_and_timeout() {
        let mut state = SessionState::new(4);
        state.is_choked = false;
        state.prepare_for_download();
        assert!(state.in_slow_start);
        assert_eq!(state.target_request_queue_len, Some(4));

        for _ in 0..6 {
            state.update_download_stats(BLOCK_LEN);
        }
        assert_eq!(state.target_request_queue_len, Some(10));

        state.register_request_timeout();
        assert!(!state.in_slow_start);
        assert_eq!(state.target_request_queue_len, Some(5));

        state.register_request_timeout();
        state.register_request_timeout();
        assert_eq!(state.target_request_queue_len, Some(2));
        assert_eq!(state.timed_out_request_count, 3);
    }

    // Tests that the request timeout has a two second floor and tracks
    // four round trips.
    #[test]
    fn test_request_timeout() {
        let mut state = SessionState::new(4);
        assert_eq!(state.request_timeout(), Duration::from_secs(2));

        for _ in 0..8 {
            state.avg_request_rtt.update(Duration::from_millis(900));
        }
        assert_eq!(state.request_timeout(), Duration::from_millis(3600));
    }
}
