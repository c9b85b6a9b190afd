use std::fmt;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type returned on failed peer sessions.
///
/// This error is non-fatal: it tears down the session with the peer but
/// never the torrent.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The bitfield message was only accepted directly after the handshake;
    /// when received at any other time, the connection is severed.
    BitfieldNotAfterHandshake,
    /// The channel on which some component in engine was listening or
    /// sending died.
    Channel,
    /// Peers are not allowed to request blocks while they are choked. If
    /// they do so, their connection is severed.
    RequestWhileChoked,
    /// A peer session timed out because no message was received within the
    /// configured inactivity window.
    InactivityTimeout,
    /// The block information the peer sent is invalid.
    InvalidBlockInfo,
    /// The piece index the peer sent is invalid.
    InvalidPieceIndex,
    /// Peer's torrent info hash did not match ours.
    InvalidInfoHash,
    /// The torrent the session was serving has shut down.
    TorrentGone,
    /// An IO error occurred.
    Io(std::io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            BitfieldNotAfterHandshake => {
                write!(fmt, "received unexpected bitfield")
            }
            Channel => write!(fmt, "channel error"),
            RequestWhileChoked => {
                write!(fmt, "choked peer sent request")
            }
            InactivityTimeout => write!(fmt, "inactivity timeout"),
            InvalidBlockInfo => write!(fmt, "invalid block info"),
            InvalidPieceIndex => write!(fmt, "invalid piece index"),
            InvalidInfoHash => write!(fmt, "invalid info hash"),
            TorrentGone => write!(fmt, "torrent has shut down"),
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl From<IoError> for PeerError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<crate::error::Error> for PeerError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::Io(e) => Self::Io(e),
            // the disk task only ever reports a channel error to its
            // callers in this context (e.g. when sending it a command
            // fails because it has shut down)
            _ => Self::Channel,
        }
    }
}
