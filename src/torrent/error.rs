use std::fmt;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

/// Error type returned on torrent failures.
#[derive(Debug)]
#[non_exhaustive]
pub enum TorrentError {
    /// The channel on which some component in engine was listening or
    /// sending died.
    Channel,
    /// The torrent could not be allocated on disk.
    Allocation(String),
    /// An IO error occurred.
    Io(std::io::Error),
}

impl fmt::Display for TorrentError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use TorrentError::*;
        match self {
            Channel => write!(fmt, "channel error"),
            Allocation(reason) => {
                write!(fmt, "torrent allocation error: {}", reason)
            }
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl From<IoError> for TorrentError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for TorrentError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
