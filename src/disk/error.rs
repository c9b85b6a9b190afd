use std::fmt;

use crate::error::Error;

/// The disk IO result type.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned on failed torrent allocations.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// The torrent entry already exists in `Disk`'s torrent list.
    AlreadyExists,
    /// IO error while allocating torrent.
    Io(std::io::Error),
}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => {
                write!(fmt, "disk torrent entry already exists")
            }
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}

/// The error with which a single block's save concludes without the block
/// having been persisted.
///
/// These are outcomes, not disk failures: each lets the upstream download
/// logic conclude what to do with the block (usually to re-request it).
#[derive(Debug)]
pub(crate) enum BlockError {
    /// The maximum number of blocks that may be buffered after an
    /// unsuccessful attempt at saving them to disk has been reached, so any
    /// further blocks are dropped.
    Dropped,
    /// The same block was submitted for saving more than once.
    Duplicate,
    /// The block's piece index and/or offset and/or length are invalid.
    Invalid,
    /// The block belonged to a piece that failed its hash check, so the not
    /// yet persisted blocks of the piece were discarded.
    CorruptDataDropped,
    /// The save was aborted by an abrupt shutdown before completing.
    Aborted,
    /// The block could not be saved due to an IO error.
    Io(std::io::Error),
}

impl fmt::Display for BlockError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Dropped => write!(fmt, "block dropped"),
            Self::Duplicate => write!(fmt, "duplicate block"),
            Self::Invalid => write!(fmt, "invalid block"),
            Self::CorruptDataDropped => {
                write!(fmt, "corrupt piece data dropped")
            }
            Self::Aborted => write!(fmt, "operation aborted"),
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}

/// Error type returned on failed block reads.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block's piece index is invalid.
    InvalidPieceIndex,
    /// The block's offset or length in piece is invalid.
    InvalidBlockOffset,
    /// The block is valid within torrent but its data has not been downloaded
    /// yet or has been deleted.
    DataMissing,
    /// The read was aborted by an abrupt shutdown before completing.
    Aborted,
    /// An IO error occurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            // hitting end of file means the data has not been written yet
            Self::DataMissing
        } else {
            Self::Io(e)
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(fmt, "invalid piece index"),
            Self::InvalidBlockOffset => write!(fmt, "invalid block offset"),
            Self::DataMissing => write!(fmt, "torrent data missing"),
            Self::Aborted => write!(fmt, "operation aborted"),
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}
