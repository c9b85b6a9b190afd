use std::{
    fs::{File, OpenOptions},
    io::{self, IoSlice, IoSliceMut},
    path::Path,
};

use nix::sys::uio::{preadv, pwritev};

use crate::{disk::error::NewTorrentError, FileInfo};

pub(super) struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens the file in create, read, and write modes at the path combining
    /// the download directory and the path defined in the file info.
    pub fn new(
        download_dir: &Path,
        info: FileInfo,
    ) -> Result<Self, NewTorrentError> {
        log::trace!(
            "Opening and creating file {:?} in dir {:?}",
            info,
            download_dir
        );
        let path = download_dir.join(&info.path);
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;
        Ok(Self { info, handle })
    }

    /// Writes the given buffers to the file at the given file offset with as
    /// few syscalls as possible.
    ///
    /// IO syscalls are not guaranteed to transfer the whole input in one go,
    /// so the positional vectored write is repeated until all bytes have been
    /// confirmed to be transferred to disk (or an error occurs). The
    /// operation is thus not guaranteed to be atomic.
    pub fn write_vectored_at(
        &self,
        mut offset: u64,
        bufs: &[&[u8]],
    ) -> io::Result<usize> {
        let mut bufs: Vec<&[u8]> = bufs.to_vec();
        let mut total = 0;
        while !bufs.is_empty() {
            let iovecs: Vec<_> =
                bufs.iter().map(|buf| IoSlice::new(buf)).collect();
            let count = pwritev(&self.handle, &iovecs, offset as i64)
                .map_err(|e| {
                    log::warn!("File {:?} write error: {}", self.info.path, e);
                    io::Error::from_raw_os_error(e as i32)
                })?;
            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            offset += count as u64;
            total += count;
            advance_bufs(&mut bufs, count);
        }
        Ok(total)
    }

    /// Fills the given buffers from the file starting at the given file
    /// offset.
    ///
    /// Like the write counterpart, the positional vectored read is repeated
    /// until every buffer is filled. Hitting end of file before that is an
    /// error: it means the requested data has not been downloaded (or has
    /// been deleted).
    pub fn read_vectored_at(
        &self,
        mut offset: u64,
        bufs: Vec<&mut [u8]>,
    ) -> io::Result<usize> {
        let mut bufs = bufs;
        let mut total = 0;
        while !bufs.is_empty() {
            let mut iovecs: Vec<_> = bufs
                .iter_mut()
                .map(|buf| IoSliceMut::new(buf))
                .collect();
            let count = preadv(&self.handle, &mut iovecs, offset as i64)
                .map_err(|e| {
                    log::warn!("File {:?} read error: {}", self.info.path, e);
                    io::Error::from_raw_os_error(e as i32)
                })?;
            if count == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            offset += count as u64;
            total += count;
            advance_bufs_mut(&mut bufs, count);
        }
        Ok(total)
    }
}

/// Drops the first `count` bytes from the front of the buffer list.
fn advance_bufs(bufs: &mut Vec<&[u8]>, mut count: usize) {
    while count > 0 && !bufs.is_empty() {
        if count >= bufs[0].len() {
            count -= bufs[0].len();
            bufs.remove(0);
        } else {
            bufs[0] = &bufs[0][count..];
            count = 0;
        }
    }
}

/// Drops the first `count` bytes from the front of the mutable buffer list.
fn advance_bufs_mut(bufs: &mut Vec<&mut [u8]>, mut count: usize) {
    while count > 0 && !bufs.is_empty() {
        if count >= bufs[0].len() {
            count -= bufs[0].len();
            bufs.remove(0);
        } else {
            let buf = bufs.remove(0);
            let (_, rest) = buf.split_at_mut(count);
            bufs.insert(0, rest);
            count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_bufs() {
        let (a, b, c) = ([0u8; 4], [0u8; 4], [0u8; 4]);
        let mut bufs: Vec<&[u8]> = vec![&a, &b, &c];

        advance_bufs(&mut bufs, 4);
        assert_eq!(bufs.len(), 2);

        advance_bufs(&mut bufs, 6);
        assert_eq!(bufs.len(), 1);
        assert_eq!(bufs[0].len(), 2);

        advance_bufs(&mut bufs, 2);
        assert!(bufs.is_empty());
    }

    #[test]
    fn test_write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let info = FileInfo {
            path: "blocks".into(),
            len: 32,
            torrent_offset: 0,
        };
        let file = TorrentFile::new(dir.path(), info).unwrap();

        let first = [1u8; 8];
        let second = [2u8; 8];
        let count = file.write_vectored_at(4, &[&first, &second]).unwrap();
        assert_eq!(count, 16);

        let mut read_first = [0u8; 8];
        let mut read_second = [0u8; 8];
        let count = file
            .read_vectored_at(4, vec![&mut read_first, &mut read_second])
            .unwrap();
        assert_eq!(count, 16);
        assert_eq!(read_first, first);
        assert_eq!(read_second, second);
    }

    #[test]
    fn test_read_past_end_of_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let info = FileInfo {
            path: "empty".into(),
            len: 32,
            torrent_offset: 0,
        };
        let file = TorrentFile::new(dir.path(), info).unwrap();

        let mut buf = [0u8; 8];
        assert!(file.read_vectored_at(0, vec![&mut buf]).is_err());
    }
}
