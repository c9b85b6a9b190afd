use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;

use super::file::TorrentFile;
use crate::{
    disk::{
        error::*,
        piece::{BufferedBlock, PartialPiece},
        TorrentAlertReceiver, TorrentAlertSender,
    },
    peer,
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};

/// The disk task's record of one torrent.
///
/// Contains the in-progress pieces (i.e. the write buffer), the in-flight
/// block fetches, and the torrent's storage.
pub(super) struct TorrentEntry {
    pub id: TorrentId,
    /// The torrent's opened files and piece geometry. Worker jobs hold
    /// a reference for the duration of one operation, which keeps the
    /// storage alive even if the entry is removed mid-operation.
    pub storage: Arc<TorrentStorage>,
    /// The concatenation of all expected piece hashes.
    pub piece_hashes: Vec<u8>,
    /// The channel used to alert the torrent of save results, piece
    /// completions, and read errors.
    pub alert_chan: TorrentAlertSender,
    /// The in-progress pieces, keyed by their index. Entries are stable:
    /// a piece stays in place for as long as any of its state is alive.
    pub pieces: HashMap<PieceIndex, PartialPiece>,
    /// The in-flight block fetches with the requests waiting on each.
    pub block_fetches: Vec<BlockFetch>,
    /// The number of worker jobs currently operating on this torrent. The
    /// entry is not dropped while this is non-zero.
    pub num_pending_ops: usize,
    /// Set when the torrent is being removed; new operations are rejected
    /// and the entry is dropped once the pending operations drain.
    pub is_removing: bool,
}

/// A single in-flight read operation, serving every overlapping block
/// request issued while it is running.
pub(super) struct BlockFetch {
    pub piece_index: PieceIndex,
    /// The byte range of the piece being read in.
    pub start: u32,
    pub end: u32,
    /// The requests waiting for this fetch, ordered by requested offset.
    pub subscribers: Vec<FetchSubscriber>,
}

pub(super) struct FetchSubscriber {
    pub block_info: BlockInfo,
    pub chan: peer::Sender,
}

impl TorrentEntry {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    pub fn new(
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        let storage = TorrentStorage::new(info)?;
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                id,
                storage: Arc::new(storage),
                piece_hashes,
                alert_chan,
                pieces: HashMap::new(),
                block_fetches: Vec::new(),
                num_pending_ops: 0,
                is_removing: false,
            },
            alert_port,
        ))
    }

    /// Returns the expected hash of the piece, or `None` if the piece index
    /// is out of bounds of the hash list.
    pub fn expected_piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let hash_pos = index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            return None;
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[hash_pos..hash_pos + 20]);
        Some(hash)
    }

    /// The path of the torrent's resume data blob.
    pub fn resume_data_path(&self, resume_data_dir: &Path) -> PathBuf {
        let name = self
            .storage
            .root_name()
            .unwrap_or_else(|| format!("torrent_{}", self.id));
        resume_data_dir.join(format!("{}.resume", name))
    }
}

/// The opened files of a torrent and the logic to transfer maybe-contiguous
/// block runs to and from them.
///
/// All methods take `&self`: positional reads and writes don't touch the
/// file cursor, so workers may operate on the same file concurrently.
pub(super) struct TorrentStorage {
    pub info: StorageInfo,
    files: Vec<TorrentFile>,
}

impl TorrentStorage {
    /// Creates the torrent's directory tree and opens all its files.
    fn new(info: StorageInfo) -> Result<Self, NewTorrentError> {
        if !info.download_dir.is_dir() {
            log::info!(
                "Creating missing download directory {:?}",
                info.download_dir
            );
            fs::create_dir_all(&info.download_dir)?;
        }

        let mut files = Vec::with_capacity(info.structure.files().len());
        for file in info.structure.files().iter() {
            let path = info.download_dir.join(&file.path);
            // get the parent of the file path: if there is one (i.e. this is
            // not a file in the torrent root), and it doesn't exist, create it
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    log::info!("Creating torrent subdir {:?}", subdir);
                    fs::create_dir_all(subdir).map_err(|e| {
                        log::error!("Failed to create subdir {:?}", subdir);
                        NewTorrentError::Io(e)
                    })?;
                }
            }
            files.push(TorrentFile::new(&info.download_dir, file.clone())?);
        }

        Ok(Self { info, files })
    }

    /// The name of the torrent's root file or directory within the download
    /// directory.
    pub fn root_name(&self) -> Option<String> {
        self.info.structure.files()[0]
            .path
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
    }

    /// The full path of the torrent's root file or directory.
    pub fn root_path(&self) -> Option<PathBuf> {
        self.root_name()
            .map(|name| self.info.download_dir.join(name))
    }

    /// Writes the blocks of one piece to disk, using one positional
    /// vectored write per contiguous run so that the storage layer submits
    /// the fewest possible syscalls.
    ///
    /// The blocks must be ordered by offset but need not be contiguous.
    pub fn write_blocks(
        &self,
        piece_torrent_offset: u64,
        blocks: &[BufferedBlock],
    ) -> io::Result<usize> {
        let mut write_count = 0;
        let mut run_start = 0;
        while run_start < blocks.len() {
            let mut run_end = run_start + 1;
            let mut next_offset = blocks[run_start].offset
                + blocks[run_start].data.len() as u32;
            while run_end < blocks.len()
                && blocks[run_end].offset == next_offset
            {
                next_offset += blocks[run_end].data.len() as u32;
                run_end += 1;
            }

            let bufs: Vec<&[u8]> = blocks[run_start..run_end]
                .iter()
                .map(|block| block.data.as_slice())
                .collect();
            write_count += self.write_contiguous(
                piece_torrent_offset + blocks[run_start].offset as u64,
                bufs,
            )?;
            run_start = run_end;
        }
        Ok(write_count)
    }

    /// Writes a contiguous byte range, possibly spanning multiple files, at
    /// the given offset in the torrent.
    fn write_contiguous(
        &self,
        torrent_offset: u64,
        bufs: Vec<&[u8]>,
    ) -> io::Result<usize> {
        let len: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        let file_range = self
            .info
            .files_intersecting_range(torrent_offset, torrent_offset + len)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mut write_count = 0;
        let mut offset = torrent_offset;
        let mut remaining = bufs;
        for file in self.files[file_range].iter() {
            let slice = file.info.get_slice(offset, len - (offset - torrent_offset));
            let (chunk, rest) = split_bufs(remaining, slice.len as usize);
            write_count += file.write_vectored_at(slice.offset, &chunk)?;
            remaining = rest;
            offset += slice.len;
        }
        debug_assert!(remaining.is_empty());
        Ok(write_count)
    }

    /// Fills the buffers with a contiguous byte range, possibly spanning
    /// multiple files, from the given offset in the torrent.
    pub fn read_contiguous(
        &self,
        torrent_offset: u64,
        bufs: Vec<&mut [u8]>,
    ) -> io::Result<usize> {
        let len: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        let file_range = self
            .info
            .files_intersecting_range(torrent_offset, torrent_offset + len)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let mut read_count = 0;
        let mut offset = torrent_offset;
        let mut remaining = bufs;
        for file in self.files[file_range].iter() {
            let slice = file.info.get_slice(offset, len - (offset - torrent_offset));
            let (chunk, rest) = split_bufs_mut(remaining, slice.len as usize);
            read_count += file.read_vectored_at(slice.offset, chunk)?;
            remaining = rest;
            offset += slice.len;
        }
        debug_assert!(remaining.is_empty());
        Ok(read_count)
    }

    /// Reads an entire piece into a single buffer. Used by the storage
    /// integrity check.
    pub fn read_piece(&self, index: PieceIndex) -> io::Result<Vec<u8>> {
        let piece_len = self
            .info
            .piece_len(index)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut buf = vec![0; piece_len as usize];
        self.read_contiguous(
            self.info.torrent_piece_offset(index),
            vec![&mut buf],
        )?;
        Ok(buf)
    }
}

/// Splits the buffers in two at the given byte count, splitting the
/// boundary buffer if the count falls within one.
fn split_bufs<'a>(
    bufs: Vec<&'a [u8]>,
    mut count: usize,
) -> (Vec<&'a [u8]>, Vec<&'a [u8]>) {
    let mut first = Vec::with_capacity(bufs.len());
    let mut second = Vec::new();
    for buf in bufs.into_iter() {
        if count >= buf.len() {
            count -= buf.len();
            first.push(buf);
        } else if count > 0 {
            first.push(&buf[..count]);
            second.push(&buf[count..]);
            count = 0;
        } else {
            second.push(buf);
        }
    }
    (first, second)
}

/// The mutable buffer counterpart of [`split_bufs`].
fn split_bufs_mut<'a>(
    bufs: Vec<&'a mut [u8]>,
    mut count: usize,
) -> (Vec<&'a mut [u8]>, Vec<&'a mut [u8]>) {
    let mut first = Vec::with_capacity(bufs.len());
    let mut second = Vec::new();
    for buf in bufs.into_iter() {
        if count >= buf.len() {
            count -= buf.len();
            first.push(buf);
        } else if count > 0 {
            let (head, tail) = buf.split_at_mut(count);
            first.push(head);
            second.push(tail);
            count = 0;
        } else {
            second.push(buf);
        }
    }
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};

    fn storage(dir: &Path) -> TorrentStorage {
        // two files, the first 10 000 bytes, the second 22 000
        let files = vec![
            FileInfo {
                path: "archive/a".into(),
                len: 10_000,
                torrent_offset: 0,
            },
            FileInfo {
                path: "archive/b".into(),
                len: 22_000,
                torrent_offset: 10_000,
            },
        ];
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 16_000,
            last_piece_len: 16_000,
            download_len: 32_000,
            download_dir: dir.to_path_buf(),
            structure: FsStructure::Archive { files },
        };
        TorrentStorage::new(info).unwrap()
    }

    #[test]
    fn test_split_bufs() {
        let (a, b) = ([1u8; 10], [2u8; 10]);
        let (first, second) = split_bufs(vec![&a, &b], 15);
        assert_eq!(
            first.iter().map(|buf| buf.len()).sum::<usize>(),
            15
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0], &[2u8; 5]);

        let (first, second) = split_bufs(vec![&a[..], &b[..]], 10);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_write_and_read_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        // a contiguous run of two blocks straddling the file boundary
        let blocks = vec![
            BufferedBlock {
                offset: 0,
                data: vec![3; 8000],
            },
            BufferedBlock {
                offset: 8000,
                data: vec![4; 8000],
            },
        ];
        let count = storage.write_blocks(0, &blocks).unwrap();
        assert_eq!(count, 16_000);

        let mut buf = vec![0; 16_000];
        storage.read_contiguous(0, vec![&mut buf]).unwrap();
        assert!(buf[..8000].iter().all(|b| *b == 3));
        assert!(buf[8000..].iter().all(|b| *b == 4));

        // both physical files must have been written
        assert_eq!(
            fs::metadata(dir.path().join("archive/a")).unwrap().len(),
            10_000
        );
        assert_eq!(
            fs::metadata(dir.path().join("archive/b")).unwrap().len(),
            6_000
        );
    }

    #[test]
    fn test_write_fragmented_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        // two runs with a gap in between: [0, 4000) and [8000, 12000)
        let blocks = vec![
            BufferedBlock {
                offset: 0,
                data: vec![5; 4000],
            },
            BufferedBlock {
                offset: 8000,
                data: vec![6; 4000],
            },
        ];
        let count = storage.write_blocks(0, &blocks).unwrap();
        assert_eq!(count, 8000);

        let mut first = vec![0; 4000];
        storage.read_contiguous(0, vec![&mut first]).unwrap();
        assert!(first.iter().all(|b| *b == 5));

        let mut second = vec![0; 4000];
        storage.read_contiguous(8000, vec![&mut second]).unwrap();
        assert!(second.iter().all(|b| *b == 6));
    }

    #[test]
    fn test_read_missing_data_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        let mut buf = vec![0; 100];
        assert!(storage.read_contiguous(0, vec![&mut buf]).is_err());
    }
}
