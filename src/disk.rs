use std::{path::PathBuf, sync::Arc};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task,
};

use crate::{
    conf::DiskConf, error::Error, peer, storage_info::StorageInfo, Bitfield,
    BlockInfo, PieceIndex, Sha1Hash, TorrentId,
};
use buffer::{DiskBuffer, DiskBufferPool};
use io::Disk;

pub(crate) use error::*;

pub(crate) mod buffer;
mod cache;
mod error;
mod io;
mod piece;
mod sketch;

/// Spawns a disk IO task and returns a tuple with the task join handle, the
/// disk handle used for sending commands, and a channel for receiving
/// command results and other notifications.
pub(crate) fn spawn(
    conf: DiskConf,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let buffer_pool = Arc::new(DiskBufferPool::new(conf.read_cache_capacity));
    let (mut disk, cmd_chan, alert_port) =
        Disk::new(conf, Arc::clone(&buffer_pool));
    // spawn the disk event loop on a new task
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((
        join_handle,
        DiskHandle {
            cmd_chan,
            buffer_pool,
        },
        alert_port,
    ))
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
    buffer_pool: Arc<DiskBufferPool>,
}

impl DiskHandle {
    /// Creates a new torrent in the disk task.
    ///
    /// This instructs the disk task to set up everything needed for a new
    /// torrent, which includes in-memory metadata storage and setting up the
    /// torrent's file system structure on disk.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Allocating new torrent {}", id);
        self.cmd_chan
            .send(Command::NewTorrent {
                id,
                storage_info,
                piece_hashes,
            })
            .map_err(Error::from)
    }

    /// Hands out a pooled buffer that the caller may fill with block data
    /// directly, avoiding a later copy when the block is saved.
    // the in-crate peer session receives blocks through its codec; this is
    // for block producers that fill buffers themselves
    #[allow(dead_code)]
    pub fn get_disk_buffer(&self, len: usize) -> DiskBuffer {
        self.buffer_pool.get(len)
    }

    /// Queues a block for eventual writing to disk.
    ///
    /// Blocks are buffered per piece and written in batches. Once this
    /// block's save concludes, a save result for it is advertised on the
    /// torrent's alert channel, and once its piece's hash verdict is known,
    /// a piece completion is advertised there, exactly once per piece.
    pub fn save_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving {} to disk", block_info);
        self.cmd_chan
            .send(Command::SaveBlock {
                id,
                block_info,
                data,
            })
            .map_err(Error::from)
    }

    /// Issues a request for a block, served from the read cache or from
    /// disk. The block is returned via the given peer session sender; read
    /// failures are advertised on the torrent's alert channel.
    pub fn fetch_block(
        &self,
        id: TorrentId,
        block_info: BlockInfo,
        chan: peer::Sender,
    ) -> Result<()> {
        log::trace!("Fetching {} from disk", block_info);
        self.cmd_chan
            .send(Command::FetchBlock {
                id,
                block_info,
                chan,
            })
            .map_err(Error::from)
    }

    /// Hashes arbitrary data on a worker thread.
    pub fn create_sha1_digest(
        &self,
        data: Vec<u8>,
        chan: oneshot::Sender<Sha1Hash>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::CreateSha1Digest { data, chan })
            .map_err(Error::from)
    }

    /// Rehashes the indicated pieces of the torrent from disk and returns
    /// the bitfield of the pieces that verified.
    pub fn check_storage_integrity(
        &self,
        id: TorrentId,
        pieces: Bitfield,
        chan: oneshot::Sender<Result<Bitfield>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::CheckStorageIntegrity { id, pieces, chan })
            .map_err(Error::from)
    }

    /// Writes the torrent's bencoded resume data blob to disk.
    pub fn save_resume_data(
        &self,
        id: TorrentId,
        blob: Vec<u8>,
        chan: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::SaveResumeData { id, blob, chan })
            .map_err(Error::from)
    }

    /// Reads back the torrent's resume data blob.
    pub fn load_resume_data(
        &self,
        id: TorrentId,
        chan: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::LoadResumeData { id, chan })
            .map_err(Error::from)
    }

    /// Deletes the torrent's resume data, retaining its downloaded files.
    pub fn erase_resume_data(
        &self,
        id: TorrentId,
        chan: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::EraseResumeData { id, chan })
            .map_err(Error::from)
    }

    /// Moves the torrent's download root into another directory.
    pub fn move_torrent(
        &self,
        id: TorrentId,
        new_dir: PathBuf,
        chan: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::MoveTorrent { id, new_dir, chan })
            .map_err(Error::from)
    }

    /// Renames the torrent's download root.
    pub fn rename_torrent(
        &self,
        id: TorrentId,
        name: String,
        chan: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::RenameTorrent { id, name, chan })
            .map_err(Error::from)
    }

    /// Completely removes the torrent: its files, resume data, and disk
    /// task state.
    pub fn erase_torrent_files(
        &self,
        id: TorrentId,
        chan: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::EraseTorrentFiles { id, chan })
            .map_err(Error::from)
    }

    /// Removes the torrent's disk task state, retaining its files.
    pub fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        self.cmd_chan
            .send(Command::RemoveTorrent { id })
            .map_err(Error::from)
    }

    /// Resizes the shared read cache. Shrinking evicts per the admission
    /// policy; the cache's access history is rebuilt from scratch.
    pub fn set_read_cache_capacity(&self, num_blocks: usize) -> Result<()> {
        self.cmd_chan
            .send(Command::SetReadCacheCapacity { num_blocks })
            .map_err(Error::from)
    }

    /// Shuts down the disk IO task. Buffered but unsaved blocks conclude
    /// with an aborted save result.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }
}

/// The channel for sending commands to the disk task.
pub(crate) type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    SaveBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    FetchBlock {
        id: TorrentId,
        block_info: BlockInfo,
        chan: peer::Sender,
    },
    CreateSha1Digest {
        data: Vec<u8>,
        chan: oneshot::Sender<Sha1Hash>,
    },
    CheckStorageIntegrity {
        id: TorrentId,
        pieces: Bitfield,
        chan: oneshot::Sender<Result<Bitfield>>,
    },
    SaveResumeData {
        id: TorrentId,
        blob: Vec<u8>,
        chan: oneshot::Sender<Result<()>>,
    },
    LoadResumeData {
        id: TorrentId,
        chan: oneshot::Sender<Result<Vec<u8>>>,
    },
    EraseResumeData {
        id: TorrentId,
        chan: oneshot::Sender<Result<()>>,
    },
    MoveTorrent {
        id: TorrentId,
        new_dir: PathBuf,
        chan: oneshot::Sender<Result<()>>,
    },
    RenameTorrent {
        id: TorrentId,
        name: String,
        chan: oneshot::Sender<Result<()>>,
    },
    EraseTorrentFiles {
        id: TorrentId,
        chan: oneshot::Sender<Result<()>>,
    },
    RemoveTorrent {
        id: TorrentId,
    },
    SetReadCacheCapacity {
        num_blocks: usize,
    },
    Shutdown,
}

/// The type of channel used to alert the engine about global events.
pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which the engine can listen for global disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send about global events (i.e. events
/// not related to individual torrents).
#[derive(Debug)]
pub(crate) enum Alert {
    /// Torrent allocation result. If successful, the id of the allocated
    /// torrent is returned for identification, if not, the reason of the
    /// error is included.
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// The result of successfully allocating a torrent.
#[derive(Debug)]
pub(crate) struct TorrentAllocation {
    /// The id of the torrent that has been allocated.
    pub id: TorrentId,
    /// The port on which the torrent may receive alerts.
    pub alert_port: TorrentAlertReceiver,
}

/// The type of channel used to alert a torrent about torrent specific
/// events.
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
/// The type of channel on which a torrent can listen for block write
/// completions and read errors.
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts that the disk task may send about events related to a specific
/// torrent.
#[derive(Debug)]
pub(crate) enum TorrentAlert {
    /// Sent when a batch of this torrent's block saves concluded and/or a
    /// piece's hash verdict became known.
    BatchWrite(BatchWrite),
    /// There was an error reading a block.
    ReadError {
        block_info: BlockInfo,
        error: ReadError,
    },
}

/// Describes a batch of concluded block saves.
#[derive(Debug)]
pub(crate) struct BatchWrite {
    /// The save result of each block whose save concluded in this batch.
    /// Exactly one result is eventually delivered for every submitted block.
    pub saves: Vec<(BlockInfo, Result<(), BlockError>)>,
    /// Set for the batch that determined the piece's hash verdict, once per
    /// piece.
    pub piece: Option<PieceCompletion>,
}

/// The hash verdict of a completed piece.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PieceCompletion {
    pub index: PieceIndex,
    pub is_valid: bool,
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        block_count, storage_info::FsStructure, FileInfo, BLOCK_LEN,
    };

    /// Tests the allocation of a torrent, and then the allocation of the
    /// same torrent returning an error.
    #[tokio::test]
    async fn should_allocate_new_torrent() {
        let env = Env::new(4, 4, test_conf);
        let (_, disk_handle, mut alert_port) =
            spawn(env.conf.clone()).unwrap();

        disk_handle
            .allocate_new_torrent(
                env.id,
                env.info.clone(),
                env.piece_hashes.clone(),
            )
            .unwrap();

        let alert = alert_port.recv().await.unwrap();
        match alert {
            Alert::TorrentAllocation(res) => {
                assert!(res.is_ok());
                assert_eq!(res.unwrap().id, env.id);
            }
        }

        // check that the file was created on disk
        let file = match &env.info.structure {
            FsStructure::File(file) => file,
            _ => unreachable!(),
        };
        assert!(env.info.download_dir.join(&file.path).is_file());

        // try to allocate the same torrent a second time
        disk_handle
            .allocate_new_torrent(env.id, env.info.clone(), env.piece_hashes)
            .unwrap();

        // we should get an already exists error
        let alert = alert_port.recv().await.unwrap();
        assert!(matches!(
            alert,
            Alert::TorrentAllocation(Err(NewTorrentError::AlreadyExists))
        ));
    }

    /// The happy write path: a piece of four blocks submitted in order is
    /// concluded by a single batch carrying all four save results and the
    /// valid piece completion.
    #[tokio::test]
    async fn should_write_piece_submitted_in_order() {
        let env = Env::new(1, 4, test_conf);
        let (disk_handle, mut alert_port) = env.allocate().await;

        for block in env.piece_blocks(0) {
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }

        let batch = expect_batch_write(&mut alert_port).await;
        let completion = batch.piece.expect("no piece completion");
        assert_eq!(completion.index, 0);
        assert!(completion.is_valid);
        assert_eq!(batch.saves.len(), 4);
        for (block, result) in batch.saves.iter() {
            assert_eq!(block.piece_index, 0);
            assert!(result.is_ok());
        }

        env.assert_piece_on_disk(0);
    }

    /// The out-of-order path: with a write buffer capacity of six, blocks
    /// 0, 1, 2, 4, 5, 6 of an eight block piece trigger a flush in which
    /// only the gapless prefix is hashed. Completing the piece later reads
    /// the unhashed blocks back from disk for hashing.
    #[tokio::test]
    async fn should_flush_fragmented_write_buffer() {
        let env = Env::new(2, 8, || DiskConf {
            write_buffer_capacity: 6,
            ..test_conf()
        });
        let (disk_handle, mut alert_port) = env.allocate().await;

        let blocks = env.piece_blocks(0);
        for block_index in [0usize, 1, 2, 4, 5, 6] {
            let block = blocks[block_index];
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }

        // reaching the buffer capacity flushes all six buffered blocks
        let batch = expect_batch_write(&mut alert_port).await;
        assert!(batch.piece.is_none());
        let mut flushed: Vec<_> = batch
            .saves
            .iter()
            .map(|(block, result)| {
                assert!(result.is_ok());
                block.index_in_piece()
            })
            .collect();
        flushed.sort_unstable();
        assert_eq!(flushed, vec![0, 1, 2, 4, 5, 6]);

        // completing the piece hashes the read back blocks and saves the
        // remaining two
        for block_index in [3usize, 7] {
            let block = blocks[block_index];
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }

        let batch = expect_batch_write(&mut alert_port).await;
        let completion = batch.piece.expect("no piece completion");
        assert!(completion.is_valid);
        let mut saved: Vec<_> = batch
            .saves
            .iter()
            .map(|(block, result)| {
                assert!(result.is_ok());
                block.index_in_piece()
            })
            .collect();
        saved.sort_unstable();
        assert_eq!(saved, vec![3, 7]);

        env.assert_piece_on_disk(0);
    }

    /// Tests that completing a piece whose data does not match its expected
    /// hash drops the unsaved blocks with a corrupt data error.
    #[tokio::test]
    async fn should_drop_corrupt_piece_data() {
        let mut env = Env::new(1, 2, test_conf);
        // corrupt the expected hash of the piece
        for byte in env.piece_hashes.iter_mut().take(20) {
            *byte = byte.wrapping_add(5);
        }
        let (disk_handle, mut alert_port) = env.allocate().await;

        for block in env.piece_blocks(0) {
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }

        let batch = expect_batch_write(&mut alert_port).await;
        let completion = batch.piece.expect("no piece completion");
        assert!(!completion.is_valid);
        assert_eq!(batch.saves.len(), 4);
        for (_, result) in batch.saves.iter() {
            assert!(matches!(result, Err(BlockError::CorruptDataDropped)));
        }
    }

    /// Tests that a duplicate block save concludes with a duplicate block
    /// error while the original save is unaffected.
    #[tokio::test]
    async fn should_reject_duplicate_block() {
        let env = Env::new(2, 4, test_conf);
        let (disk_handle, mut alert_port) = env.allocate().await;

        let block = env.piece_blocks(0)[0];
        disk_handle
            .save_block(env.id, block, env.block_data(0, block))
            .unwrap();
        disk_handle
            .save_block(env.id, block, env.block_data(0, block))
            .unwrap();

        let batch = expect_batch_write(&mut alert_port).await;
        assert_eq!(batch.saves.len(), 1);
        assert!(matches!(
            batch.saves[0].1,
            Err(BlockError::Duplicate)
        ));
    }

    /// Tests that saved blocks can be fetched back, the second fetch being
    /// served from the read cache.
    #[tokio::test]
    async fn should_fetch_saved_blocks() {
        let env = Env::new(1, 4, test_conf);
        let (disk_handle, mut alert_port) = env.allocate().await;

        for block in env.piece_blocks(0) {
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }
        expect_batch_write(&mut alert_port).await;

        let (chan, mut port) = mpsc::unbounded_channel();
        for _ in 0..2 {
            for block in env.piece_blocks(0) {
                disk_handle.fetch_block(env.id, block, chan.clone()).unwrap();
                match port.recv().await {
                    Some(peer::Command::Block(fetched)) => {
                        assert_eq!(fetched.info(), block);
                        assert_eq!(
                            &fetched.data[..],
                            &env.block_data(0, block)[..]
                        );
                    }
                    _ => panic!("block could not be fetched from disk"),
                }
            }
        }
    }

    /// Tests that the integrity check verifies the saved pieces and reports
    /// the unsaved one as invalid.
    #[tokio::test]
    async fn should_check_storage_integrity() {
        let env = Env::new(2, 4, test_conf);
        let (disk_handle, mut alert_port) = env.allocate().await;

        for block in env.piece_blocks(0) {
            disk_handle
                .save_block(env.id, block, env.block_data(0, block))
                .unwrap();
        }
        expect_batch_write(&mut alert_port).await;

        let (chan, port) = oneshot::channel();
        let pieces = Bitfield::repeat(true, env.info.piece_count);
        disk_handle
            .check_storage_integrity(env.id, pieces, chan)
            .unwrap();
        let verified = port.await.unwrap().unwrap();
        assert!(verified[0]);
        assert!(!verified[1]);
    }

    /// Tests the round trip of the torrent's resume data blob.
    #[tokio::test]
    async fn should_save_and_load_resume_data() {
        let env = Env::new(1, 1, test_conf);
        let (disk_handle, _alert_port) = env.allocate().await;

        let blob = b"d8:completei0ee".to_vec();
        let (chan, port) = oneshot::channel();
        disk_handle
            .save_resume_data(env.id, blob.clone(), chan)
            .unwrap();
        port.await.unwrap().unwrap();

        let (chan, port) = oneshot::channel();
        disk_handle.load_resume_data(env.id, chan).unwrap();
        assert_eq!(port.await.unwrap().unwrap(), blob);

        let (chan, port) = oneshot::channel();
        disk_handle.erase_resume_data(env.id, chan).unwrap();
        port.await.unwrap().unwrap();

        let (chan, port) = oneshot::channel();
        disk_handle.load_resume_data(env.id, chan).unwrap();
        assert!(port.await.unwrap().is_err());
    }

    async fn expect_batch_write(
        alert_port: &mut TorrentAlertReceiver,
    ) -> BatchWrite {
        match alert_port.recv().await {
            Some(TorrentAlert::BatchWrite(batch)) => batch,
            alert => panic!("expected batch write alert, got {:?}", alert),
        }
    }

    fn test_conf() -> DiskConf {
        DiskConf::new(std::env::temp_dir())
    }

    /// The disk IO test environment containing information of a valid
    /// torrent.
    struct Env {
        id: TorrentId,
        pieces: Vec<Vec<u8>>,
        piece_hashes: Vec<u8>,
        info: StorageInfo,
        conf: DiskConf,
        // deletes the test directory when the env is dropped
        _dir: tempfile::TempDir,
    }

    impl Env {
        /// Creates a test environment with the given number of pieces of
        /// `piece_len_blocks` blocks each (the last piece slightly shorter,
        /// to test that it is handled correctly).
        fn new(
            piece_count: usize,
            piece_len_blocks: u32,
            conf: impl Fn() -> DiskConf,
        ) -> Self {
            let id = 0;
            let dir = tempfile::tempdir()
                .expect("cannot create disk test directory");
            let piece_len: u32 = piece_len_blocks * BLOCK_LEN;
            let last_piece_len: u32 = piece_len - 935;
            let pieces: Vec<Vec<u8>> = (0..piece_count)
                .map(|piece_index| {
                    let len = if piece_index + 1 == piece_count {
                        last_piece_len
                    } else {
                        piece_len
                    };
                    (0..len)
                        .map(|i| (i as usize + piece_index) as u8)
                        .collect()
                })
                .collect();

            let mut piece_hashes = Vec::with_capacity(pieces.len() * 20);
            for piece in pieces.iter() {
                let hash = Sha1::digest(piece);
                piece_hashes.extend(hash.as_slice());
            }

            let download_len =
                pieces.iter().map(|piece| piece.len() as u64).sum();
            let info = StorageInfo {
                piece_count: pieces.len(),
                piece_len,
                last_piece_len,
                download_len,
                download_dir: dir.path().to_path_buf(),
                structure: FsStructure::File(FileInfo {
                    path: "torrent_disk_test".into(),
                    torrent_offset: 0,
                    len: download_len,
                }),
            };

            let mut conf = conf();
            conf.resume_data_dir = dir.path().to_path_buf();

            Self {
                id,
                pieces,
                piece_hashes,
                info,
                conf,
                _dir: dir,
            }
        }

        /// Spawns the disk task, allocates the torrent, and returns the
        /// handle and the torrent's alert port.
        async fn allocate(&self) -> (DiskHandle, TorrentAlertReceiver) {
            let (_, disk_handle, mut alert_port) =
                spawn(self.conf.clone()).unwrap();
            disk_handle
                .allocate_new_torrent(
                    self.id,
                    self.info.clone(),
                    self.piece_hashes.clone(),
                )
                .unwrap();
            match alert_port.recv().await {
                Some(Alert::TorrentAllocation(Ok(allocation))) => {
                    (disk_handle, allocation.alert_port)
                }
                _ => panic!("torrent could not be allocated"),
            }
        }

        /// Returns the block infos of the piece, in offset order.
        fn piece_blocks(&self, piece_index: usize) -> Vec<BlockInfo> {
            let piece_len = self.pieces[piece_index].len() as u32;
            (0..block_count(piece_len))
                .map(|block_index| {
                    let offset = block_index as u32 * BLOCK_LEN;
                    BlockInfo {
                        piece_index,
                        offset,
                        len: (piece_len - offset).min(BLOCK_LEN),
                    }
                })
                .collect()
        }

        fn block_data(&self, piece_index: usize, block: BlockInfo) -> Vec<u8> {
            let start = block.offset as usize;
            self.pieces[piece_index][start..start + block.len as usize]
                .to_vec()
        }

        /// Asserts that the piece's contents on disk match the source data.
        fn assert_piece_on_disk(&self, piece_index: usize) {
            let file = match &self.info.structure {
                FsStructure::File(file) => file,
                _ => unreachable!(),
            };
            let path = self.info.download_dir.join(&file.path);
            let contents = std::fs::read(path).expect("cannot read download");
            let offset =
                self.info.torrent_piece_offset(piece_index) as usize;
            let piece = &self.pieces[piece_index];
            assert_eq!(&contents[offset..offset + piece.len()], &piece[..]);
        }
    }

}
