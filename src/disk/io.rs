use std::{
    collections::HashMap,
    fs, io,
    sync::Arc,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use tokio::{
    sync::{mpsc, oneshot},
    task, time,
};

use super::{
    buffer::DiskBufferPool,
    cache::{BlockCache, CacheKey},
    error::*,
    piece::{BufferedBlock, PartialPiece},
    Alert, AlertReceiver, AlertSender, BatchWrite, Command, CommandReceiver,
    CommandSender, PieceCompletion, TorrentAlert, TorrentAllocation,
};
use crate::{
    conf::DiskConf, error::Error, peer, Bitfield, Block, BlockInfo,
    PieceIndex, Sha1Hash, TorrentId, BLOCK_LEN,
};
use torrent::{BlockFetch, FetchSubscriber, TorrentEntry, TorrentStorage};

mod file;
mod torrent;

/// After this many consecutive failed write attempts of the same piece the
/// buffered blocks are given up on and their saves fail with the underlying
/// IO error.
const MAX_WRITE_RETRIES: u32 = 16;

/// The entity responsible for persisting downloaded blocks to disk, serving
/// block reads, and verifying whether downloaded pieces are valid.
///
/// The disk task is the single owner of all per-torrent disk state; blocking
/// work (hashing, file IO) is performed by worker jobs that take ownership
/// of the state they need and post their results back to the disk task on an
/// internal channel.
pub(super) struct Disk {
    conf: DiskConf,
    /// Each torrent in the engine has a corresponding entry in this map.
    torrents: HashMap<TorrentId, TorrentEntry>,
    /// Blocks read from disk are inserted into this cache, shared by all
    /// torrents and accessed only on the disk task.
    read_cache: BlockCache,
    /// The pool from which read jobs take their block buffers. Evicted
    /// cache entries return their buffers here.
    buffer_pool: Arc<DiskBufferPool>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
    /// The channel on which worker jobs post their results back to the disk
    /// task.
    job_chan: JobSender,
    job_port: JobReceiver,
    stats: Stats,
}

type JobSender = mpsc::UnboundedSender<JobResult>;
type JobReceiver = mpsc::UnboundedReceiver<JobResult>;

/// The result of a worker job, posted back to the disk task.
enum JobResult {
    Write {
        id: TorrentId,
        piece_index: PieceIndex,
        outcome: WriteJobOutcome,
    },
    Read {
        id: TorrentId,
        piece_index: PieceIndex,
        /// Identifies the fetch entry this job was spawned for.
        start: u32,
        result: Result<Vec<Block>, ReadError>,
    },
}

/// What a write job hands back to the disk task.
struct WriteJobOutcome {
    /// The work buffer. On success these blocks were written; on failure
    /// they are restored into the piece's buffer.
    blocks: Vec<BufferedBlock>,
    /// The hash context, returned to the piece. `None` once the hash has
    /// been finalized.
    hasher: Option<Sha1>,
    /// The new unhashed offset of the piece.
    hashed_to: u32,
    /// The piece's hash verdict, if this job finalized the hash.
    verdict: Option<bool>,
    /// Set if writing the blocks (or reading back blocks for hashing)
    /// failed.
    error: Option<io::Error>,
}

/// The kind of write job to perform on the extracted blocks.
enum WriteJobKind {
    /// Hash whatever prefix is hashable and save all blocks.
    Save,
    /// The piece is complete: finish hashing (reading back blocks saved
    /// without hashing), compare with the expected hash, and save the
    /// blocks if the piece is valid.
    CompletePiece { expected_hash: Sha1Hash },
}

/// The action `dispatch_write` decided to take for a piece.
#[derive(Clone, Copy)]
enum WriteAction {
    CompletePiece,
    HashAndSave(usize),
    Flush,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new(
        conf: DiskConf,
        buffer_pool: Arc<DiskBufferPool>,
    ) -> (Self, CommandSender, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (job_chan, job_port) = mpsc::unbounded_channel();
        let read_cache = BlockCache::new(conf.read_cache_capacity);
        (
            Self {
                conf,
                torrents: HashMap::new(),
                read_cache,
                buffer_pool,
                cmd_port,
                alert_chan,
                job_chan,
                job_port,
                stats: Stats::default(),
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        // drives per-piece expiry and write retry deadlines
        let mut sweep_timer = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down disk event loop");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd)?,
                    }
                }
                Some(job) = self.job_port.recv() => {
                    self.handle_job_result(job)?;
                }
                _ = sweep_timer.tick() => {
                    self.sweep_deadlines()?;
                }
            }
        }
        self.abort_pending_saves();
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::NewTorrent {
                id,
                storage_info,
                piece_hashes,
            } => self.allocate_new_torrent(id, storage_info, piece_hashes),
            Command::SaveBlock {
                id,
                block_info,
                data,
            } => self.save_block(id, block_info, data),
            Command::FetchBlock {
                id,
                block_info,
                chan,
            } => self.fetch_block(id, block_info, chan),
            Command::CreateSha1Digest { data, chan } => {
                task::spawn_blocking(move || {
                    let digest = Sha1::digest(&data);
                    let mut hash = [0; 20];
                    hash.copy_from_slice(&digest);
                    let _ = chan.send(hash);
                });
                Ok(())
            }
            Command::CheckStorageIntegrity { id, pieces, chan } => {
                self.check_storage_integrity(id, pieces, chan)
            }
            Command::SaveResumeData { id, blob, chan } => {
                match self.resume_data_path(id) {
                    Some(path) => {
                        task::spawn_blocking(move || {
                            let _ = chan.send(
                                fs::write(&path, &blob)
                                    .map_err(Error::from),
                            );
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::LoadResumeData { id, chan } => {
                match self.resume_data_path(id) {
                    Some(path) => {
                        task::spawn_blocking(move || {
                            let _ = chan.send(
                                fs::read(&path).map_err(Error::from),
                            );
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::EraseResumeData { id, chan } => {
                match self.resume_data_path(id) {
                    Some(path) => {
                        task::spawn_blocking(move || {
                            let _ = chan.send(
                                fs::remove_file(&path).map_err(Error::from),
                            );
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::MoveTorrent { id, new_dir, chan } => {
                let root = self
                    .torrents
                    .get(&id)
                    .and_then(|entry| entry.storage.root_path());
                match root {
                    Some(root) => {
                        task::spawn_blocking(move || {
                            let result = root
                                .file_name()
                                .map(|name| new_dir.join(name))
                                .ok_or(Error::InvalidDownloadPath)
                                .and_then(|target| {
                                    fs::rename(&root, target)
                                        .map_err(Error::from)
                                });
                            let _ = chan.send(result);
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::RenameTorrent { id, name, chan } => {
                let root = self
                    .torrents
                    .get(&id)
                    .and_then(|entry| entry.storage.root_path());
                match root {
                    Some(root) => {
                        task::spawn_blocking(move || {
                            let result = root
                                .parent()
                                .map(|dir| dir.join(name))
                                .ok_or(Error::InvalidDownloadPath)
                                .and_then(|target| {
                                    fs::rename(&root, target)
                                        .map_err(Error::from)
                                });
                            let _ = chan.send(result);
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::EraseTorrentFiles { id, chan } => {
                let root = self
                    .torrents
                    .get(&id)
                    .and_then(|entry| entry.storage.root_path());
                let resume_path = self.resume_data_path(id);
                self.remove_torrent_entry(id);
                match root {
                    Some(root) => {
                        task::spawn_blocking(move || {
                            let result = if root.is_dir() {
                                fs::remove_dir_all(&root)
                            } else {
                                fs::remove_file(&root)
                            };
                            if let Some(resume_path) = resume_path {
                                // the resume data may not exist
                                let _ = fs::remove_file(resume_path);
                            }
                            let _ =
                                chan.send(result.map_err(Error::from));
                        });
                    }
                    None => {
                        let _ = chan.send(Err(Error::InvalidTorrentId));
                    }
                }
                Ok(())
            }
            Command::RemoveTorrent { id } => {
                self.remove_torrent_entry(id);
                Ok(())
            }
            Command::SetReadCacheCapacity { num_blocks } => {
                log::info!("Resizing read cache to {} block(s)", num_blocks);
                self.read_cache.change_capacity(num_blocks);
                Ok(())
            }
            Command::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    fn allocate_new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: crate::storage_info::StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Allocating torrent {}", id);
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            self.alert_chan.send(Alert::TorrentAllocation(Err(
                NewTorrentError::AlreadyExists,
            )))?;
            return Ok(());
        }

        // NOTE: do _not_ return on failure, we don't want to kill the disk
        // task due to potential disk IO errors: we just want to log it and
        // notify the engine of it.
        match TorrentEntry::new(id, storage_info, piece_hashes) {
            Ok((entry, alert_port)) => {
                log::info!("Torrent {} successfully allocated", id);
                self.torrents.insert(id, entry);
                self.alert_chan.send(Alert::TorrentAllocation(Ok(
                    TorrentAllocation { id, alert_port },
                )))?;
            }
            Err(e) => {
                log::warn!("Torrent {} allocation failure: {}", id, e);
                self.alert_chan.send(Alert::TorrentAllocation(Err(e)))?;
            }
        }
        Ok(())
    }

    /// Buffers the block in its piece's write buffer and dispatches a write
    /// if a batch is due.
    fn save_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let conf = &self.conf;
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) if !entry.is_removing => entry,
            _ => {
                log::warn!("Torrent {} not found", id);
                return Ok(());
            }
        };

        // validate the block info before buffering anything
        let piece_len = match entry.storage.info.piece_len(info.piece_index) {
            Ok(piece_len) => piece_len,
            Err(_) => {
                log::warn!("Piece index of {} is invalid", info);
                return send_saves(
                    entry,
                    vec![(info, Err(BlockError::Invalid))],
                    None,
                );
            }
        };
        if !info.is_valid(piece_len) || data.len() != info.len as usize {
            log::warn!("{} is invalid", info);
            return send_saves(
                entry,
                vec![(info, Err(BlockError::Invalid))],
                None,
            );
        }

        if !entry.pieces.contains_key(&info.piece_index) {
            log::trace!("Creating piece {} write buffer", info.piece_index);
            if let Ok(file_range) =
                entry.storage.info.files_intersecting_piece(info.piece_index)
            {
                log::trace!(
                    "Piece {} intersects files: {:?}",
                    info.piece_index,
                    file_range
                );
            }
            let expected_hash = match entry.expected_piece_hash(info.piece_index)
            {
                Some(hash) => hash,
                None => {
                    log::warn!(
                        "No hash for piece {} in torrent {}",
                        info.piece_index,
                        id
                    );
                    return send_saves(
                        entry,
                        vec![(info, Err(BlockError::Invalid))],
                        None,
                    );
                }
            };
            entry.pieces.insert(
                info.piece_index,
                PartialPiece::new(info.piece_index, piece_len, expected_hash),
            );
        }
        let piece = entry
            .pieces
            .get_mut(&info.piece_index)
            .expect("newly inserted piece not present");

        if piece.has_block(info.offset) {
            log::warn!("Duplicate block {}", info);
            return send_saves(
                entry,
                vec![(info, Err(BlockError::Duplicate))],
                None,
            );
        }

        // the buffer bound depends on the piece's state: during an in-flight
        // flush blocks may accrue up to the write buffer capacity, and while
        // a failed write is being retried slightly beyond it; anything more
        // is dropped
        let buffer_bound = if piece.retry_at.is_some()
            || piece.num_write_failures > 0
        {
            conf.write_buffer_capacity
                + conf.max_buffered_blocks_after_write_error
        } else if piece.is_busy {
            conf.write_buffer_capacity
        } else {
            usize::MAX
        };
        if piece.buffer.len() >= buffer_bound {
            log::warn!("Write buffer of piece {} full, dropping {}", info.piece_index, info);
            return send_saves(
                entry,
                vec![(info, Err(BlockError::Dropped))],
                None,
            );
        }

        piece.insert_block(info.offset, data, conf.write_buffer_expiry);
        self.dispatch_write(id, info.piece_index, false)
    }

    /// Decides whether the piece's buffered blocks warrant a worker job,
    /// and if so, extracts them and spawns it.
    ///
    /// `force` flushes the buffer regardless of batching considerations;
    /// it is used by the expiry and retry deadlines.
    fn dispatch_write(
        &mut self,
        id: TorrentId,
        piece_index: PieceIndex,
        force: bool,
    ) -> Result<()> {
        let write_cache_line_size = self.conf.write_cache_line_size;
        let write_buffer_capacity = self.conf.write_buffer_capacity;
        let job_chan = self.job_chan.clone();
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) if !entry.is_removing => entry,
            _ => return Ok(()),
        };
        let piece = match entry.pieces.get_mut(&piece_index) {
            Some(piece) => piece,
            None => return Ok(()),
        };

        if piece.is_busy {
            return Ok(());
        }
        if let Some(retry_at) = piece.retry_at {
            if Instant::now() < retry_at {
                return Ok(());
            }
            piece.retry_at = None;
        }

        let action = if piece.is_complete() {
            WriteAction::CompletePiece
        } else {
            let hashable = piece.hashable_prefix_len();
            if hashable >= write_cache_line_size {
                WriteAction::HashAndSave(hashable)
            } else if piece.buffer.len() >= write_buffer_capacity
                || (force && !piece.buffer.is_empty())
            {
                WriteAction::Flush
            } else {
                return Ok(());
            }
        };

        let count = match action {
            WriteAction::HashAndSave(count) => count,
            _ => piece.buffer.len(),
        };
        let blocks = piece.extract_blocks(count);
        let hasher = piece.hasher.take();
        let unhashed_offset = piece.unhashed_offset;
        // a piece whose verdict is already known is only being re-saved
        let kind = match action {
            WriteAction::CompletePiece if piece.verdict.is_none() => {
                WriteJobKind::CompletePiece {
                    expected_hash: piece.expected_hash,
                }
            }
            _ => WriteJobKind::Save,
        };
        piece.is_busy = true;
        piece.expiry = None;
        entry.num_pending_ops += 1;

        let storage = Arc::clone(&entry.storage);
        let piece_torrent_offset =
            storage.info.torrent_piece_offset(piece_index);
        let piece_len = piece.len;

        log::debug!(
            "Dispatching write of {} block(s) of piece {}",
            blocks.len(),
            piece_index
        );
        task::spawn_blocking(move || {
            let outcome = run_write_job(
                &storage,
                piece_torrent_offset,
                piece_len,
                blocks,
                hasher,
                unhashed_offset,
                kind,
            );
            let _ = job_chan.send(JobResult::Write {
                id,
                piece_index,
                outcome,
            });
        });
        Ok(())
    }

    fn handle_job_result(&mut self, job: JobResult) -> Result<()> {
        match job {
            JobResult::Write {
                id,
                piece_index,
                outcome,
            } => self.handle_write_job_result(id, piece_index, outcome),
            JobResult::Read {
                id,
                piece_index,
                start,
                result,
            } => self.handle_read_job_result(id, piece_index, start, result),
        }
    }

    fn handle_write_job_result(
        &mut self,
        id: TorrentId,
        piece_index: PieceIndex,
        outcome: WriteJobOutcome,
    ) -> Result<()> {
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) => entry,
            // the torrent was removed while the job was running
            None => return Ok(()),
        };
        entry.num_pending_ops -= 1;
        if entry.is_removing {
            if entry.num_pending_ops == 0 {
                self.torrents.remove(&id);
            }
            return Ok(());
        }
        let piece = match entry.pieces.get_mut(&piece_index) {
            Some(piece) => piece,
            None => return Ok(()),
        };
        piece.is_busy = false;
        piece.hasher = outcome.hasher;
        piece.unhashed_offset = outcome.hashed_to;

        if let Some(false) = outcome.verdict {
            // The piece is corrupt: its unsaved blocks are dropped and the
            // piece entry is removed so that a re-download starts clean.
            // Blocks already written to disk will simply be overwritten by
            // valid data later.
            log::warn!("Piece {} is invalid, dropping block data", piece_index);
            let saves = outcome
                .blocks
                .iter()
                .map(|block| {
                    (
                        block_info(piece_index, block),
                        Err(BlockError::CorruptDataDropped),
                    )
                })
                .collect();
            entry.pieces.remove(&piece_index);
            return send_saves(
                entry,
                saves,
                Some(PieceCompletion {
                    index: piece_index,
                    is_valid: false,
                }),
            );
        }

        if let Some(error) = outcome.error {
            log::warn!(
                "Error writing piece {} to disk: {}",
                piece_index,
                error
            );
            self.stats.num_write_failures += 1;
            piece.num_write_failures += 1;

            // the hash verdict, if this job produced one, stands regardless
            // of the failed write
            let completion = if outcome.verdict == Some(true)
                && piece.verdict.is_none()
            {
                piece.verdict = Some(true);
                Some(PieceCompletion {
                    index: piece_index,
                    is_valid: true,
                })
            } else {
                None
            };

            if piece.num_write_failures >= MAX_WRITE_RETRIES {
                // give up: conclude every pending save with the error
                log::error!(
                    "Giving up saving piece {} after {} attempts",
                    piece_index,
                    MAX_WRITE_RETRIES
                );
                let mut saves: Vec<_> = outcome
                    .blocks
                    .iter()
                    .map(|block| {
                        (
                            block_info(piece_index, block),
                            Err(BlockError::Io(io::Error::new(
                                error.kind(),
                                error.to_string(),
                            ))),
                        )
                    })
                    .collect();
                for block in piece.buffer.iter() {
                    saves.push((
                        block_info(piece_index, block),
                        Err(BlockError::Dropped),
                    ));
                }
                entry.pieces.remove(&piece_index);
                return send_saves(entry, saves, completion);
            }

            piece.restore_buffer(outcome.blocks);
            let delay = retry_delay(piece.num_write_failures);
            log::info!(
                "Retrying piece {} save in {} s",
                piece_index,
                delay.as_secs()
            );
            piece.retry_at = Some(Instant::now() + delay);
            if let Some(completion) = completion {
                return send_saves(entry, Vec::new(), Some(completion));
            }
            return Ok(());
        }

        // success
        let offsets: Vec<u32> =
            outcome.blocks.iter().map(|block| block.offset).collect();
        piece.mark_saved(&offsets);
        piece.num_write_failures = 0;
        self.stats.num_blocks_written += offsets.len() as u64;

        let completion =
            if outcome.verdict == Some(true) && piece.verdict.is_none() {
                piece.verdict = Some(true);
                Some(PieceCompletion {
                    index: piece_index,
                    is_valid: true,
                })
            } else {
                None
            };
        let saves = outcome
            .blocks
            .iter()
            .map(|block| (block_info(piece_index, block), Ok(())))
            .collect();

        let is_fully_saved = piece.num_saved_blocks == piece.num_blocks()
            && piece.verdict == Some(true);
        if is_fully_saved {
            entry.pieces.remove(&piece_index);
        }
        send_saves(entry, saves, completion)?;

        if !is_fully_saved {
            // more blocks may have accrued while the worker was busy
            self.dispatch_write(id, piece_index, false)?;
        }
        Ok(())
    }

    /// Serves a block from the read cache, subscribes the request to an
    /// overlapping in-flight fetch, or dispatches a new read.
    fn fetch_block(
        &mut self,
        id: TorrentId,
        info: BlockInfo,
        chan: peer::Sender,
    ) -> Result<()> {
        let read_ahead = self.conf.read_ahead;
        let read_cache_line_size = self.conf.read_cache_line_size;
        let job_chan = self.job_chan.clone();
        let buffer_pool = Arc::clone(&self.buffer_pool);
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) if !entry.is_removing => entry,
            _ => {
                log::warn!("Torrent {} not found", id);
                return Ok(());
            }
        };

        // validate the request
        let piece_len = match entry.storage.info.piece_len(info.piece_index) {
            Ok(piece_len) => piece_len,
            Err(_) => {
                log::warn!("Piece index of {} is invalid", info);
                entry.alert_chan.send(TorrentAlert::ReadError {
                    block_info: info,
                    error: ReadError::InvalidPieceIndex,
                })?;
                return Ok(());
            }
        };
        // only whole blocks are served (the last block of a piece may be
        // shorter than the rest)
        let expected_len = (piece_len - info.offset.min(piece_len)).min(BLOCK_LEN);
        if !info.is_valid(piece_len) || info.len != expected_len {
            log::warn!("{} is invalid", info);
            entry.alert_chan.send(TorrentAlert::ReadError {
                block_info: info,
                error: ReadError::InvalidBlockOffset,
            })?;
            return Ok(());
        }

        // the happy path: the block is already cached
        let key = CacheKey {
            torrent: id,
            piece: info.piece_index,
            offset: info.offset,
        };
        if let Some(data) = self.read_cache.get(&key) {
            log::trace!("{} served from the read cache", info);
            self.stats.num_read_cache_hits += 1;
            chan.send(peer::Command::Block(Block::new(info, data))).ok();
            return Ok(());
        }
        self.stats.num_read_cache_misses += 1;

        // coalesce with an in-flight fetch that covers this block
        if let Some(fetch) = entry.block_fetches.iter_mut().find(|fetch| {
            fetch.piece_index == info.piece_index
                && fetch.start <= info.offset
                && info.offset < fetch.end
        }) {
            log::trace!("{} coalesced with an in-flight fetch", info);
            let pos = fetch
                .subscribers
                .iter()
                .position(|sub| sub.block_info.offset > info.offset)
                .unwrap_or(fetch.subscribers.len());
            fetch.subscribers.insert(
                pos,
                FetchSubscriber {
                    block_info: info,
                    chan,
                },
            );
            return Ok(());
        }

        // dispatch a read; depending on configuration and the number of
        // blocks left in piece this is a single block or a read ahead
        let start = info.offset;
        let end = if read_ahead {
            piece_len.min(start + read_cache_line_size as u32 * BLOCK_LEN)
        } else {
            start + info.len
        };
        entry.block_fetches.push(BlockFetch {
            piece_index: info.piece_index,
            start,
            end,
            subscribers: vec![FetchSubscriber {
                block_info: info,
                chan,
            }],
        });
        entry.num_pending_ops += 1;

        let storage = Arc::clone(&entry.storage);
        log::debug!(
            "Dispatching read of piece {} range [{}, {})",
            info.piece_index,
            start,
            end
        );
        task::spawn_blocking(move || {
            let result = run_read_job(
                &storage,
                &buffer_pool,
                info.piece_index,
                start,
                end,
            );
            let _ = job_chan.send(JobResult::Read {
                id,
                piece_index: info.piece_index,
                start,
                result,
            });
        });
        Ok(())
    }

    fn handle_read_job_result(
        &mut self,
        id: TorrentId,
        piece_index: PieceIndex,
        start: u32,
        result: Result<Vec<Block>, ReadError>,
    ) -> Result<()> {
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.num_pending_ops -= 1;
        let fetch_pos = entry.block_fetches.iter().position(|fetch| {
            fetch.piece_index == piece_index && fetch.start == start
        });
        let fetch = match fetch_pos {
            Some(pos) => entry.block_fetches.remove(pos),
            None => return Ok(()),
        };
        if entry.is_removing {
            if entry.num_pending_ops == 0 {
                self.torrents.remove(&id);
            }
            return Ok(());
        }

        match result {
            Ok(blocks) => {
                self.stats.num_blocks_read += blocks.len() as u64;
                // all read blocks go into the shared cache
                for block in blocks.iter() {
                    self.read_cache.insert(
                        CacheKey {
                            torrent: id,
                            piece: piece_index,
                            offset: block.offset,
                        },
                        Arc::clone(&block.data),
                    );
                }
                // serve every waiting request
                for sub in fetch.subscribers.into_iter() {
                    match blocks
                        .iter()
                        .find(|block| block.offset == sub.block_info.offset)
                    {
                        Some(block) => {
                            sub.chan
                                .send(peer::Command::Block(block.clone()))
                                .ok();
                        }
                        None => {
                            entry.alert_chan.send(
                                TorrentAlert::ReadError {
                                    block_info: sub.block_info,
                                    error: ReadError::InvalidBlockOffset,
                                },
                            )?;
                        }
                    }
                }
            }
            Err(error) => {
                log::warn!(
                    "Error reading piece {} range starting at {}: {}",
                    piece_index,
                    start,
                    error
                );
                for sub in fetch.subscribers.into_iter() {
                    entry.alert_chan.send(TorrentAlert::ReadError {
                        block_info: sub.block_info,
                        error: clone_read_error(&error),
                    })?;
                }
            }
        }
        Ok(())
    }

    fn check_storage_integrity(
        &mut self,
        id: TorrentId,
        pieces: Bitfield,
        chan: oneshot::Sender<Result<Bitfield>>,
    ) -> Result<()> {
        let entry = match self.torrents.get(&id) {
            Some(entry) if !entry.is_removing => entry,
            _ => {
                let _ = chan.send(Err(Error::InvalidTorrentId));
                return Ok(());
            }
        };
        let storage = Arc::clone(&entry.storage);
        let piece_hashes = entry.piece_hashes.clone();
        task::spawn_blocking(move || {
            let mut verified =
                Bitfield::repeat(false, storage.info.piece_count);
            for index in 0..storage.info.piece_count {
                if !pieces.get(index).map(|bit| *bit).unwrap_or(false) {
                    continue;
                }
                let piece = match storage.read_piece(index) {
                    Ok(piece) => piece,
                    // a piece that cannot be read back simply does not
                    // verify
                    Err(_) => continue,
                };
                let digest = Sha1::digest(&piece);
                let hash_pos = index * 20;
                if piece_hashes.get(hash_pos..hash_pos + 20)
                    == Some(digest.as_slice())
                {
                    verified.set(index, true);
                }
            }
            let _ = chan.send(Ok(verified));
        });
        Ok(())
    }

    /// Flushes pieces whose buffered blocks have lingered past their expiry
    /// and retries writes whose backoff deadline has passed.
    fn sweep_deadlines(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut due: Vec<(TorrentId, PieceIndex)> = Vec::new();
        for (id, entry) in self.torrents.iter() {
            for (piece_index, piece) in entry.pieces.iter() {
                if piece.is_busy {
                    continue;
                }
                let expired = piece
                    .expiry
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false);
                let retriable = piece
                    .retry_at
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false);
                if expired || retriable {
                    due.push((*id, *piece_index));
                }
            }
        }
        for (id, piece_index) in due.into_iter() {
            log::debug!(
                "Piece {} write deadline passed, flushing",
                piece_index
            );
            self.dispatch_write(id, piece_index, true)?;
        }
        if self.stats.num_blocks_written > 0 {
            log::trace!(
                "Disk stats: written: {}, read: {}, \
                cache hits/misses: {}/{}, cache size: {}/{}",
                self.stats.num_blocks_written,
                self.stats.num_blocks_read,
                self.stats.num_read_cache_hits,
                self.stats.num_read_cache_misses,
                self.read_cache.len(),
                self.read_cache.capacity(),
            );
        }
        Ok(())
    }

    /// Removes the torrent's entry and cached blocks. Unsaved buffered
    /// blocks conclude with an aborted save result.
    fn remove_torrent_entry(&mut self, id: TorrentId) {
        self.read_cache.erase_torrent(id);
        let entry = match self.torrents.get_mut(&id) {
            Some(entry) => entry,
            None => return,
        };
        // waiting block fetches conclude with an aborted read
        for fetch in entry.block_fetches.drain(..) {
            for sub in fetch.subscribers.into_iter() {
                entry
                    .alert_chan
                    .send(TorrentAlert::ReadError {
                        block_info: sub.block_info,
                        error: ReadError::Aborted,
                    })
                    .ok();
            }
        }
        let pieces = std::mem::take(&mut entry.pieces);
        let mut saves = Vec::new();
        for (piece_index, piece) in pieces.into_iter() {
            for block in piece.buffer.iter() {
                saves.push((
                    block_info(piece_index, block),
                    Err(BlockError::Aborted),
                ));
            }
            for offset in piece.work.iter() {
                saves.push((
                    BlockInfo {
                        piece_index,
                        offset: *offset,
                        len: piece.block_len_at(*offset),
                    },
                    Err(BlockError::Aborted),
                ));
            }
        }
        if !saves.is_empty() {
            send_saves(entry, saves, None).ok();
        }
        if entry.num_pending_ops == 0 {
            self.torrents.remove(&id);
        } else {
            // the entry is dropped once its worker jobs drain
            entry.is_removing = true;
        }
    }

    /// Concludes every buffered save with an aborted result. Called when
    /// the disk task shuts down.
    fn abort_pending_saves(&mut self) {
        let ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
        for id in ids.into_iter() {
            self.remove_torrent_entry(id);
        }
    }

    fn resume_data_path(&self, id: TorrentId) -> Option<std::path::PathBuf> {
        self.torrents
            .get(&id)
            .map(|entry| entry.resume_data_path(&self.conf.resume_data_dir))
    }
}

/// Sends a batch write alert for the given save results and optional piece
/// completion.
fn send_saves(
    entry: &TorrentEntry,
    saves: Vec<(BlockInfo, Result<(), BlockError>)>,
    piece: Option<PieceCompletion>,
) -> Result<()> {
    if saves.is_empty() && piece.is_none() {
        return Ok(());
    }
    entry
        .alert_chan
        .send(TorrentAlert::BatchWrite(BatchWrite { saves, piece }))
        .map_err(Error::from)
}

fn block_info(piece_index: PieceIndex, block: &BufferedBlock) -> BlockInfo {
    BlockInfo {
        piece_index,
        offset: block.offset,
        len: block.data.len() as u32,
    }
}

/// The delay before the n-th consecutive write retry, growing exponentially
/// up to two minutes.
fn retry_delay(num_failures: u32) -> Duration {
    Duration::from_secs((1u64 << num_failures.min(7)).min(120))
}

/// Makes a copy of a read error so that it can be delivered to multiple
/// waiting requests.
fn clone_read_error(error: &ReadError) -> ReadError {
    match error {
        ReadError::InvalidPieceIndex => ReadError::InvalidPieceIndex,
        ReadError::InvalidBlockOffset => ReadError::InvalidBlockOffset,
        ReadError::DataMissing => ReadError::DataMissing,
        ReadError::Aborted => ReadError::Aborted,
        ReadError::Io(e) => {
            ReadError::Io(io::Error::new(e.kind(), e.to_string()))
        }
    }
}

/// The body of a write worker job. Hashes what can be hashed, writes the
/// blocks to disk, and reports the piece's hash verdict if it completed.
///
/// This performs blocking IO and possibly expensive hashing and must be
/// executed on the blocking thread pool, not the async executor.
fn run_write_job(
    storage: &TorrentStorage,
    piece_torrent_offset: u64,
    piece_len: u32,
    blocks: Vec<BufferedBlock>,
    mut hasher: Option<Sha1>,
    mut unhashed_offset: u32,
    kind: WriteJobKind,
) -> WriteJobOutcome {
    let mut verdict = None;

    match kind {
        WriteJobKind::Save => {
            // feed the gapless prefix of the blocks to the hasher; the rest
            // is saved unhashed and read back when the piece completes
            if let Some(hasher) = hasher.as_mut() {
                for block in blocks.iter() {
                    if block.offset != unhashed_offset {
                        break;
                    }
                    hasher.update(&block.data);
                    unhashed_offset += block.data.len() as u32;
                }
            }
        }
        WriteJobKind::CompletePiece { expected_hash } => {
            let hash = match hasher.as_mut() {
                Some(hasher) => finish_hashing(
                    storage,
                    piece_torrent_offset,
                    piece_len,
                    &blocks,
                    hasher,
                    &mut unhashed_offset,
                ),
                None => Err(io::ErrorKind::InvalidInput.into()),
            };
            match hash {
                Ok(digest) => {
                    let is_valid = digest == expected_hash;
                    log::debug!(
                        "Piece at torrent offset {} is {}",
                        piece_torrent_offset,
                        if is_valid { "valid" } else { "NOT valid" }
                    );
                    verdict = Some(is_valid);
                    // the context is spent once the hash is finalized
                    hasher = None;
                }
                Err(error) => {
                    // couldn't read back flushed blocks; treat it like
                    // a failed write so that it is retried
                    return WriteJobOutcome {
                        blocks,
                        hasher,
                        hashed_to: unhashed_offset,
                        verdict: None,
                        error: Some(error),
                    };
                }
            }
        }
    }

    // save the blocks to disk, unless the piece turned out corrupt
    let error = if verdict == Some(false) {
        None
    } else {
        storage
            .write_blocks(piece_torrent_offset, &blocks)
            .err()
    };

    WriteJobOutcome {
        blocks,
        hasher,
        hashed_to: unhashed_offset,
        verdict,
        error,
    }
}

/// Finishes hashing a complete piece: blocks still in the work buffer are
/// hashed from memory, while blocks that were flushed to disk unhashed are
/// read back. Returns the piece's finalized hash.
fn finish_hashing(
    storage: &TorrentStorage,
    piece_torrent_offset: u64,
    piece_len: u32,
    blocks: &[BufferedBlock],
    hasher: &mut Sha1,
    unhashed_offset: &mut u32,
) -> io::Result<Sha1Hash> {
    let mut next_block = blocks
        .iter()
        .position(|block| block.offset >= *unhashed_offset)
        .unwrap_or(blocks.len());
    while *unhashed_offset < piece_len {
        let len = (piece_len - *unhashed_offset).min(BLOCK_LEN);
        match blocks.get(next_block) {
            Some(block) if block.offset == *unhashed_offset => {
                hasher.update(&block.data);
                next_block += 1;
            }
            _ => {
                // the block was saved to disk without hashing; read it back
                let mut buf = vec![0; len as usize];
                storage.read_contiguous(
                    piece_torrent_offset + *unhashed_offset as u64,
                    vec![&mut buf],
                )?;
                hasher.update(&buf);
            }
        }
        *unhashed_offset += len;
    }

    let digest = hasher.finalize_reset();
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    Ok(hash)
}

/// The body of a read worker job: reads the byte range `[start, end)` of
/// the piece into pooled block buffers.
fn run_read_job(
    storage: &TorrentStorage,
    buffer_pool: &DiskBufferPool,
    piece_index: PieceIndex,
    start: u32,
    end: u32,
) -> Result<Vec<Block>, ReadError> {
    debug_assert!(start < end);
    let mut buffers = Vec::new();
    let mut offset = start;
    while offset < end {
        let len = (end - offset).min(BLOCK_LEN);
        buffers.push((offset, buffer_pool.get(len as usize)));
        offset += len;
    }

    let bufs: Vec<&mut [u8]> = buffers
        .iter_mut()
        .map(|(_, buf)| &mut buf[..])
        .collect();
    storage.read_contiguous(
        storage.info.torrent_piece_offset(piece_index) + start as u64,
        bufs,
    )?;

    Ok(buffers
        .into_iter()
        .map(|(offset, buf)| Block {
            piece_index,
            offset,
            data: Arc::new(buf),
        })
        .collect())
}

#[derive(Default)]
struct Stats {
    /// The number of blocks successfully written to disk.
    num_blocks_written: u64,
    /// The number of blocks read from disk (not counting cache hits).
    num_blocks_read: u64,
    num_read_cache_hits: u64,
    num_read_cache_misses: u64,
    /// The number of times a write job failed.
    num_write_failures: u64,
}
