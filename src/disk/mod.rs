//! The disk task and its handle.
//!
//! All disk IO of the engine goes through a single spawned task that owns
//! the block cache and the IO scheduler. The engine talks to it through the
//! cloneable [`DiskHandle`]; results come back asynchronously on a global
//! alert channel (torrent allocations, global cache info) and on per
//! torrent alert channels (reads, writes, hashes, fence operations).

mod aio;
mod fence;
mod io;
pub(crate) mod job;

use {
    std::{collections::HashMap, path::PathBuf, sync::Arc},
    tokio::{
        sync::mpsc::{UnboundedReceiver, UnboundedSender},
        task,
    },
};

use crate::{
    conf::DiskConf,
    error::{Error, JobError, NewTorrentError, Result},
    storage::{FileStatus, ResumeData, Storage},
    storage_info::StorageInfo,
    BlockInfo, FileIndex, PieceIndex, Sha1Hash, TorrentId,
};

pub use crate::cache::{BlockRef, CacheStats, ReadBuf};

use io::Disk;

/// Spawns a disk IO task and returns a tuple with the task join handle, the
/// disk handle used for sending commands, and a channel for receiving
/// command results and other notifications.
pub fn spawn(
    conf: DiskConf,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let (mut disk, cmd_chan, alert_port) = Disk::new(conf)?;
    // spawn disk event loop on a new task
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok((join_handle, DiskHandle(cmd_chan), alert_port))
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task. For now,
/// mpsc channels are used for issuing commands and receiving results, but
/// this may well change later on, hence hiding this behind this handle type.
#[derive(Clone)]
pub struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Instructs the disk task to set up everything needed for a new
    /// torrent: registering its storage and initializing it (optionally
    /// preallocating its files).
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        storage: Arc<dyn Storage>,
        info: StorageInfo,
        allocate_files: bool,
    ) -> Result<()> {
        log::trace!("Allocating new torrent {}", id);
        self.0
            .send(Command::NewTorrent {
                id,
                storage,
                info,
                allocate_files,
            })
            .map_err(Error::from)
    }

    /// Requests a block of a piece. The result arrives as a
    /// [`TorrentAlert::ReadCompleted`], zero-copy (a [`BlockRef`]) when the
    /// request covers a single cached block and `force_copy` is off.
    ///
    /// Zero-copy buffers must be handed back with
    /// [`Self::reclaim_block`] once sent, or the block stays pinned in the
    /// cache for good.
    pub fn read(
        &self,
        id: TorrentId,
        block: BlockInfo,
        force_copy: bool,
    ) -> Result<()> {
        log::trace!("Reading block {:?} of torrent {}", block, id);
        self.0
            .send(Command::Read {
                id,
                block,
                force_copy,
            })
            .map_err(Error::from)
    }

    /// Queues a block for eventual writing to disk.
    ///
    /// Ownership of the buffer passes to the disk task's cache. Once the
    /// block is flushed, a [`TorrentAlert::BlockWritten`] is posted.
    pub fn write_block(
        &self,
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", block);
        self.0
            .send(Command::Write { id, block, data })
            .map_err(Error::from)
    }

    /// Computes the full hash of a piece, reading back any blocks no longer
    /// cached. The digest arrives as a [`TorrentAlert::PieceHashed`].
    pub fn hash_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        log::trace!("Hashing piece {} of torrent {}", piece, id);
        self.0
            .send(Command::Hash { id, piece })
            .map_err(Error::from)
    }

    /// Moves the torrent's files to a new download directory, after
    /// flushing and fencing off its outstanding IO.
    pub fn move_storage(
        &self,
        id: TorrentId,
        new_dir: impl Into<PathBuf>,
    ) -> Result<()> {
        self.0
            .send(Command::MoveStorage {
                id,
                new_dir: new_dir.into(),
            })
            .map_err(Error::from)
    }

    /// Renames one of the torrent's files.
    pub fn rename_file(
        &self,
        id: TorrentId,
        file: FileIndex,
        new_name: impl Into<String>,
    ) -> Result<()> {
        self.0
            .send(Command::RenameFile {
                id,
                file,
                new_name: new_name.into(),
            })
            .map_err(Error::from)
    }

    /// Flushes the torrent and closes its file handles.
    pub fn release_files(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::ReleaseFiles { id })
            .map_err(Error::from)
    }

    /// Deletes the torrent's files. Queued writes are aborted; reads
    /// submitted after this complete with an aborted error.
    pub fn delete_files(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::DeleteFiles { id })
            .map_err(Error::from)
    }

    /// Verifies resume data against the on disk state.
    pub fn check_fastresume(
        &self,
        id: TorrentId,
        data: ResumeData,
    ) -> Result<()> {
        self.0
            .send(Command::CheckFastresume {
                id,
                data: Box::new(data),
            })
            .map_err(Error::from)
    }

    /// Captures the torrent's on disk state as resume data, flushing and
    /// fencing first.
    pub fn save_resume_data(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::SaveResumeData { id })
            .map_err(Error::from)
    }

    /// Flushes the torrent and completes once all its cached pieces are
    /// gone, with a [`TorrentAlert::TorrentAborted`].
    pub fn abort_torrent(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::AbortTorrent { id })
            .map_err(Error::from)
    }

    /// Drops the torrent's clean read blocks.
    pub fn clear_read_cache(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::ClearReadCache { id })
            .map_err(Error::from)
    }

    /// Prefetches a whole piece into the read cache.
    pub fn cache_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        self.0
            .send(Command::CachePiece { id, piece })
            .map_err(Error::from)
    }

    /// Tells the storage a file's last byte has been written.
    pub fn finalize_file(&self, id: TorrentId, file: FileIndex) -> Result<()> {
        self.0
            .send(Command::FinalizeFile { id, file })
            .map_err(Error::from)
    }

    /// Cancels the piece's queued writes and evicts it.
    pub fn clear_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        self.0
            .send(Command::ClearPiece { id, piece })
            .map_err(Error::from)
    }

    /// Completes once the piece has no outstanding operations.
    pub fn sync_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        self.0
            .send(Command::SyncPiece { id, piece })
            .map_err(Error::from)
    }

    /// Writes out the piece's dirty blocks; completes once none remain.
    pub fn flush_piece(&self, id: TorrentId, piece: PieceIndex) -> Result<()> {
        self.0
            .send(Command::FlushPiece { id, piece })
            .map_err(Error::from)
    }

    /// Requests a cache metrics snapshot, for one torrent or the whole
    /// cache.
    pub fn cache_info(&self, id: Option<TorrentId>) -> Result<()> {
        self.0
            .send(Command::GetCacheInfo { id })
            .map_err(Error::from)
    }

    /// Requests the open-file status of the torrent's storage.
    pub fn file_status(&self, id: TorrentId) -> Result<()> {
        self.0
            .send(Command::FileStatus { id })
            .map_err(Error::from)
    }

    /// Returns a zero-copy block lease to the cache.
    pub fn reclaim_block(&self, bref: BlockRef) -> Result<()> {
        self.0
            .send(Command::ReclaimBlock { bref })
            .map_err(Error::from)
    }

    /// Applies a new configuration to the running disk task.
    pub fn update_settings(&self, conf: DiskConf) -> Result<()> {
        self.0
            .send(Command::UpdateSettings(conf))
            .map_err(Error::from)
    }

    /// Shuts down the disk IO task, flushing all dirty data first.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// The channel for sending commands to the disk task.
pub(crate) type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The type of commands that the disk task can execute.
pub(crate) enum Command {
    NewTorrent {
        id: TorrentId,
        storage: Arc<dyn Storage>,
        info: StorageInfo,
        allocate_files: bool,
    },
    Read {
        id: TorrentId,
        block: BlockInfo,
        force_copy: bool,
    },
    Write {
        id: TorrentId,
        block: BlockInfo,
        data: Vec<u8>,
    },
    Hash {
        id: TorrentId,
        piece: PieceIndex,
    },
    MoveStorage {
        id: TorrentId,
        new_dir: PathBuf,
    },
    RenameFile {
        id: TorrentId,
        file: FileIndex,
        new_name: String,
    },
    ReleaseFiles {
        id: TorrentId,
    },
    DeleteFiles {
        id: TorrentId,
    },
    CheckFastresume {
        id: TorrentId,
        data: Box<ResumeData>,
    },
    SaveResumeData {
        id: TorrentId,
    },
    AbortTorrent {
        id: TorrentId,
    },
    ClearReadCache {
        id: TorrentId,
    },
    CachePiece {
        id: TorrentId,
        piece: PieceIndex,
    },
    FinalizeFile {
        id: TorrentId,
        file: FileIndex,
    },
    ClearPiece {
        id: TorrentId,
        piece: PieceIndex,
    },
    SyncPiece {
        id: TorrentId,
        piece: PieceIndex,
    },
    FlushPiece {
        id: TorrentId,
        piece: PieceIndex,
    },
    GetCacheInfo {
        id: Option<TorrentId>,
    },
    FileStatus {
        id: TorrentId,
    },
    ReclaimBlock {
        bref: BlockRef,
    },
    UpdateSettings(DiskConf),
    Shutdown,
}

/// The type of channel used to alert the engine about global events.
pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which the engine can listen for global disk events.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send about global events (i.e. events
/// not related to individual torrents).
#[derive(Debug)]
pub enum Alert {
    /// Torrent allocation result. If successful, the id of the allocated
    /// torrent is returned for identification, if not, the reason of the
    /// error is included.
    TorrentAllocation(
        std::result::Result<TorrentAllocation, NewTorrentError>,
    ),
    /// A cache wide metrics snapshot.
    CacheInfo(Box<CacheInfo>),
}

/// The result of successfully allocating a torrent.
#[derive(Debug)]
pub struct TorrentAllocation {
    /// The id of the torrent that has been allocated.
    pub id: TorrentId,
    /// The port on which torrent may receive alerts.
    pub alert_port: TorrentAlertReceiver,
}

/// The type of channel used to alert a torrent about torrent specific
/// events.
pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
/// The type of channel on which a torrent can listen for disk completions.
pub type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// The alerts that the disk task may send about events related to a
/// specific torrent. Every completion carries an error slot.
#[derive(Debug)]
pub enum TorrentAlert {
    /// A read finished, successfully or not. The buffer is zero-copy when
    /// the cache could lend the block.
    ReadCompleted {
        block: BlockInfo,
        result: std::result::Result<ReadBuf, JobError>,
    },
    /// A block previously queued for writing hit the disk (or failed to).
    BlockWritten {
        block: BlockInfo,
        result: std::result::Result<(), JobError>,
    },
    /// A piece hash completed.
    PieceHashed {
        piece: PieceIndex,
        result: std::result::Result<Sha1Hash, JobError>,
    },
    /// The torrent's files were moved to a new directory.
    StorageMoved(std::result::Result<(), JobError>),
    /// The torrent's file handles were closed.
    FilesReleased(std::result::Result<(), JobError>),
    /// The torrent's files were deleted.
    FilesDeleted(std::result::Result<(), JobError>),
    /// One file was renamed.
    FileRenamed {
        file: FileIndex,
        result: std::result::Result<(), JobError>,
    },
    /// One file was finalized.
    FileFinalized {
        file: FileIndex,
        result: std::result::Result<(), JobError>,
    },
    /// Resume data was checked against the on disk state.
    FastresumeChecked(std::result::Result<bool, JobError>),
    /// Resume data was captured.
    ResumeDataSaved(std::result::Result<Box<ResumeData>, JobError>),
    /// The open-file status of the torrent's files.
    FileStatus(std::result::Result<Vec<FileStatus>, JobError>),
    /// A sync point: everything submitted for the piece before this has
    /// settled.
    PieceSynced {
        piece: PieceIndex,
        result: std::result::Result<(), JobError>,
    },
    /// The piece's dirty blocks are on disk.
    PieceFlushed {
        piece: PieceIndex,
        result: std::result::Result<(), JobError>,
    },
    /// The piece's queued writes were cancelled and the piece evicted.
    PieceCleared { piece: PieceIndex },
    /// A piece prefetch finished.
    PieceCached {
        piece: PieceIndex,
        result: std::result::Result<(), JobError>,
    },
    /// The torrent's clean read blocks were dropped.
    ReadCacheCleared,
    /// The torrent's last cached piece is gone; the abort is complete.
    /// This is the final alert on this channel.
    TorrentAborted,
    /// A cache snapshot restricted to this torrent.
    CacheInfo(Box<CacheInfo>),
}

/// Whether a cached piece currently belongs to the write or the read side
/// of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachedPieceKind {
    Read,
    Write,
}

/// Information about one cached piece, as reported by cache info snapshots.
#[derive(Clone, Debug)]
pub struct CachedPieceInfo {
    pub piece: PieceIndex,
    pub kind: CachedPieceKind,
    /// Which blocks hold a buffer.
    pub blocks: Vec<bool>,
    pub num_dirty: usize,
    /// The next block the piece hash needs, when hashing is set up.
    pub next_to_hash: Option<usize>,
    pub need_readback: bool,
    /// Jobs currently waiting on this piece.
    pub num_jobs: usize,
}

/// A snapshot of the cache and scheduler counters.
#[derive(Clone, Debug)]
pub struct CacheInfo {
    pub stats: CacheStats,
    pub pieces: Vec<CachedPieceInfo>,
    /// Cumulative buffer allocations by category.
    pub allocations: HashMap<&'static str, u64>,
    /// Control blocks waiting to be issued.
    pub num_to_issue: usize,
    pub peak_num_to_issue: usize,
    /// Control blocks running on IO workers.
    pub num_in_progress: usize,
    pub peak_in_progress: usize,
    /// Jobs parked behind storage fences.
    pub num_blocked_jobs: usize,
    /// How many times the elevator changed direction.
    pub elevator_turns: u64,
    /// Bytes of dirty data handed to workers and not yet confirmed.
    pub pending_buffer_size: usize,
    /// Bytes of write payloads waiting in the job queue.
    pub queue_buffer_size: usize,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            block_len,
            storage::{AllocationMode, FileStorage},
            storage_info::{FileInfo, FsStructure},
            BLOCK_LEN,
        },
        sha1::{Digest, Sha1},
        std::{fs, path::PathBuf, time::Duration},
        tokio::time,
    };

    const ID: TorrentId = 0;
    const PIECE_LEN: u32 = 2 * BLOCK_LEN;
    // the last piece is slightly shorter to make sure short blocks are
    // handled
    const LAST_PIECE_LEN: u32 = 2 * BLOCK_LEN - 555;

    // The disk IO test environment containing a spawned disk task and a
    // two piece torrent backed by a real file.
    struct Env {
        join: task::JoinHandle<Result<()>>,
        disk: DiskHandle,
        alert_port: AlertReceiver,
        torrent: TorrentAlertReceiver,
        pieces: Vec<Vec<u8>>,
        storage: Arc<FileStorage>,
        dir: PathBuf,
    }

    impl Env {
        async fn new(name: &str, conf: DiskConf) -> Self {
            let dir = std::env::temp_dir()
                .join("torrent-disk-task-tests")
                .join(name);
            if dir.exists() {
                fs::remove_dir_all(&dir).ok();
            }

            let download_len = PIECE_LEN as u64 + LAST_PIECE_LEN as u64;
            let info = StorageInfo::new(
                2,
                PIECE_LEN,
                &dir,
                FsStructure::File(FileInfo {
                    path: PathBuf::from("data"),
                    torrent_offset: 0,
                    len: download_len,
                }),
            );
            let pieces: Vec<Vec<u8>> = vec![
                (0..PIECE_LEN).map(|b| (b % 251) as u8).collect(),
                (0..LAST_PIECE_LEN).map(|b| ((b + 7) % 251) as u8).collect(),
            ];
            let storage =
                Arc::new(FileStorage::new(info.clone(), AllocationMode::Sparse));

            let (join, disk, mut alert_port) =
                spawn(conf).expect("disk task spawns");
            disk.allocate_new_torrent(
                ID,
                Arc::clone(&storage) as Arc<dyn Storage>,
                info,
                false,
            )
            .expect("allocation command");

            let torrent = match recv_global(&mut alert_port).await {
                Alert::TorrentAllocation(Ok(allocation)) => {
                    assert_eq!(allocation.id, ID);
                    allocation.alert_port
                }
                _ => panic!("torrent could not be allocated"),
            };

            Self {
                join,
                disk,
                alert_port,
                torrent,
                pieces,
                storage,
                dir,
            }
        }

        fn piece_len(&self, piece: PieceIndex) -> u32 {
            if piece == 1 {
                LAST_PIECE_LEN
            } else {
                PIECE_LEN
            }
        }

        fn block(&self, piece: PieceIndex, index: usize) -> BlockInfo {
            BlockInfo {
                piece_index: piece,
                offset: index as u32 * BLOCK_LEN,
                len: block_len(self.piece_len(piece), index),
            }
        }

        fn block_data(&self, piece: PieceIndex, index: usize) -> Vec<u8> {
            let info = self.block(piece, index);
            let start = info.offset as usize;
            self.pieces[piece][start..start + info.len as usize].to_vec()
        }

        fn write_piece(&self, piece: PieceIndex) {
            for index in 0..crate::block_count(self.piece_len(piece)) {
                self.disk
                    .write_block(
                        ID,
                        self.block(piece, index),
                        self.block_data(piece, index),
                    )
                    .expect("write command");
            }
        }

        fn expected_hash(&self, piece: PieceIndex) -> Sha1Hash {
            let mut hasher = Sha1::new();
            hasher.update(&self.pieces[piece]);
            hasher.finalize().into()
        }

        async fn shutdown(mut self) {
            self.disk.shutdown().expect("shutdown command");
            let result = time::timeout(Duration::from_secs(10), self.join)
                .await
                .expect("disk task failed to shut down")
                .expect("disk task panicked");
            assert!(result.is_ok());
            // drain anything left so the channels don't complain
            while self.torrent.try_recv().is_ok() {}
            fs::remove_dir_all(&self.dir).ok();
        }
    }

    async fn recv_global(port: &mut AlertReceiver) -> Alert {
        time::timeout(Duration::from_secs(10), port.recv())
            .await
            .expect("timed out waiting for alert")
            .expect("alert channel closed")
    }

    async fn recv_alert(port: &mut TorrentAlertReceiver) -> TorrentAlert {
        time::timeout(Duration::from_secs(10), port.recv())
            .await
            .expect("timed out waiting for torrent alert")
            .expect("torrent alert channel closed")
    }

    // Writes a piece, flushes it, hashes it, and reads a block back from
    // the cache, exercising the whole write-flush-hash-read cycle.
    #[tokio::test]
    async fn test_write_flush_hash_read_roundtrip() {
        let mut env = Env::new("roundtrip", DiskConf::default()).await;

        env.write_piece(0);
        env.disk.flush_piece(ID, 0).expect("flush command");
        env.disk.hash_piece(ID, 0).expect("hash command");

        // collect alerts until the hash arrives; writes and the flush come
        // in completion order, hashing interleaves with them
        let mut written = 0;
        let mut flushed = false;
        let mut digest = None;
        while digest.is_none() || written < 2 || !flushed {
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::BlockWritten { result, .. } => {
                    result.expect("write should succeed");
                    written += 1;
                }
                TorrentAlert::PieceFlushed { piece, result } => {
                    assert_eq!(piece, 0);
                    result.expect("flush should succeed");
                    flushed = true;
                }
                TorrentAlert::PieceHashed { piece, result } => {
                    assert_eq!(piece, 0);
                    digest = Some(result.expect("hash should succeed"));
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        assert_eq!(written, 2);
        assert_eq!(digest.unwrap(), env.expected_hash(0));

        // the flushed blocks are still cached; an aligned single block read
        // is served zero-copy
        env.disk.read(ID, env.block(0, 0), false).expect("read command");
        match recv_alert(&mut env.torrent).await {
            TorrentAlert::ReadCompleted { block, result } => {
                assert_eq!(block, env.block(0, 0));
                let buf = result.expect("read should hit");
                assert_eq!(buf.as_slice(), &env.block_data(0, 0)[..]);
                match buf {
                    ReadBuf::Shared(bref) => {
                        env.disk.reclaim_block(bref).expect("reclaim")
                    }
                    ReadBuf::Copied(_) => {
                        panic!("aligned single block hit should be zero-copy")
                    }
                }
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.shutdown().await;
    }

    // A read of data that's on disk but not cached populates the cache
    // line and serves follow-up reads from memory.
    #[tokio::test]
    async fn test_read_miss_populates_cache() {
        let env_conf = DiskConf::default();
        let mut env = Env::new("read-miss", env_conf).await;

        // put piece 1 on disk behind the disk task's back
        env.storage
            .writev(&[bytes::Bytes::from(env.pieces[1].clone())], 1, 0)
            .expect("direct write");

        for round in 0..2 {
            env.disk.read(ID, env.block(1, 1), false).expect("read command");
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::ReadCompleted { block, result } => {
                    assert_eq!(block, env.block(1, 1));
                    let buf = result.expect("read should succeed");
                    assert_eq!(buf.as_slice(), &env.block_data(1, 1)[..]);
                    if let ReadBuf::Shared(bref) = buf {
                        env.disk.reclaim_block(bref).expect("reclaim");
                    }
                }
                other => panic!("round {}: unexpected alert: {:?}", round, other),
            }
        }

        env.shutdown().await;
    }

    // Hashing a piece that only exists on disk reads every block back in
    // and still produces the right digest.
    #[tokio::test]
    async fn test_hash_reads_back_uncached_piece() {
        let mut env = Env::new("hash-readback", DiskConf::default()).await;

        // the piece is on disk but nowhere in the cache
        env.storage
            .writev(&[bytes::Bytes::from(env.pieces[0].clone())], 0, 0)
            .expect("direct write");

        env.disk.hash_piece(ID, 0).expect("hash command");
        match recv_alert(&mut env.torrent).await {
            TorrentAlert::PieceHashed { piece, result } => {
                assert_eq!(piece, 0);
                assert_eq!(
                    result.expect("hash should succeed"),
                    env.expected_hash(0)
                );
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.shutdown().await;
    }

    // Deleting files aborts queued writes and refuses IO thereafter.
    #[tokio::test]
    async fn test_delete_files_aborts_queued_writes() {
        let mut conf = DiskConf::default();
        // keep the dirty blocks unflushed deterministically
        conf.disable_hash_checks = true;
        let mut env = Env::new("delete", conf).await;

        env.write_piece(0);
        env.disk.delete_files(ID).expect("delete command");

        let mut aborted_writes = 0;
        let mut deleted = false;
        while aborted_writes < 2 || !deleted {
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::BlockWritten { result, .. } => {
                    assert!(matches!(result, Err(JobError::Aborted)));
                    aborted_writes += 1;
                }
                TorrentAlert::FilesDeleted(result) => {
                    result.expect("delete should succeed");
                    deleted = true;
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        assert!(!env.dir.join("data").exists());

        // reads after the deletion are refused
        env.disk.read(ID, env.block(0, 0), false).expect("read command");
        match recv_alert(&mut env.torrent).await {
            TorrentAlert::ReadCompleted { result, .. } => {
                assert!(matches!(result, Err(JobError::Aborted)));
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.shutdown().await;
    }

    // A release-files with dirty data raises the fence: the flush runs
    // first, jobs submitted after the release wait behind it.
    #[tokio::test]
    async fn test_release_files_fences_later_jobs() {
        let mut conf = DiskConf::default();
        conf.disable_hash_checks = true;
        let mut env = Env::new("fence", conf).await;

        env.write_piece(0);
        env.disk.release_files(ID).expect("release command");
        // submitted while the fence is (about to be) up; must complete
        // only after the release
        env.disk.sync_piece(ID, 0).expect("sync command");

        let mut order = Vec::new();
        while order.len() < 4 {
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::BlockWritten { result, .. } => {
                    result.expect("write should succeed");
                    order.push("write");
                }
                TorrentAlert::FilesReleased(result) => {
                    result.expect("release should succeed");
                    order.push("release");
                }
                TorrentAlert::PieceSynced { result, .. } => {
                    result.expect("sync should succeed");
                    order.push("sync");
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        assert_eq!(order, vec!["write", "write", "release", "sync"]);

        // the data survived the forced flush
        env.disk.read(ID, env.block(0, 1), true).expect("read command");
        match recv_alert(&mut env.torrent).await {
            TorrentAlert::ReadCompleted { result, .. } => {
                let buf = result.expect("read should succeed");
                assert_eq!(buf.as_slice(), &env.block_data(0, 1)[..]);
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.shutdown().await;
    }

    // Resume data reflects flushed file contents.
    #[tokio::test]
    async fn test_save_and_check_resume_data() {
        let mut conf = DiskConf::default();
        conf.disable_hash_checks = true;
        let mut env = Env::new("resume", conf).await;

        env.write_piece(0);
        env.disk.flush_piece(ID, 0).expect("flush command");
        env.disk.save_resume_data(ID).expect("resume command");

        let mut resume = None;
        while resume.is_none() {
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::BlockWritten { result, .. } => {
                    result.expect("write should succeed");
                }
                TorrentAlert::PieceFlushed { result, .. } => {
                    result.expect("flush should succeed");
                }
                TorrentAlert::ResumeDataSaved(result) => {
                    resume = Some(result.expect("resume data should save"));
                }
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        let resume = resume.unwrap();
        assert_eq!(resume.files.len(), 1);
        assert_eq!(resume.files[0].len, PIECE_LEN as u64);

        // checking it right back succeeds
        env.disk
            .check_fastresume(ID, *resume)
            .expect("fastresume command");
        match recv_alert(&mut env.torrent).await {
            TorrentAlert::FastresumeChecked(result) => {
                assert!(result.expect("check should succeed"));
            }
            other => panic!("unexpected alert: {:?}", other),
        }

        env.shutdown().await;
    }

    // Aborting a torrent evicts its pieces and posts the final alert.
    #[tokio::test]
    async fn test_abort_torrent_drains_cache() {
        let mut conf = DiskConf::default();
        conf.disable_hash_checks = true;
        let mut env = Env::new("abort", conf).await;

        env.write_piece(0);
        env.disk.abort_torrent(ID).expect("abort command");

        let mut aborted = false;
        let mut written = 0;
        while !aborted {
            match recv_alert(&mut env.torrent).await {
                TorrentAlert::BlockWritten { result, .. } => {
                    // the abort first flushes dirty data
                    result.expect("write should succeed");
                    written += 1;
                }
                TorrentAlert::TorrentAborted => aborted = true,
                other => panic!("unexpected alert: {:?}", other),
            }
        }
        assert_eq!(written, 2);

        env.shutdown().await;
    }

    // Cache info reports the pieces and counters the other operations left
    // behind.
    #[tokio::test]
    async fn test_cache_info_snapshot() {
        let mut conf = DiskConf::default();
        conf.disable_hash_checks = true;
        let mut env = Env::new("cache-info", conf).await;

        env.write_piece(0);
        env.disk.cache_info(None).expect("cache info command");

        let info = match recv_global(&mut env.alert_port).await {
            Alert::CacheInfo(info) => info,
            other => panic!("unexpected alert: {:?}", other),
        };
        assert_eq!(info.stats.num_pieces, 1);
        assert_eq!(info.stats.write_cache_size, 2);
        assert_eq!(info.pieces.len(), 1);
        assert_eq!(info.pieces[0].kind, CachedPieceKind::Write);
        assert_eq!(info.pieces[0].num_dirty, 2);
        // both write jobs are still waiting for their flush
        assert_eq!(info.pieces[0].num_jobs, 2);

        env.shutdown().await;
    }
}
