//! The unit of work the disk task operates on.
//!
//! Every command the engine submits is turned into a [`Job`]. Jobs either
//! complete synchronously on the disk task, get attached to a cached piece
//! as waiters until the blocks they depend on settle, or are parked behind a
//! storage fence. Completion is always reported through an alert carrying a
//! [`JobOutput`] or a [`JobError`].

use std::{path::PathBuf, sync::Arc, time::Instant};

use bytes::Bytes;

use crate::{
    cache::{BlockRef, ReadBuf},
    conf::DiskConf,
    error::JobError,
    hasher::HashDone,
    storage::{ResumeData, Storage},
    storage_info::StorageInfo,
    BlockIndex, FileIndex, PieceIndex, Sha1Hash, TorrentId,
};

use super::io::IoComplete;

/// One unit of disk work.
pub(crate) struct Job {
    /// The torrent this job belongs to. Global jobs (settings updates,
    /// shutdown, cache wide info) carry `None`.
    pub torrent: Option<TorrentId>,
    pub kind: JobKind,
    /// When the job was submitted, used for queue time statistics.
    pub started: Instant,
    /// Whether the job is registered with its storage's fence accounting;
    /// set when it attaches to a piece or starts a bypass operation, and
    /// balanced by a fence release when its completion is posted.
    pub tracked: bool,
}

impl Job {
    pub fn new(torrent: Option<TorrentId>, kind: JobKind) -> Self {
        Self {
            torrent,
            kind,
            started: Instant::now(),
            tracked: false,
        }
    }

    /// Immediate jobs run synchronously on the disk task and are never
    /// parked behind a storage fence.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self.kind,
            JobKind::UpdateSettings { .. }
                | JobKind::GetCacheInfo
                | JobKind::FileStatus
                | JobKind::HashingDone(_)
                | JobKind::AcbComplete(_)
                | JobKind::TrimCache
                | JobKind::FinalizeFile { .. }
                | JobKind::CheckFastresume { .. }
                | JobKind::ReclaimBlock { .. }
                | JobKind::NewTorrent { .. }
                | JobKind::AbortThread
        )
    }

    /// Whether the job takes part in the fence's outstanding-job accounting
    /// once it attaches to a piece of its storage.
    pub fn is_async_operation(&self) -> bool {
        matches!(
            self.kind,
            JobKind::Read { .. }
                | JobKind::Write { .. }
                | JobKind::Hash { .. }
                | JobKind::CachePiece { .. }
                | JobKind::SyncPiece { .. }
                | JobKind::FlushPiece { .. }
        )
    }

    /// Jobs submitted ahead of the regular queue: block reclaims and cache
    /// trims want to free memory as soon as possible.
    pub fn is_high_priority(&self) -> bool {
        matches!(
            self.kind,
            JobKind::ReclaimBlock { .. }
                | JobKind::TrimCache
                | JobKind::HashingDone(_)
                | JobKind::AcbComplete(_)
        )
    }

    /// The piece the job targets, if it targets one.
    pub fn piece(&self) -> Option<PieceIndex> {
        match &self.kind {
            JobKind::Read { piece, .. }
            | JobKind::Write { piece, .. }
            | JobKind::Hash { piece, .. }
            | JobKind::CachePiece { piece }
            | JobKind::ClearPiece { piece }
            | JobKind::SyncPiece { piece }
            | JobKind::FlushPiece { piece } => Some(*piece),
            _ => None,
        }
    }

    /// The name of the job kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            JobKind::Read { .. } => "read",
            JobKind::Write { .. } => "write",
            JobKind::Hash { .. } => "hash",
            JobKind::MoveStorage { .. } => "move_storage",
            JobKind::ReleaseFiles => "release_files",
            JobKind::DeleteFiles => "delete_files",
            JobKind::CheckFastresume { .. } => "check_fastresume",
            JobKind::SaveResumeData => "save_resume_data",
            JobKind::RenameFile { .. } => "rename_file",
            JobKind::AbortThread => "abort_thread",
            JobKind::ClearReadCache => "clear_read_cache",
            JobKind::AbortTorrent => "abort_torrent",
            JobKind::UpdateSettings { .. } => "update_settings",
            JobKind::CachePiece { .. } => "cache_piece",
            JobKind::FinalizeFile { .. } => "finalize_file",
            JobKind::GetCacheInfo => "get_cache_info",
            JobKind::HashingDone(_) => "hashing_done",
            JobKind::FileStatus => "file_status",
            JobKind::ReclaimBlock { .. } => "reclaim_block",
            JobKind::ClearPiece { .. } => "clear_piece",
            JobKind::SyncPiece { .. } => "sync_piece",
            JobKind::FlushPiece { .. } => "flush_piece",
            JobKind::TrimCache => "trim_cache",
            JobKind::AcbComplete(_) => "aiocb_complete",
            JobKind::NewTorrent { .. } => "new_torrent",
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("torrent", &self.torrent)
            .field("kind", &self.kind_name())
            .field("started", &self.started)
            .field("tracked", &self.tracked)
            .finish()
    }
}

/// The job vocabulary of the disk task.
pub(crate) enum JobKind {
    /// Read a range no longer than a block from a piece.
    Read {
        piece: PieceIndex,
        offset: u32,
        len: u32,
        /// Always copy into a fresh buffer instead of lending a cache block.
        force_copy: bool,
    },
    /// Write one block to a piece. The buffer is taken when the block is
    /// installed into the cache (or handed to storage when caching is off).
    Write {
        piece: PieceIndex,
        offset: u32,
        len: u32,
        buf: Option<Bytes>,
    },
    /// Compute the piece's full hash, reading back any blocks no longer in
    /// cache.
    Hash {
        piece: PieceIndex,
        /// Drop the piece from the cache once the hash completes.
        volatile_read: bool,
        /// The first block this job still holds pinned. Advanced as hashed
        /// ranges are reaped.
        cursor: BlockIndex,
    },
    /// Move the torrent's files to a new directory. Fence raising.
    MoveStorage { new_dir: PathBuf },
    /// Close all file handles. Fence raising.
    ReleaseFiles,
    /// Delete all files. Fence raising.
    DeleteFiles,
    /// Verify resume data against on disk state.
    CheckFastresume { data: Box<ResumeData> },
    /// Capture resume data. Fence raising.
    SaveResumeData,
    /// Rename one file. Fence raising.
    RenameFile { file: FileIndex, new_name: String },
    /// Flush everything and wind the disk task down.
    AbortThread,
    /// Drop all clean read blocks of the torrent.
    ClearReadCache,
    /// Flush the torrent and complete once all its pieces are evicted.
    AbortTorrent,
    /// Apply a new configuration.
    UpdateSettings { conf: Box<DiskConf> },
    /// Prefetch a whole piece into the read cache.
    CachePiece { piece: PieceIndex },
    /// Tell storage the file's last piece has been written.
    FinalizeFile { file: FileIndex },
    /// Snapshot cache metrics (global when no torrent is given).
    GetCacheInfo,
    /// A hash worker finished a block range.
    HashingDone(HashDone),
    /// Report the open-file state of the torrent's storage.
    FileStatus,
    /// Return a zero-copy block lease.
    ReclaimBlock { bref: BlockRef },
    /// Cancel queued writes for the piece and evict it.
    ClearPiece { piece: PieceIndex },
    /// Complete once the piece has no outstanding operations.
    SyncPiece { piece: PieceIndex },
    /// Write out the piece's dirty blocks; complete once none remain.
    FlushPiece { piece: PieceIndex },
    /// Evict down to the cache limit. Posted by the pool's exceeded latch.
    TrimCache,
    /// A storage IO chain completed on a worker.
    AcbComplete(IoComplete),
    /// Register a torrent's storage with the disk task.
    NewTorrent {
        storage: Arc<dyn Storage>,
        info: StorageInfo,
        allocate_files: bool,
    },
}

/// What a successfully completed job hands back.
pub(crate) enum JobOutput {
    /// The read data, either copied or lent zero-copy from the cache.
    Read { piece: PieceIndex, offset: u32, buf: ReadBuf },
    /// The block was written (to cache and flushed, or straight to disk).
    Written { piece: PieceIndex, offset: u32, len: u32 },
    /// The piece's digest.
    Hashed { piece: PieceIndex, digest: Sha1Hash },
    /// Resume data captured by the storage.
    ResumeData(Box<ResumeData>),
    /// Resume data verification outcome.
    Fastresume(bool),
    /// Open-file status of the torrent's files.
    FileStatus(Vec<crate::storage::FileStatus>),
    /// A cache metrics snapshot.
    CacheInfo(Box<crate::disk::CacheInfo>),
    /// Completion without a payload (sync, flush, fence raisers, aborts).
    Done,
}

/// A job that has run its course, ready to be posted back to the engine.
pub(crate) struct Completion {
    pub job: Job,
    pub result: Result<JobOutput, JobError>,
}

impl Completion {
    pub fn ok(job: Job, output: JobOutput) -> Self {
        Self {
            job,
            result: Ok(output),
        }
    }

    pub fn failed(job: Job, error: JobError) -> Self {
        Self {
            job,
            result: Err(error),
        }
    }
}
