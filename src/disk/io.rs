//! The disk task: a single event loop that owns the block cache, the issue
//! queue, and all per torrent state.
//!
//! Commands from the engine, hash worker completions, and IO worker
//! completions all funnel into one job queue processed here. Blocking file
//! IO and hashing run on the runtime's blocking pool; everything else
//! happens on this task, so no cache field is ever touched from two threads.

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    bytes::Bytes,
    futures::{pin_mut, FutureExt},
    tokio::{
        sync::mpsc::{self, UnboundedReceiver},
        task, time,
    },
};

use super::{
    aio::{append_acbs, same_sign, Acb, AsyncHandler, HandlerId, HandlerKind},
    fence::Fence,
    job::{Completion, Job, JobKind, JobOutput},
    Alert, AlertSender, CacheInfo, CachedPieceInfo, CachedPieceKind, Command,
    CommandReceiver, TorrentAlert, TorrentAlertSender, TorrentAllocation,
};
use crate::{
    block_count,
    cache::{BlockCache, CacheState, ReadBuf, TryRead},
    conf::{CacheAlgorithm, DiskConf},
    error::{JobError, NewTorrentError, Result},
    hasher::{HashDone, Hasher, WorkerHasher},
    pool::BufferPool,
    storage::Storage,
    storage_info::StorageInfo,
    PieceIndex, PieceKey, TorrentId, BLOCK_LEN,
};

/// How often the loop wakes up on its own to flush expired write blocks.
const TICK: Duration = Duration::from_secs(5);

/// Flush the piece's dirty blocks to disk.
const FLUSH_WRITE: u8 = 1;
/// Drop the piece's clean blocks and mark it for deletion.
const FLUSH_READ: u8 = 2;
/// Throw away dirty data (failing its writers) and mark for deletion.
const FLUSH_DELETE: u8 = 4;

/// Posted by an IO worker when one control block finishes.
pub(crate) struct IoComplete {
    pub handler: HandlerId,
    /// The cache block the first returned buffer belongs to.
    pub first_block: usize,
    pub transferred: usize,
    pub error: Option<JobError>,
    /// The buffers of a read operation, filled on success. Writes carry
    /// nothing back.
    pub read_bufs: Option<Vec<Vec<u8>>>,
}

/// Everything the disk task keeps per torrent.
struct Torrent {
    storage: Arc<dyn Storage>,
    info: StorageInfo,
    fence: Fence,
    /// An abort-torrent job parked until the last cached piece is gone.
    abort_job: Option<Job>,
    /// Set once delete-files ran; subsequent IO is refused as aborted.
    files_deleted: bool,
    alert_chan: TorrentAlertSender,
}

/// What woke the event loop up.
enum Wake {
    Cmd(Option<Command>),
    Hash(Option<HashDone>),
    Io(Option<IoComplete>),
    Tick,
}

/// The entity responsible for all disk IO: it owns the block cache, turns
/// engine commands into jobs, schedules storage operations, and reports
/// completions back on the alert channels.
pub(super) struct Disk {
    conf: DiskConf,
    /// The resolved cache size in blocks.
    cache_size: usize,
    pool: Arc<BufferPool>,
    cache: BlockCache,
    hasher: WorkerHasher,
    torrents: HashMap<TorrentId, Torrent>,

    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Whether the command channel is still open.
    cmd_open: bool,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
    /// Ports for the blocking workers' completions.
    hash_done_port: UnboundedReceiver<HashDone>,
    io_done_port: UnboundedReceiver<IoComplete>,
    io_done_chan: mpsc::UnboundedSender<IoComplete>,

    /// Jobs waiting to be dispatched on this task.
    queued: VecDeque<Job>,
    /// Finished jobs to report back, drained every loop iteration.
    completed_jobs: Vec<Completion>,

    /// Control blocks awaiting submission, elevator ordered when the
    /// backend allows reordering.
    to_issue: VecDeque<Acb>,
    /// Control blocks running on workers.
    in_progress: usize,
    handlers: HashMap<HandlerId, AsyncHandler>,
    next_handler: HandlerId,

    /// Bytes of dirty data handed to workers and not yet confirmed.
    pending_buffer_size: usize,
    /// Bytes of write payloads sitting in the job queue.
    queue_buffer_size: usize,
    num_blocked_jobs: usize,
    peak_num_to_issue: usize,
    peak_in_progress: usize,

    elevator_direction: i8,
    elevator_turns: u64,
    last_phys_off: u64,

    last_expiry: Instant,
    abort: bool,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an
    /// alert receiver.
    pub(super) fn new(
        conf: DiskConf,
    ) -> Result<(Self, super::CommandSender, super::AlertReceiver)> {
        let physical_ram = physical_ram();
        let cache_size = conf.resolved_cache_size(physical_ram);
        log::info!(
            "Disk cache sized at {} blocks ({} MiB)",
            cache_size,
            cache_size * BLOCK_LEN as usize / (1024 * 1024)
        );
        // a disabled cache still needs buffers for in-flight bypass IO
        let pool_limit = cache_size.max(conf.aio_threads.max(1));
        let pool =
            Arc::new(BufferPool::new(BLOCK_LEN as usize, pool_limit));
        let cache = BlockCache::new(Arc::clone(&pool));

        let (hash_done_chan, hash_done_port) = mpsc::unbounded_channel();
        let hasher = WorkerHasher::new(conf.hashing_threads, hash_done_chan);
        let (io_done_chan, io_done_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                conf,
                cache_size,
                pool,
                cache,
                hasher,
                torrents: HashMap::new(),
                cmd_port,
                cmd_open: true,
                alert_chan,
                hash_done_port,
                io_done_port,
                io_done_chan,
                queued: VecDeque::new(),
                completed_jobs: Vec::new(),
                to_issue: VecDeque::new(),
                in_progress: 0,
                handlers: HashMap::new(),
                next_handler: 0,
                pending_buffer_size: 0,
                queue_buffer_size: 0,
                num_blocked_jobs: 0,
                peak_num_to_issue: 0,
                peak_in_progress: 0,
                elevator_direction: 1,
                elevator_turns: 0,
                last_phys_off: 0,
                last_expiry: Instant::now(),
                abort: false,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which runs until shutdown: an abort
    /// command (or the engine dropping its handle) followed by all
    /// outstanding work draining.
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        loop {
            if self.queued.is_empty() {
                let wake = self.wait_for_event().await;
                self.handle_wake(wake);
            }
            self.drain_channels();

            let mut jobs = mem::take(&mut self.queued);
            while let Some(job) = jobs.pop_front() {
                self.perform_async_job(job);
            }

            if self.last_expiry.elapsed() >= TICK {
                self.last_expiry = Instant::now();
                self.flush_expired_write_blocks();
            }
            if self.pool.take_exceeded() {
                // over the block budget: trim ahead of everything else
                self.queued.push_front(Job::new(None, JobKind::TrimCache));
            }

            self.issue_acbs();
            self.post_completed_jobs();

            #[cfg(debug_assertions)]
            self.cache.check_invariant();

            if self.should_exit() {
                break;
            }
        }

        // fail whatever stragglers remain and drain the cache
        self.cache.clear(&mut self.completed_jobs);
        self.post_completed_jobs();
        log::info!("Disk IO event loop shut down");
        Ok(())
    }

    fn should_exit(&self) -> bool {
        self.abort
            && self.in_progress == 0
            && self.to_issue.is_empty()
            && self.queued.is_empty()
            && self.completed_jobs.is_empty()
            && self.num_blocked_jobs == 0
            && self.hasher.num_pending_jobs() == 0
            // lent out blocks keep us alive so reclaims can come back, but
            // once the command channel is gone no reclaim ever will
            && (self.cache.stats().pinned_blocks == 0 || !self.cmd_open)
    }

    /// Blocks until a command, a worker completion, or the periodic tick.
    async fn wait_for_event(&mut self) -> Wake {
        if self.cmd_open {
            let cmd = self.cmd_port.recv().fuse();
            let hash = self.hash_done_port.recv().fuse();
            let io = self.io_done_port.recv().fuse();
            let tick = time::delay_for(TICK).fuse();
            pin_mut!(cmd, hash, io, tick);
            futures::select! {
                c = cmd => Wake::Cmd(c),
                d = hash => Wake::Hash(d),
                d = io => Wake::Io(d),
                _ = tick => Wake::Tick,
            }
        } else {
            let hash = self.hash_done_port.recv().fuse();
            let io = self.io_done_port.recv().fuse();
            let tick = time::delay_for(TICK).fuse();
            pin_mut!(hash, io, tick);
            futures::select! {
                d = hash => Wake::Hash(d),
                d = io => Wake::Io(d),
                _ = tick => Wake::Tick,
            }
        }
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Cmd(Some(cmd)) => self.enqueue_command(cmd),
            Wake::Cmd(None) => {
                // the engine dropped its handle: flush and wind down
                log::info!("Disk command channel closed, shutting down");
                self.cmd_open = false;
                self.queued
                    .push_back(Job::new(None, JobKind::AbortThread));
            }
            Wake::Hash(Some(done)) => self
                .queued
                .push_back(Job::new(None, JobKind::HashingDone(done))),
            Wake::Io(Some(done)) => self
                .queued
                .push_back(Job::new(None, JobKind::AcbComplete(done))),
            // we hold a sender half of both worker channels, so they never
            // close on their own
            Wake::Hash(None) | Wake::Io(None) => debug_assert!(false),
            Wake::Tick => {}
        }
    }

    /// Moves everything already sitting in the channels into the job queue
    /// without blocking.
    fn drain_channels(&mut self) {
        while let Ok(done) = self.io_done_port.try_recv() {
            self.queued
                .push_back(Job::new(None, JobKind::AcbComplete(done)));
        }
        while let Ok(done) = self.hash_done_port.try_recv() {
            self.queued
                .push_back(Job::new(None, JobKind::HashingDone(done)));
        }
        if self.cmd_open {
            while let Ok(cmd) = self.cmd_port.try_recv() {
                self.enqueue_command(cmd);
            }
        }
    }

    /// Turns an engine command into a job, with write payloads accounted
    /// against the queue size and urgent jobs going to the front.
    fn enqueue_command(&mut self, cmd: Command) {
        let job = match cmd {
            Command::NewTorrent {
                id,
                storage,
                info,
                allocate_files,
            } => Job::new(
                Some(id),
                JobKind::NewTorrent {
                    storage,
                    info,
                    allocate_files,
                },
            ),
            Command::Read {
                id,
                block,
                force_copy,
            } => Job::new(
                Some(id),
                JobKind::Read {
                    piece: block.piece_index,
                    offset: block.offset,
                    len: block.len,
                    force_copy,
                },
            ),
            Command::Write { id, block, data } => {
                debug_assert_eq!(data.len(), block.len as usize);
                self.queue_buffer_size += data.len();
                Job::new(
                    Some(id),
                    JobKind::Write {
                        piece: block.piece_index,
                        offset: block.offset,
                        len: block.len,
                        buf: Some(Bytes::from(data)),
                    },
                )
            }
            Command::Hash { id, piece } => Job::new(
                Some(id),
                JobKind::Hash {
                    piece,
                    volatile_read: self.conf.volatile_read_cache,
                    cursor: 0,
                },
            ),
            Command::MoveStorage { id, new_dir } => {
                Job::new(Some(id), JobKind::MoveStorage { new_dir })
            }
            Command::RenameFile { id, file, new_name } => {
                Job::new(Some(id), JobKind::RenameFile { file, new_name })
            }
            Command::ReleaseFiles { id } => {
                Job::new(Some(id), JobKind::ReleaseFiles)
            }
            Command::DeleteFiles { id } => {
                Job::new(Some(id), JobKind::DeleteFiles)
            }
            Command::CheckFastresume { id, data } => {
                Job::new(Some(id), JobKind::CheckFastresume { data })
            }
            Command::SaveResumeData { id } => {
                Job::new(Some(id), JobKind::SaveResumeData)
            }
            Command::AbortTorrent { id } => {
                Job::new(Some(id), JobKind::AbortTorrent)
            }
            Command::ClearReadCache { id } => {
                Job::new(Some(id), JobKind::ClearReadCache)
            }
            Command::CachePiece { id, piece } => {
                Job::new(Some(id), JobKind::CachePiece { piece })
            }
            Command::FinalizeFile { id, file } => {
                Job::new(Some(id), JobKind::FinalizeFile { file })
            }
            Command::ClearPiece { id, piece } => {
                Job::new(Some(id), JobKind::ClearPiece { piece })
            }
            Command::SyncPiece { id, piece } => {
                Job::new(Some(id), JobKind::SyncPiece { piece })
            }
            Command::FlushPiece { id, piece } => {
                Job::new(Some(id), JobKind::FlushPiece { piece })
            }
            Command::GetCacheInfo { id } => {
                Job::new(id, JobKind::GetCacheInfo)
            }
            Command::FileStatus { id } => {
                Job::new(Some(id), JobKind::FileStatus)
            }
            Command::ReclaimBlock { bref } => {
                Job::new(Some(bref.torrent), JobKind::ReclaimBlock { bref })
            }
            Command::UpdateSettings(conf) => Job::new(
                None,
                JobKind::UpdateSettings {
                    conf: Box::new(conf),
                },
            ),
            Command::Shutdown => Job::new(None, JobKind::AbortThread),
        };
        if job.is_high_priority() {
            self.queued.push_front(job);
        } else {
            self.queued.push_back(job);
        }
    }

    // ------------------- job dispatch -------------------

    fn perform_async_job(&mut self, mut job: Job) {
        // relieve cache pressure before taking on more work
        let evict = self.pool.over_limit(0);
        if evict > 0 {
            let left = self.cache.try_evict_blocks(evict, None);
            if left > 0 && !self.conf.dont_flush_write_cache {
                self.try_flush_write_blocks(left);
            }
        }

        log::trace!(
            "Disk job: {} (queued for {:?})",
            job.kind_name(),
            job.started.elapsed()
        );

        // is the fence up for this job's storage? immediate jobs pass
        if !job.is_immediate() {
            if let Some(id) = job.torrent {
                if let Some(torrent) = self.torrents.get_mut(&id) {
                    if torrent.fence.has_fence() {
                        match torrent.fence.is_blocked(job) {
                            None => {
                                self.num_blocked_jobs += 1;
                                log::debug!(
                                    "Job blocked by fence on torrent {} \
                                     ({} total blocked)",
                                    id,
                                    self.num_blocked_jobs
                                );
                                return;
                            }
                            Some(unblocked) => job = unblocked,
                        }
                    }
                }
            }
        }

        match job.kind {
            JobKind::Read { .. } => self.do_read(job),
            JobKind::Write { .. } => self.do_write(job),
            JobKind::Hash { .. } => self.do_hash(job),
            JobKind::MoveStorage { .. } => self.do_move_storage(job),
            JobKind::ReleaseFiles => self.do_release_files(job),
            JobKind::DeleteFiles => self.do_delete_files(job),
            JobKind::CheckFastresume { .. } => self.do_check_fastresume(job),
            JobKind::SaveResumeData => self.do_save_resume_data(job),
            JobKind::RenameFile { .. } => self.do_rename_file(job),
            JobKind::AbortThread => self.do_abort_thread(),
            JobKind::ClearReadCache => self.do_clear_read_cache(job),
            JobKind::AbortTorrent => self.do_abort_torrent(job),
            JobKind::UpdateSettings { .. } => self.do_update_settings(job),
            JobKind::CachePiece { .. } => self.do_cache_piece(job),
            JobKind::FinalizeFile { .. } => self.do_finalize_file(job),
            JobKind::GetCacheInfo => self.do_get_cache_info(job),
            JobKind::HashingDone(_) => self.do_hashing_done(job),
            JobKind::FileStatus => self.do_file_status(job),
            JobKind::ReclaimBlock { .. } => self.do_reclaim_block(job),
            JobKind::ClearPiece { .. } => self.do_clear_piece(job),
            JobKind::SyncPiece { .. } => self.do_sync_piece(job),
            JobKind::FlushPiece { .. } => self.do_flush_piece(job),
            JobKind::TrimCache => self.do_trim_cache(),
            JobKind::AcbComplete(_) => self.do_aiocb_complete(job),
            JobKind::NewTorrent { .. } => self.do_new_torrent(job),
        }
    }

    fn complete(&mut self, job: Job, result: std::result::Result<JobOutput, JobError>) {
        self.completed_jobs.push(Completion { job, result });
    }

    /// Registers a job (or IO chain) with its storage's fence accounting.
    fn track(&mut self, id: TorrentId) {
        if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.fence.new_job();
        }
    }

    /// The torrent and piece length for a job, or `None` (with a completed
    /// error) when the torrent is unknown, deleted, or the piece is out of
    /// bounds.
    fn checked_piece(
        &mut self,
        job: &Job,
        piece: PieceIndex,
    ) -> Option<(TorrentId, u32)> {
        let id = job.torrent?;
        let torrent = match self.torrents.get(&id) {
            Some(torrent) => torrent,
            None => {
                log::warn!("Job for unknown torrent {}", id);
                return None;
            }
        };
        if torrent.files_deleted {
            return None;
        }
        match torrent.info.piece_len(piece) {
            Ok(len) => Some((id, len)),
            Err(e) => {
                log::warn!("{} for torrent {}", e, id);
                None
            }
        }
    }

    fn do_new_torrent(&mut self, job: Job) {
        let id = job.torrent.expect("new torrent carries an id");
        let (storage, info, allocate_files) = match job.kind {
            JobKind::NewTorrent {
                storage,
                info,
                allocate_files,
            } => (storage, info, allocate_files),
            _ => unreachable!(),
        };
        if self.torrents.contains_key(&id) {
            log::warn!("Torrent {} already allocated", id);
            let _ = self.alert_chan.send(Alert::TorrentAllocation(Err(
                NewTorrentError::AlreadyExists,
            )));
            return;
        }

        // NOTE: do _not_ propagate failure, we don't want to kill the disk
        // task due to IO errors: log it and notify the engine
        if let Err(e) = storage.initialize(allocate_files) {
            log::warn!("Torrent {} allocation failure: {}", id, e);
            let _ = self
                .alert_chan
                .send(Alert::TorrentAllocation(Err(e.into())));
            return;
        }

        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        self.torrents.insert(
            id,
            Torrent {
                storage,
                info,
                fence: Fence::new(),
                abort_job: None,
                files_deleted: false,
                alert_chan,
            },
        );
        self.cache.add_torrent(id);
        log::info!("Torrent {} successfully allocated", id);
        let _ = self.alert_chan.send(Alert::TorrentAllocation(Ok(
            TorrentAllocation { id, alert_port },
        )));
    }

    fn do_read(&mut self, mut job: Job) {
        let (piece, offset, len, force_copy) = match &job.kind {
            JobKind::Read {
                piece,
                offset,
                len,
                force_copy,
            } => (*piece, *offset, *len, *force_copy),
            _ => unreachable!(),
        };
        debug_assert!(len > 0 && len <= BLOCK_LEN);

        let (id, piece_len) = match self.checked_piece(&job, piece) {
            Some(ok) => ok,
            None => return self.complete(job, Err(JobError::Aborted)),
        };
        let key: PieceKey = (id, piece);

        if self.cache_size > 0 && self.conf.use_read_cache {
            match self.cache.try_read(key, offset, len, force_copy) {
                TryRead::Hit(buf) => {
                    log::trace!("Read hit on piece {} of torrent {}", piece, id);
                    return self.complete(
                        job,
                        Ok(JobOutput::Read { piece, offset, buf }),
                    );
                }
                TryRead::NoMemory => {
                    return self.complete(job, Err(JobError::NoMemory))
                }
                TryRead::Miss => {}
            }

            // cache the read line, unless we're using an explicit cache
            if !self.conf.explicit_read_cache {
                self.cache.allocate_piece(key, piece_len, CacheState::ReadLru1);
                let start = (offset / BLOCK_LEN) as usize;
                let end = (start + self.conf.read_cache_line_size)
                    .min(block_count(piece_len));
                job.tracked = true;
                match self.cache.allocate_pending(key, start, end, job, 0, true)
                {
                    Ok(staged) => {
                        self.track(id);
                        log::trace!(
                            "Read miss on piece {}: staged {} blocks",
                            piece,
                            staged
                        );
                        // zero staged blocks means the same range is
                        // already on its way for somebody else
                        if staged > 0 {
                            self.io_range(key, start, end, false);
                        }
                        return;
                    }
                    Err((mut job, crate::cache::PendingError::NoMemory)) => {
                        self.cache.mark_for_deletion(key);
                        job.tracked = false;
                        return self.complete(job, Err(JobError::NoMemory));
                    }
                    Err((mut job, crate::cache::PendingError::NoSpace)) => {
                        // no room to cache the line; read around the cache
                        self.cache.mark_for_deletion(key);
                        job.tracked = false;
                        return self.read_bypass(id, job, piece, offset, len);
                    }
                }
            }
        }

        self.read_bypass(id, job, piece, offset, len)
    }

    /// Issues a read straight to storage, without populating the cache.
    fn read_bypass(
        &mut self,
        id: TorrentId,
        mut job: Job,
        piece: PieceIndex,
        offset: u32,
        len: u32,
    ) {
        let mut buf = match self.pool.allocate("send buffer") {
            Some(buf) => buf,
            None => return self.complete(job, Err(JobError::NoMemory)),
        };
        buf.truncate(len as usize);

        job.tracked = true;
        self.track(id);
        let storage =
            Arc::clone(&self.torrents.get(&id).expect("checked above").storage);
        let handler =
            self.alloc_handler(1, HandlerKind::BypassRead { job });
        let acb = Acb::read(storage, id, piece, 0, offset, vec![buf], handler);
        self.enqueue_acbs(vec![acb]);
    }

    fn do_write(&mut self, mut job: Job) {
        let (piece, offset, len) = match &job.kind {
            JobKind::Write {
                piece, offset, len, ..
            } => (*piece, *offset, *len),
            _ => unreachable!(),
        };
        debug_assert!(len > 0 && len <= BLOCK_LEN);
        debug_assert!(self.queue_buffer_size >= len as usize);
        self.queue_buffer_size -= len as usize;

        let buf = match &mut job.kind {
            JobKind::Write { buf, .. } => buf.take().expect("write payload"),
            _ => unreachable!(),
        };

        let (id, piece_len) = match self.checked_piece(&job, piece) {
            Some(ok) => ok,
            None => return self.complete(job, Err(JobError::Aborted)),
        };
        let key: PieceKey = (id, piece);

        if self.cache_size > 0 {
            let block = (offset / BLOCK_LEN) as usize;
            // the payload was allocated by the network layer; it now counts
            // against the cache budget
            self.pool.adopt();
            job.tracked = true;
            self.track(id);
            let mut out = mem::take(&mut self.completed_jobs);
            self.cache.add_dirty_block(
                key,
                piece_len,
                block,
                buf,
                job,
                &self.hasher,
                &mut out,
            );
            if !self.conf.disable_hash_checks {
                self.cache.ensure_hash_state(key);
                self.cache.kick_hasher(key, &self.hasher, &mut out);
            }
            self.completed_jobs = out;

            // flush the piece in case it satisfies the write-back condition
            match self.conf.disk_cache_algorithm {
                CacheAlgorithm::AvoidReadback => {
                    self.try_flush_hashed(key, self.conf.write_cache_line_size);
                }
                CacheAlgorithm::LargestContiguous => {
                    self.try_flush_contiguous(
                        key,
                        self.conf.write_cache_line_size,
                        usize::MAX,
                    );
                }
            }

            // if the cache is over budget, evict reads; failing that, flush
            // more dirty blocks. The dirty bytes already on their way to
            // disk are deducted so we don't overreact to in-flight writes.
            let pending_blocks = (self.pending_buffer_size
                + BLOCK_LEN as usize
                - 1)
                / BLOCK_LEN as usize;
            let in_use = self.pool.in_use();
            if self.cache_size <= in_use.saturating_sub(pending_blocks) {
                let left = in_use - self.cache_size;
                let left = self.cache.try_evict_blocks(left, None);
                if left > 0 && !self.conf.dont_flush_write_cache {
                    self.try_flush_write_blocks(left);
                }
            }
            return;
        }

        // no cache: write straight through
        self.pending_buffer_size += len as usize;
        job.tracked = true;
        self.track(id);
        let storage =
            Arc::clone(&self.torrents.get(&id).expect("checked above").storage);
        let handler = self.alloc_handler(
            1,
            HandlerKind::BypassWrite {
                job,
                bytes: len as usize,
            },
        );
        let acb =
            Acb::write(storage, id, piece, 0, offset, vec![buf], handler);
        self.enqueue_acbs(vec![acb]);
    }

    fn do_hash(&mut self, mut job: Job) {
        let (piece, volatile_read) = match &job.kind {
            JobKind::Hash {
                piece,
                volatile_read,
                ..
            } => (*piece, *volatile_read),
            _ => unreachable!(),
        };

        if self.conf.disable_hash_checks {
            return self.complete(
                job,
                Ok(JobOutput::Hashed {
                    piece,
                    digest: [0; 20],
                }),
            );
        }

        let (id, piece_len) = match self.checked_piece(&job, piece) {
            Some(ok) => ok,
            None => return self.complete(job, Err(JobError::Aborted)),
        };
        let key: PieceKey = (id, piece);
        let blocks_in_piece = block_count(piece_len);

        if !self.cache.contains(&key) {
            self.cache.allocate_piece(key, piece_len, CacheState::ReadLru1);
        }
        self.cache.ensure_hash_state(key);

        // everything may already be hashed, in which case there's nothing
        // to wait for
        if let Some(digest) = self.cache.take_finished_hash(key, volatile_read)
        {
            let mut out = mem::take(&mut self.completed_jobs);
            self.cache.maybe_free_piece(key, &mut out);
            self.completed_jobs = out;
            return self.complete(job, Ok(JobOutput::Hashed { piece, digest }));
        }

        let entry = self.cache.entry(&key).expect("allocated above");
        let start_block = entry.hashing.unwrap_or_else(|| entry.hash_cursor());
        // the blocks this job will hold pinned until they're hashed
        if let JobKind::Hash { cursor, .. } = &mut job.kind {
            *cursor = start_block;
        }

        // schedule read-back for blocks that are neither cached nor on
        // their way
        let first_missing = (start_block..blocks_in_piece).find(|i| {
            let block = &entry.blocks[*i];
            !block.has_buf() && !block.pending
        });
        job.tracked = true;
        let mut need_read = false;
        match first_missing {
            Some(missing) => {
                match self.cache.allocate_pending(
                    key,
                    missing,
                    blocks_in_piece,
                    job,
                    2,
                    false,
                ) {
                    Ok(staged) => {
                        self.track(id);
                        need_read = staged > 0;
                        if need_read {
                            log::debug!(
                                "Hash read-back of piece {}: {} blocks",
                                piece,
                                staged
                            );
                        }
                    }
                    Err((mut job, _)) => {
                        self.cache.mark_for_deletion(key);
                        job.tracked = false;
                        return self.complete(job, Err(JobError::NoMemory));
                    }
                }
            }
            None => {
                self.track(id);
                self.cache.attach_job(key, job);
            }
        }

        // pin everything the hash still needs so eviction keeps its hands
        // off, then get the pipeline going
        self.cache.pin_blocks(key, start_block, blocks_in_piece);
        let mut out = mem::take(&mut self.completed_jobs);
        self.cache.kick_hasher(key, &self.hasher, &mut out);
        self.completed_jobs = out;

        if need_read {
            self.io_range(key, start_block, blocks_in_piece, false);
        }
    }

    fn do_move_storage(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let outstanding = self.flush_cache(id, FLUSH_WRITE);
        if outstanding > 0 {
            return self.raise_fence(id, job);
        }
        let new_dir = match &job.kind {
            JobKind::MoveStorage { new_dir } => new_dir.clone(),
            _ => unreachable!(),
        };
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .move_storage(&new_dir)
            .map(|_| JobOutput::Done)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_release_files(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let outstanding = self.flush_cache(id, FLUSH_WRITE);
        if outstanding > 0 {
            return self.raise_fence(id, job);
        }
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .release_files()
            .map(|_| JobOutput::Done)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_delete_files(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let outstanding = self.flush_cache(id, FLUSH_DELETE);
        if outstanding > 0 {
            return self.raise_fence(id, job);
        }
        let torrent = self.torrents.get_mut(&id).expect("checked above");
        torrent.files_deleted = true;
        let result = torrent
            .storage
            .delete_files()
            .map(|_| JobOutput::Done)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_save_resume_data(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let outstanding = self.flush_cache(id, FLUSH_WRITE);
        if outstanding > 0 {
            return self.raise_fence(id, job);
        }
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .write_resume_data()
            .map(|data| JobOutput::ResumeData(Box::new(data)))
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_rename_file(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let outstanding = self.flush_cache(id, FLUSH_WRITE);
        if outstanding > 0 {
            return self.raise_fence(id, job);
        }
        let (file, new_name) = match &job.kind {
            JobKind::RenameFile { file, new_name } => {
                (*file, new_name.clone())
            }
            _ => unreachable!(),
        };
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .rename_file(file, &new_name)
            .map(|_| JobOutput::Done)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_check_fastresume(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let data = match &job.kind {
            JobKind::CheckFastresume { data } => data,
            _ => unreachable!(),
        };
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .verify_resume_data(data)
            .map(JobOutput::Fastresume)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_abort_thread(&mut self) {
        // issue write commands for all dirty blocks and drop read caches
        let ids: Vec<TorrentId> = self.torrents.keys().copied().collect();
        for id in ids {
            self.flush_cache(id, FLUSH_READ | FLUSH_WRITE);
        }
        self.abort = true;
    }

    fn do_clear_read_cache(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        self.flush_cache(id, FLUSH_READ);
        self.complete(job, Ok(JobOutput::Done));
    }

    fn do_abort_torrent(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        // issue write commands for all dirty blocks and clear read caches
        self.flush_cache(id, FLUSH_READ | FLUSH_WRITE);

        if self.cache.num_storage_pieces(id) == 0 {
            return self.finish_abort(id);
        }
        // some pieces are still pinned by in-flight work; the job completes
        // when the last one is evicted
        let torrent = self.torrents.get_mut(&id).expect("checked above");
        debug_assert!(torrent.abort_job.is_none());
        torrent.abort_job = Some(job);
    }

    /// Completes an abort-torrent: posts the alert and drops the torrent's
    /// state. Any job still parked behind its fence is failed.
    fn finish_abort(&mut self, id: TorrentId) {
        log::info!("Torrent {} aborted", id);
        if let Some(mut torrent) = self.torrents.remove(&id) {
            let _ = torrent.alert_chan.send(TorrentAlert::TorrentAborted);
            for blocked in torrent.fence.drain() {
                debug_assert!(self.num_blocked_jobs > 0);
                self.num_blocked_jobs -= 1;
                self.complete(blocked, Err(JobError::Aborted));
            }
        }
        self.cache.remove_torrent(id);
    }

    fn do_update_settings(&mut self, job: Job) {
        let conf = match job.kind {
            JobKind::UpdateSettings { conf } => *conf,
            _ => unreachable!(),
        };
        let cache_size = conf.resolved_cache_size(physical_ram());
        log::info!(
            "Applying new disk settings (cache: {} blocks)",
            cache_size
        );
        if self.conf.hashing_threads != conf.hashing_threads {
            self.hasher.set_num_threads(conf.hashing_threads);
        }
        self.conf = conf;
        self.cache_size = cache_size;
        self.pool
            .set_limit(cache_size.max(self.conf.aio_threads.max(1)));
        self.cache.set_cache_size(cache_size);

        // deduct in-flight writes, otherwise we'd flush the entire cache as
        // soon as we exceed the limit
        let pending_blocks = (self.pending_buffer_size + BLOCK_LEN as usize
            - 1)
            / BLOCK_LEN as usize;
        let in_use = self.pool.in_use();
        if in_use.saturating_sub(pending_blocks) > cache_size {
            self.cache.try_evict_blocks(in_use - cache_size, None);
        }
    }

    fn do_cache_piece(&mut self, mut job: Job) {
        let piece = match &job.kind {
            JobKind::CachePiece { piece } => *piece,
            _ => unreachable!(),
        };
        let (id, piece_len) = match self.checked_piece(&job, piece) {
            Some(ok) => ok,
            None => return self.complete(job, Err(JobError::Aborted)),
        };
        if self.cache_size == 0 {
            return self.complete(job, Err(JobError::NoMemory));
        }
        let key: PieceKey = (id, piece);
        self.cache.allocate_piece(key, piece_len, CacheState::ReadLru1);

        let blocks_in_piece = block_count(piece_len);
        let entry = self.cache.entry(&key).expect("allocated above");
        if entry.blocks.iter().all(|b| b.bytes().is_some()) {
            // the whole piece is already in the cache
            return self.complete(job, Ok(JobOutput::Done));
        }

        job.tracked = true;
        match self.cache.allocate_pending(key, 0, blocks_in_piece, job, 0, false)
        {
            Ok(staged) => {
                self.track(id);
                if staged > 0 {
                    self.io_range(key, 0, blocks_in_piece, false);
                }
            }
            Err((mut job, _)) => {
                job.tracked = false;
                self.complete(job, Err(JobError::NoMemory));
            }
        }
    }

    fn do_finalize_file(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let file = match &job.kind {
            JobKind::FinalizeFile { file } => *file,
            _ => unreachable!(),
        };
        let torrent = self.torrents.get(&id).expect("checked above");
        let result = torrent
            .storage
            .finalize_file(file)
            .map(|_| JobOutput::Done)
            .map_err(JobError::from);
        self.complete(job, result);
    }

    fn do_get_cache_info(&mut self, job: Job) {
        let info = self.build_cache_info(job.torrent);
        self.complete(job, Ok(JobOutput::CacheInfo(Box::new(info))));
    }

    fn do_hashing_done(&mut self, job: Job) {
        let done = match job.kind {
            JobKind::HashingDone(done) => done,
            _ => unreachable!(),
        };
        self.hasher.hash_job_done();
        let mut out = mem::take(&mut self.completed_jobs);
        self.cache.hashing_done(done, &self.hasher, &mut out);
        self.completed_jobs = out;
    }

    fn do_file_status(&mut self, job: Job) {
        let id = match job.torrent {
            Some(id) if self.torrents.contains_key(&id) => id,
            _ => return self.complete(job, Err(JobError::Aborted)),
        };
        let torrent = self.torrents.get(&id).expect("checked above");
        let status = torrent.storage.file_status();
        self.complete(job, Ok(JobOutput::FileStatus(status)));
    }

    fn do_reclaim_block(&mut self, job: Job) {
        let bref = match job.kind {
            JobKind::ReclaimBlock { bref } => bref,
            _ => unreachable!(),
        };
        let mut out = mem::take(&mut self.completed_jobs);
        self.cache.reclaim_block(bref, &mut out);
        self.completed_jobs = out;
    }

    fn do_clear_piece(&mut self, job: Job) {
        let piece = match &job.kind {
            JobKind::ClearPiece { piece } => *piece,
            _ => unreachable!(),
        };
        let id = match job.torrent {
            Some(id) => id,
            None => return,
        };
        let mut out = mem::take(&mut self.completed_jobs);
        self.cache.clear_piece((id, piece), &mut out);
        self.completed_jobs = out;
        self.complete(job, Ok(JobOutput::Done));
    }

    fn do_sync_piece(&mut self, mut job: Job) {
        let piece = match &job.kind {
            JobKind::SyncPiece { piece } => *piece,
            _ => unreachable!(),
        };
        let id = match job.torrent {
            Some(id) => id,
            None => return,
        };
        let key: PieceKey = (id, piece);
        let has_jobs = self
            .cache
            .entry(&key)
            .map_or(false, |entry| !entry.jobs.is_empty());
        if !has_jobs {
            return self.complete(job, Ok(JobOutput::Done));
        }
        job.tracked = true;
        self.track(id);
        self.cache.attach_job(key, job);
    }

    fn do_flush_piece(&mut self, mut job: Job) {
        let piece = match &job.kind {
            JobKind::FlushPiece { piece } => *piece,
            _ => unreachable!(),
        };
        let id = match job.torrent {
            Some(id) => id,
            None => return,
        };
        let key: PieceKey = (id, piece);
        let num_dirty =
            self.cache.entry(&key).map(|e| e.num_dirty).unwrap_or(0);
        if num_dirty == 0 {
            return self.complete(job, Ok(JobOutput::Done));
        }
        log::debug!(
            "Flushing {} dirty blocks of piece {}",
            num_dirty,
            piece
        );
        self.io_range(key, 0, usize::MAX, true);
        // completes when the last dirty block settles
        job.tracked = true;
        self.track(id);
        self.cache.attach_job(key, job);
    }

    fn do_trim_cache(&mut self) {
        let over = self.pool.over_limit(0);
        if over == 0 {
            return;
        }
        let left = self.cache.try_evict_blocks(over, None);
        if left > 0 && !self.conf.dont_flush_write_cache {
            self.try_flush_write_blocks(left);
        }
    }

    // ------------------- write-back -------------------

    /// Flushes dirty runs of at least `cont_block` contiguous blocks,
    /// stopping once `num` blocks were put on their way.
    fn try_flush_contiguous(
        &mut self,
        key: PieceKey,
        cont_block: usize,
        num: usize,
    ) -> usize {
        let (runs, hash_pos) = {
            let entry = match self.cache.entry(&key) {
                Some(entry) => entry,
                None => return 0,
            };
            let mut runs = Vec::new();
            let mut start = None;
            for (i, block) in entry.blocks.iter().enumerate() {
                if block.dirty && !block.pending {
                    start.get_or_insert(i);
                } else if let Some(s) = start.take() {
                    runs.push((s, i));
                }
            }
            if let Some(s) = start {
                runs.push((s, entry.blocks_in_piece()));
            }
            (runs, entry.hash_cursor())
        };

        let cont_block = cont_block.max(1);
        let mut flushed = 0;
        for (start, end) in runs {
            if end - start < cont_block {
                continue;
            }
            if start > hash_pos {
                // flushing blocks we'll need to read back when hashing
                self.cache.set_need_readback(key);
            }
            flushed += self.io_range(key, start, end, true);
            if flushed >= num {
                break;
            }
        }
        flushed
    }

    /// Flushes the dirty prefix already covered by the piece's hash, so no
    /// flushed block has to be read back for hashing.
    fn try_flush_hashed(&mut self, key: PieceKey, cont_block: usize) -> usize {
        let (mut end, num_dirty_below, blocks_in_piece, need_readback) = {
            let entry = match self.cache.entry(&key) {
                Some(entry) => entry,
                None => return 0,
            };
            if entry.hash.is_none() {
                log::trace!("Not flushing piece {}: no hash state", key.1);
                return 0;
            }
            let end = entry.hash_cursor();
            let num_dirty_below = entry.blocks[..end]
                .iter()
                .filter(|b| b.dirty && !b.pending)
                .count();
            (
                end,
                num_dirty_below,
                entry.blocks_in_piece(),
                entry.need_readback,
            )
        };

        // nothing hashed yet and no read-back pending: hold the blocks
        if end == 0 && !need_readback {
            return 0;
        }

        let mut cont_block = cont_block.min(blocks_in_piece).max(1);
        // if everything has been hashed we might as well flush everything,
        // regardless of the contiguity restriction
        if end == blocks_in_piece {
            cont_block = 1;
        }
        if need_readback {
            // this piece needs read-back anyway; holding blocks back saves
            // nothing
            end = blocks_in_piece;
        }

        if cont_block > num_dirty_below && !need_readback {
            return 0;
        }

        self.io_range(key, 0, end, true)
    }

    /// Called under cache pressure: flush by the configured algorithm, and
    /// if that doesn't produce enough, degrade to plain LRU order.
    fn try_flush_write_blocks(&mut self, mut num: usize) {
        log::debug!("Flushing up to {} write blocks", num);
        let keys = self.cache.write_lru_keys();

        match self.conf.disk_cache_algorithm {
            CacheAlgorithm::LargestContiguous => {
                for key in &keys {
                    if num == 0 {
                        break;
                    }
                    num = num.saturating_sub(self.try_flush_contiguous(
                        *key,
                        self.conf.write_cache_line_size,
                        num,
                    ));
                }
            }
            CacheAlgorithm::AvoidReadback => {
                for key in &keys {
                    if num == 0 {
                        break;
                    }
                    num = num.saturating_sub(self.try_flush_hashed(*key, 1));
                }
            }
        }

        // still not enough: flush in LRU order one block runs
        if num > 0 {
            for key in &keys {
                if num == 0 {
                    break;
                }
                num = num
                    .saturating_sub(self.try_flush_contiguous(*key, 1, num));
            }
        }
    }

    /// Flushes the dirty blocks of pieces that have sat in the write cache
    /// beyond the configured expiry.
    fn flush_expired_write_blocks(&mut self) {
        let expiry = self.conf.cache_expiry;
        for key in self.cache.write_lru_keys() {
            let (expired, num_dirty) = match self.cache.entry(&key) {
                Some(entry) => {
                    (entry.expire.elapsed() >= expiry, entry.num_dirty)
                }
                None => continue,
            };
            // entries are in LRU order: the first fresh one ends the sweep
            if !expired {
                break;
            }
            if num_dirty == 0 {
                continue;
            }
            log::debug!("Flushing expired write blocks of piece {}", key.1);
            self.io_range(key, 0, usize::MAX, true);
        }
    }

    /// Flushes and/or tears down every cached piece of the storage per the
    /// flags. Returns the number of outstanding jobs and chains still
    /// running for it; zero means destructive operations are safe.
    fn flush_cache(&mut self, id: TorrentId, flags: u8) -> usize {
        for key in self.cache.storage_piece_keys(id) {
            if flags & FLUSH_DELETE != 0 {
                let mut out = mem::take(&mut self.completed_jobs);
                self.cache.abort_dirty(key, &mut out);
                self.completed_jobs = out;
            } else if flags & FLUSH_WRITE != 0 {
                let num_dirty =
                    self.cache.entry(&key).map(|e| e.num_dirty).unwrap_or(0);
                if num_dirty > 0 {
                    self.io_range(key, 0, usize::MAX, true);
                }
            }

            if flags & (FLUSH_READ | FLUSH_DELETE) != 0 {
                // pieces holding dirty data they're allowed to keep are
                // skipped by a plain read-cache clear
                let keep_dirty = flags & FLUSH_DELETE == 0
                    && flags & FLUSH_WRITE == 0
                    && self
                        .cache
                        .entry(&key)
                        .map(|e| e.num_dirty > 0)
                        .unwrap_or(false);
                if !keep_dirty {
                    self.cache.mark_for_deletion(key);
                }
            }
        }
        self.torrents
            .get(&id)
            .map(|t| t.fence.num_outstanding())
            .unwrap_or(0)
    }

    fn raise_fence(&mut self, id: TorrentId, job: Job) {
        log::debug!("Raising fence on torrent {}", id);
        let torrent = self.torrents.get_mut(&id).expect("fence target");
        torrent.fence.raise(job);
        self.num_blocked_jobs += 1;
    }

    // ------------------- IO issue and completion -------------------

    fn alloc_handler(&mut self, refs: usize, kind: HandlerKind) -> HandlerId {
        let id = self.next_handler;
        self.next_handler = self.next_handler.wrapping_add(1);
        self.handlers.insert(id, AsyncHandler::new(refs, kind));
        id
    }

    /// Issues read or write operations for the staged blocks in the given
    /// range of the piece. Returns the number of blocks put on their way.
    fn io_range(
        &mut self,
        key: PieceKey,
        begin: usize,
        end: usize,
        write: bool,
    ) -> usize {
        let (id, piece) = key;
        let (blocks_in_piece, has_hash, hash_cursor) =
            match self.cache.entry(&key) {
                Some(entry) => (
                    entry.blocks_in_piece(),
                    entry.hash.is_some(),
                    entry.hash_cursor(),
                ),
                None => return 0,
            };
        let end = end.min(blocks_in_piece);
        debug_assert!(begin <= end);
        let storage = match self.torrents.get(&id) {
            Some(torrent) => Arc::clone(&torrent.storage),
            None => return 0,
        };
        log::trace!(
            "io_range: {} piece {} [{}, {})",
            if write { "write" } else { "read" },
            piece,
            begin,
            end
        );

        let mut issued = 0;
        let mut run_start = begin;
        let mut write_bufs: Vec<Bytes> = Vec::new();
        let mut read_bufs: Vec<Vec<u8>> = Vec::new();

        // the termination condition is deliberately <= end so we get one
        // extra iteration to issue the last run
        for i in begin..=end {
            let staged = if i == end {
                false
            } else if write {
                match self.cache.stage_write_block(key, i) {
                    Some(buf) => {
                        write_bufs.push(buf);
                        true
                    }
                    None => false,
                }
            } else {
                match self.cache.stage_read_block(key, i) {
                    Some(buf) => {
                        read_bufs.push(buf);
                        true
                    }
                    None => false,
                }
            };

            if staged {
                if write_bufs.len() + read_bufs.len() == 1 {
                    run_start = i;
                }
                continue;
            }

            let run_len = write_bufs.len() + read_bufs.len();
            if run_len == 0 {
                continue;
            }

            // flushing past the hash cursor means hashing will have to read
            // these blocks back if they're evicted
            if write && has_hash && run_start + run_len > hash_cursor {
                self.cache.set_need_readback(key);
            }

            let bytes: usize = if write {
                write_bufs.iter().map(|b| b.len()).sum()
            } else {
                read_bufs.iter().map(|b| b.len()).sum()
            };
            let handler = self.alloc_handler(
                1,
                HandlerKind::CacheRange {
                    torrent: id,
                    piece,
                    begin: run_start,
                    end: run_start + run_len,
                    write,
                    bytes,
                },
            );
            self.track(id);
            if write {
                self.pending_buffer_size += bytes;
            }

            // one vectored operation per contiguous run
            let acb = if write {
                Acb::write(
                    Arc::clone(&storage),
                    id,
                    piece,
                    run_start,
                    run_start as u32 * BLOCK_LEN,
                    mem::take(&mut write_bufs),
                    handler,
                )
            } else {
                Acb::read(
                    Arc::clone(&storage),
                    id,
                    piece,
                    run_start,
                    run_start as u32 * BLOCK_LEN,
                    mem::take(&mut read_bufs),
                    handler,
                )
            };
            issued += run_len;
            self.enqueue_acbs(vec![acb]);
        }
        issued
    }

    /// Appends a chain to the issue queue, elevator sorted when the
    /// configuration allows reordering.
    fn enqueue_acbs(&mut self, chain: Vec<Acb>) {
        let direction = if self.conf.allow_reordered_disk_operations {
            self.elevator_direction
        } else {
            0
        };
        append_acbs(&mut self.to_issue, chain, direction);
        self.peak_num_to_issue = self.peak_num_to_issue.max(self.to_issue.len());
    }

    /// Hands queued control blocks to the blocking workers, up to the
    /// configured depth.
    fn issue_acbs(&mut self) {
        while self.in_progress < self.conf.aio_threads.max(1)
            && !self.to_issue.is_empty()
        {
            let acb = self.to_issue.pop_front().expect("checked non-empty");
            if self.conf.allow_reordered_disk_operations {
                let step =
                    acb.phys_offset as i64 - self.last_phys_off as i64;
                if !same_sign(step, self.elevator_direction as i64) {
                    self.elevator_direction *= -1;
                    self.elevator_turns += 1;
                }
                self.last_phys_off = acb.phys_offset;
            }
            self.in_progress += 1;
            self.peak_in_progress =
                self.peak_in_progress.max(self.in_progress);

            let done_chan = self.io_done_chan.clone();
            task::spawn_blocking(move || {
                let done = acb.run();
                // the disk task holds the receiver for its whole life
                let _ = done_chan.send(done);
            });
        }
    }

    fn do_aiocb_complete(&mut self, job: Job) {
        let done = match job.kind {
            JobKind::AcbComplete(done) => done,
            _ => unreachable!(),
        };
        debug_assert!(self.in_progress > 0);
        self.in_progress -= 1;

        let handler = match self.handlers.get_mut(&done.handler) {
            Some(handler) => handler,
            None => {
                debug_assert!(false, "completion for retired handler");
                return;
            }
        };
        handler.refs -= 1;
        handler.transferred += done.transferred;
        if handler.error.is_none() {
            handler.error = done.error.clone();
        }
        let retired = handler.refs == 0;
        let is_cache_range =
            matches!(handler.kind, HandlerKind::CacheRange { .. });

        // put read payloads where they belong
        if let Some(bufs) = done.read_bufs {
            if is_cache_range {
                let (torrent, piece) = match &handler.kind {
                    HandlerKind::CacheRange { torrent, piece, .. } => {
                        (*torrent, *piece)
                    }
                    _ => unreachable!(),
                };
                let key = (torrent, piece);
                for (i, buf) in bufs.into_iter().enumerate() {
                    if done.error.is_none() {
                        self.cache.install_read_block(
                            key,
                            done.first_block + i,
                            buf,
                        );
                    } else {
                        self.pool.free(buf);
                    }
                }
            } else {
                // a bypass read; the single buffer rides along until the
                // handler retires
                let buf = bufs.into_iter().next();
                if let Some(handler) = self.handlers.get_mut(&done.handler) {
                    handler.bypass_buf = buf;
                }
            }
        }

        if retired {
            self.retire_handler(done.handler);
        }
    }

    /// Applies a fully completed chain's aggregated outcome.
    fn retire_handler(&mut self, id: HandlerId) {
        let handler = self.handlers.remove(&id).expect("live handler");
        match handler.kind {
            HandlerKind::CacheRange {
                torrent,
                piece,
                begin,
                end,
                write,
                bytes,
            } => {
                if write {
                    debug_assert!(self.pending_buffer_size >= bytes);
                    self.pending_buffer_size -= bytes;
                    debug_assert!(
                        handler.error.is_some()
                            || handler.transferred == bytes
                    );
                }
                let key = (torrent, piece);
                let mut out = mem::take(&mut self.completed_jobs);
                self.cache.mark_as_done(
                    key,
                    begin,
                    end,
                    handler.error.as_ref(),
                    &self.hasher,
                    &mut out,
                );
                self.completed_jobs = out;
                self.chain_complete(torrent);
            }
            HandlerKind::BypassRead { job } => {
                let (piece, offset) = match &job.kind {
                    JobKind::Read { piece, offset, .. } => (*piece, *offset),
                    _ => unreachable!(),
                };
                let result = match handler.error {
                    Some(e) => {
                        if let Some(buf) = handler.bypass_buf {
                            self.pool.free(buf);
                        }
                        Err(e)
                    }
                    None => {
                        let buf = handler
                            .bypass_buf
                            .expect("successful read returns its buffer");
                        let buf = self.pool.detach(buf);
                        Ok(JobOutput::Read {
                            piece,
                            offset,
                            buf: ReadBuf::Copied(buf),
                        })
                    }
                };
                self.completed_jobs.push(Completion { job, result });
            }
            HandlerKind::BypassWrite { job, bytes } => {
                debug_assert!(self.pending_buffer_size >= bytes);
                self.pending_buffer_size -= bytes;
                let (piece, offset, len) = match &job.kind {
                    JobKind::Write {
                        piece, offset, len, ..
                    } => (*piece, *offset, *len),
                    _ => unreachable!(),
                };
                let result = match handler.error {
                    Some(e) => Err(e),
                    None => Ok(JobOutput::Written { piece, offset, len }),
                };
                self.completed_jobs.push(Completion { job, result });
            }
        }
    }

    /// Accounts a finished chain or tracked job against its storage's
    /// fence, requeueing anything the dropping fence releases.
    fn chain_complete(&mut self, id: TorrentId) {
        if let Some(torrent) = self.torrents.get_mut(&id) {
            if let Some(released) = torrent.fence.job_complete() {
                let count = released.len();
                debug_assert!(self.num_blocked_jobs >= count);
                self.num_blocked_jobs -= count;
                log::debug!(
                    "Fence on torrent {} dropped, released {} jobs",
                    id,
                    count
                );
                // released jobs run before anything queued after them
                for job in released.into_iter().rev() {
                    self.queued.push_front(job);
                }
            }
        }
    }

    // ------------------- completion posting -------------------

    fn post_completed_jobs(&mut self) {
        let completions = mem::take(&mut self.completed_jobs);
        for completion in completions {
            if completion.job.tracked {
                if let Some(id) = completion.job.torrent {
                    self.chain_complete(id);
                }
            }
            self.post_alert(completion);
        }
        self.check_abort_jobs();
    }

    /// Completes abort-torrent jobs whose storage has no cached pieces
    /// left.
    fn check_abort_jobs(&mut self) {
        let ready: Vec<TorrentId> = self
            .torrents
            .iter()
            .filter(|(id, t)| {
                t.abort_job.is_some()
                    && self.cache.num_storage_pieces(**id) == 0
            })
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(torrent) = self.torrents.get_mut(&id) {
                torrent.abort_job = None;
            }
            self.finish_abort(id);
        }
    }

    fn send_torrent_alert(&self, id: Option<TorrentId>, alert: TorrentAlert) {
        if let Some(torrent) = id.and_then(|id| self.torrents.get(&id)) {
            // a send failure means the engine dropped the torrent; nothing
            // to do about it here
            let _ = torrent.alert_chan.send(alert);
        }
    }

    /// Converts a completion into the alert the engine observes.
    fn post_alert(&mut self, completion: Completion) {
        let Completion { job, result } = completion;
        let id = job.torrent;
        match job.kind {
            JobKind::Read {
                piece, offset, len, ..
            } => {
                let block = crate::BlockInfo {
                    piece_index: piece,
                    offset,
                    len,
                };
                let result = result.map(|output| match output {
                    JobOutput::Read { buf, .. } => buf,
                    _ => unreachable!("read completes with read output"),
                });
                self.send_torrent_alert(
                    id,
                    TorrentAlert::ReadCompleted { block, result },
                );
            }
            JobKind::Write {
                piece, offset, len, ..
            } => {
                let block = crate::BlockInfo {
                    piece_index: piece,
                    offset,
                    len,
                };
                self.send_torrent_alert(
                    id,
                    TorrentAlert::BlockWritten {
                        block,
                        result: result.map(|_| ()),
                    },
                );
            }
            JobKind::Hash { piece, .. } => {
                let result = result.map(|output| match output {
                    JobOutput::Hashed { digest, .. } => digest,
                    _ => unreachable!("hash completes with a digest"),
                });
                self.send_torrent_alert(
                    id,
                    TorrentAlert::PieceHashed { piece, result },
                );
            }
            JobKind::MoveStorage { .. } => self.send_torrent_alert(
                id,
                TorrentAlert::StorageMoved(result.map(|_| ())),
            ),
            JobKind::ReleaseFiles => self.send_torrent_alert(
                id,
                TorrentAlert::FilesReleased(result.map(|_| ())),
            ),
            JobKind::DeleteFiles => self.send_torrent_alert(
                id,
                TorrentAlert::FilesDeleted(result.map(|_| ())),
            ),
            JobKind::RenameFile { file, .. } => self.send_torrent_alert(
                id,
                TorrentAlert::FileRenamed {
                    file,
                    result: result.map(|_| ()),
                },
            ),
            JobKind::FinalizeFile { file } => self.send_torrent_alert(
                id,
                TorrentAlert::FileFinalized {
                    file,
                    result: result.map(|_| ()),
                },
            ),
            JobKind::CheckFastresume { .. } => {
                let result = result.map(|output| match output {
                    JobOutput::Fastresume(ok) => ok,
                    _ => unreachable!("fastresume completes with a flag"),
                });
                self.send_torrent_alert(
                    id,
                    TorrentAlert::FastresumeChecked(result),
                );
            }
            JobKind::SaveResumeData => {
                let result = result.map(|output| match output {
                    JobOutput::ResumeData(data) => data,
                    _ => unreachable!("resume save completes with data"),
                });
                self.send_torrent_alert(
                    id,
                    TorrentAlert::ResumeDataSaved(result),
                );
            }
            JobKind::FileStatus => {
                let result = result.map(|output| match output {
                    JobOutput::FileStatus(status) => status,
                    _ => unreachable!("file status completes with a list"),
                });
                self.send_torrent_alert(id, TorrentAlert::FileStatus(result));
            }
            JobKind::GetCacheInfo => {
                let info = match result {
                    Ok(JobOutput::CacheInfo(info)) => info,
                    _ => unreachable!("cache info cannot fail"),
                };
                match id {
                    Some(_) => self.send_torrent_alert(
                        id,
                        TorrentAlert::CacheInfo(info),
                    ),
                    None => {
                        let _ =
                            self.alert_chan.send(Alert::CacheInfo(info));
                    }
                }
            }
            JobKind::SyncPiece { piece } => self.send_torrent_alert(
                id,
                TorrentAlert::PieceSynced {
                    piece,
                    result: result.map(|_| ()),
                },
            ),
            JobKind::FlushPiece { piece } => self.send_torrent_alert(
                id,
                TorrentAlert::PieceFlushed {
                    piece,
                    result: result.map(|_| ()),
                },
            ),
            JobKind::ClearPiece { piece } => self.send_torrent_alert(
                id,
                TorrentAlert::PieceCleared { piece },
            ),
            JobKind::CachePiece { piece } => self.send_torrent_alert(
                id,
                TorrentAlert::PieceCached {
                    piece,
                    result: result.map(|_| ()),
                },
            ),
            JobKind::ClearReadCache => self.send_torrent_alert(
                id,
                TorrentAlert::ReadCacheCleared,
            ),
            // these never produce user visible completions
            JobKind::NewTorrent { .. }
            | JobKind::AbortTorrent
            | JobKind::AbortThread
            | JobKind::UpdateSettings { .. }
            | JobKind::TrimCache
            | JobKind::HashingDone(_)
            | JobKind::AcbComplete(_)
            | JobKind::ReclaimBlock { .. } => {
                debug_assert!(false, "unexpected completion");
            }
        }
    }

    // ------------------- introspection -------------------

    fn build_cache_info(&self, torrent: Option<TorrentId>) -> CacheInfo {
        let keys = match torrent {
            Some(id) => self.cache.storage_piece_keys(id),
            None => self.cache.all_piece_keys(),
        };
        let mut pieces = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = match self.cache.entry(&key) {
                Some(entry) => entry,
                None => continue,
            };
            pieces.push(CachedPieceInfo {
                piece: key.1,
                kind: if entry.num_dirty > 0 {
                    CachedPieceKind::Write
                } else {
                    CachedPieceKind::Read
                },
                blocks: entry.blocks.iter().map(|b| b.has_buf()).collect(),
                num_dirty: entry.num_dirty,
                next_to_hash: entry.hash.as_ref().map(|_| entry.hash_cursor()),
                need_readback: entry.need_readback,
                num_jobs: entry.jobs.len(),
            });
        }
        CacheInfo {
            stats: self.cache.stats(),
            pieces,
            allocations: self.pool.allocations(),
            num_to_issue: self.to_issue.len(),
            peak_num_to_issue: self.peak_num_to_issue,
            num_in_progress: self.in_progress,
            peak_in_progress: self.peak_in_progress,
            num_blocked_jobs: self.num_blocked_jobs,
            elevator_turns: self.elevator_turns,
            pending_buffer_size: self.pending_buffer_size,
            queue_buffer_size: self.queue_buffer_size,
        }
    }
}

/// Best effort amount of physical memory, used to auto size the cache.
fn physical_ram() -> u64 {
    if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kb) = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    return kb * 1024;
                }
            }
        }
    }
    0
}
