//! The block cache at the center of the disk task.
//!
//! Every piece the disk task touches has an entry here, holding per block
//! buffers, dirty/pending flags, and pin counts, plus the jobs waiting on
//! the piece to settle. Entries are chained into five LRU lists: a write
//! list for pieces with dirty blocks or an active hash, and the two ARC
//! read lists with their ghost shadows.
//!
//! The cache is owned and mutated exclusively by the disk task. Blocks are
//! stored as [`Bytes`] once filled so they can be lent to hash workers and
//! peer send queues without copying, while the cache keeps its own pin
//! counts to decide what may be evicted.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    mem,
    sync::Arc,
    time::Instant,
};

use {bytes::Bytes, sha1::Digest};

use crate::{
    block_len,
    conf::DiskConf,
    disk::job::{Completion, Job, JobKind, JobOutput},
    error::JobError,
    hasher::{HashDone, HashJob, Hasher, PartialHash},
    pool::BufferPool,
    BlockIndex, PieceIndex, PieceKey, Sha1Hash, TorrentId, BLOCK_LEN,
};

/// A zero-copy lease of a cache block, handed to the peer layer for
/// sending.
///
/// The lease pins the block in the cache until it is returned through a
/// reclaim-block job. The carried [`Bytes`] handle keeps the memory itself
/// alive even if the cache entry is torn down first, so a tardy reclaim can
/// never observe freed memory.
pub struct BlockRef {
    pub(crate) torrent: TorrentId,
    pub(crate) piece: PieceIndex,
    pub(crate) block: BlockIndex,
    pub(crate) data: Bytes,
}

impl BlockRef {
    /// The lent bytes, already sliced to the requested range.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.piece
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("torrent", &self.torrent)
            .field("piece", &self.piece)
            .field("block", &self.block)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The payload of a completed read: either an owned copy or a zero-copy
/// block lease.
#[derive(Debug)]
pub enum ReadBuf {
    Copied(Vec<u8>),
    Shared(BlockRef),
}

impl ReadBuf {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Copied(buf) => buf,
            Self::Shared(bref) => bref.data(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// What a block slot currently holds.
pub(crate) enum BlockData {
    /// Nothing.
    None,
    /// A buffer freshly allocated for a scheduled read; garbage until the
    /// read fills it. Owned here until the chain is issued.
    Uninit(Vec<u8>),
    /// The buffer is traveling with an in-flight read operation.
    Reading,
    /// Valid data, shareable without copying.
    Filled(Bytes),
}

impl BlockData {
    /// Takes the value out, leaving `BlockData::None` behind.
    fn take(&mut self) -> Self {
        mem::replace(self, BlockData::None)
    }
}

/// One slot of a cached piece.
pub(crate) struct BlockEntry {
    pub data: BlockData,
    /// Pins from in-flight IO, hash jobs, and peer send leases. The block
    /// cannot be evicted while nonzero.
    pub refcount: u16,
    /// How many reads this block has served from cache.
    pub hitcount: u16,
    /// The block holds data that still needs to be written to disk.
    pub dirty: bool,
    /// An IO operation currently targets this block.
    pub pending: bool,
    /// The block was dirty once and has since hit the disk.
    pub written: bool,
}

impl BlockEntry {
    fn new() -> Self {
        Self {
            data: BlockData::None,
            refcount: 0,
            hitcount: 0,
            dirty: false,
            pending: false,
            written: false,
        }
    }

    /// Whether the slot accounts for a buffer, present or traveling.
    pub fn has_buf(&self) -> bool {
        !matches!(self.data, BlockData::None)
    }

    /// The block's data, if filled in.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.data {
            BlockData::Filled(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.data, BlockData::Uninit(_))
    }
}

/// Which LRU list a piece entry is chained into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheState {
    /// Pieces with dirty blocks or an active hash state.
    WriteLru,
    /// Read pieces seen once.
    ReadLru1,
    /// Metadata shadows of pieces evicted from L1.
    ReadLru1Ghost,
    /// Read pieces seen more than once.
    ReadLru2,
    /// Metadata shadows of pieces evicted from L2.
    ReadLru2Ghost,
}

impl CacheState {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            Self::WriteLru => 0,
            Self::ReadLru1 => 1,
            Self::ReadLru1Ghost => 2,
            Self::ReadLru2 => 3,
            Self::ReadLru2Ghost => 4,
        }
    }

    pub fn is_ghost(self) -> bool {
        matches!(self, Self::ReadLru1Ghost | Self::ReadLru2Ghost)
    }
}

/// The most recent cache event relevant to the ARC balance, deciding which
/// read list the next eviction shrinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheOp {
    Miss,
    GhostHitL1,
    GhostHitL2,
}

/// One cached piece and everything waiting on it.
pub(crate) struct PieceEntry {
    pub key: PieceKey,
    /// The actual length of this piece in bytes (the last piece of a
    /// torrent may be short).
    pub piece_len: u32,
    pub blocks: Box<[BlockEntry]>,
    /// The number of slots currently accounting for a buffer.
    pub num_blocks: usize,
    /// The number of dirty blocks.
    pub num_dirty: usize,
    /// The sum of all block refcounts.
    pub refcount: usize,
    /// Jobs waiting for this piece's blocks to settle, reaped in FIFO
    /// order.
    pub jobs: VecDeque<Job>,
    /// The piece's incremental hash state, while hashing is wanted.
    pub hash: Option<PartialHash>,
    /// The first block of the range currently being hashed off-thread, or
    /// `None` when no hash operation is in flight.
    pub hashing: Option<BlockIndex>,
    pub cache_state: CacheState,
    /// Last promotion time, used by the write cache expiry sweep.
    pub expire: Instant,
    /// Delete this entry as soon as its refcount drains.
    pub marked_for_deletion: bool,
    /// Blocks past the hash cursor have been flushed and evicted; hashing
    /// will need to read them back.
    pub need_readback: bool,
    // intrusive links of the LRU list this entry is on
    prev: Option<PieceKey>,
    next: Option<PieceKey>,
}

impl PieceEntry {
    pub fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_len(&self, index: BlockIndex) -> u32 {
        block_len(self.piece_len, index)
    }

    /// The first block not yet fully covered by the running hash, rounded
    /// up so a partially hashed final block counts as covered.
    pub fn hash_cursor(&self) -> BlockIndex {
        match &self.hash {
            Some(hash) => {
                ((hash.offset + BLOCK_LEN - 1) / BLOCK_LEN) as BlockIndex
            }
            None => 0,
        }
    }
}

/// An LRU list over piece entries, linked through the entries' own
/// prev/next keys. The most recently used entry is at the tail; iterating
/// from the head visits the least recently used first.
#[derive(Default)]
struct LruList {
    head: Option<PieceKey>,
    tail: Option<PieceKey>,
    len: usize,
}

/// Why `allocate_pending` could not set up the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingError {
    /// The buffer pool is exhausted and eviction freed nothing usable.
    NoMemory,
    /// The cache has no room and the request's priority doesn't warrant
    /// evicting for it; the caller should bypass the cache.
    NoSpace,
}

/// The outcome of a cache read attempt.
pub(crate) enum TryRead {
    /// The range was served from cache.
    Hit(ReadBuf),
    /// The range is not (fully) present.
    Miss,
    /// A copy buffer could not be allocated.
    NoMemory,
}

/// Counters surfaced through cache info snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    /// Blocks in the cache holding clean data, including buffers staged
    /// for reads in flight.
    pub read_cache_size: usize,
    /// Blocks in the cache holding dirty data.
    pub write_cache_size: usize,
    /// Blocks with a nonzero pin count.
    pub pinned_blocks: usize,
    /// Blocks currently lent to peer send queues.
    pub send_buffer_blocks: usize,
    /// Total blocks served, from cache or disk.
    pub blocks_read: u64,
    /// Blocks served straight from cache.
    pub blocks_read_hit: u64,
    /// Blocks written to disk.
    pub blocks_written: u64,
    /// Cached piece entries, including ghosts.
    pub num_pieces: usize,
}

/// The block cache proper. Owned by the disk task.
pub(crate) struct BlockCache {
    pieces: HashMap<PieceKey, PieceEntry>,
    lists: [LruList; CacheState::COUNT],
    /// Piece indices per torrent, for storage wide sweeps (flush, abort,
    /// fence release checks).
    storage_pieces: HashMap<TorrentId, HashSet<PieceIndex>>,
    /// The ARC balance signal.
    last_cache_op: CacheOp,
    /// The combined bound on the two ghost lists.
    ghost_size: usize,
    stats: CacheStats,
    pool: Arc<BufferPool>,
}

impl BlockCache {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let ghost_size = pool.limit() / DiskConf::GHOST_LIST_DIVISOR;
        Self {
            pieces: HashMap::new(),
            lists: Default::default(),
            storage_pieces: HashMap::new(),
            last_cache_op: CacheOp::Miss,
            ghost_size,
            stats: CacheStats::default(),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats;
        stats.num_pieces = self.pieces.len();
        stats
    }

    /// Applies a new cache size, adjusting the ghost bound accordingly.
    pub fn set_cache_size(&mut self, blocks: usize) {
        self.ghost_size = blocks / DiskConf::GHOST_LIST_DIVISOR;
        self.enforce_ghost_bound();
    }

    // ------------------- torrent registration -------------------

    pub fn add_torrent(&mut self, torrent: TorrentId) {
        self.storage_pieces.entry(torrent).or_default();
    }

    pub fn remove_torrent(&mut self, torrent: TorrentId) {
        let pieces = self.storage_pieces.remove(&torrent);
        debug_assert!(pieces.map(|p| p.is_empty()).unwrap_or(true));
    }

    pub fn num_storage_pieces(&self, torrent: TorrentId) -> usize {
        self.storage_pieces
            .get(&torrent)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub fn storage_piece_keys(&self, torrent: TorrentId) -> Vec<PieceKey> {
        self.storage_pieces
            .get(&torrent)
            .map(|pieces| pieces.iter().map(|p| (torrent, *p)).collect())
            .unwrap_or_default()
    }

    // ------------------- lookups -------------------

    pub fn entry(&self, key: &PieceKey) -> Option<&PieceEntry> {
        self.pieces.get(key)
    }

    pub fn contains(&self, key: &PieceKey) -> bool {
        self.pieces.contains_key(key)
    }

    /// The keys of the write LRU, least recently used first.
    pub fn write_lru_keys(&self) -> Vec<PieceKey> {
        self.list_keys(CacheState::WriteLru)
    }

    pub fn all_piece_keys(&self) -> Vec<PieceKey> {
        self.pieces.keys().copied().collect()
    }

    // ------------------- LRU list plumbing -------------------

    fn list_keys(&self, state: CacheState) -> Vec<PieceKey> {
        let mut keys = Vec::with_capacity(self.lists[state.index()].len);
        let mut cursor = self.lists[state.index()].head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = self.pieces[&key].next;
        }
        keys
    }

    fn list_push_back(&mut self, state: CacheState, key: PieceKey) {
        let tail = self.lists[state.index()].tail;
        {
            let entry = self.pieces.get_mut(&key).expect("entry in list op");
            entry.prev = tail;
            entry.next = None;
        }
        match tail {
            Some(tail_key) => {
                self.pieces.get_mut(&tail_key).expect("list tail").next =
                    Some(key)
            }
            None => self.lists[state.index()].head = Some(key),
        }
        self.lists[state.index()].tail = Some(key);
        self.lists[state.index()].len += 1;
    }

    fn list_remove(&mut self, state: CacheState, key: PieceKey) {
        let (prev, next) = {
            let entry = self.pieces.get_mut(&key).expect("entry in list op");
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(prev_key) => {
                self.pieces.get_mut(&prev_key).expect("list link").next = next
            }
            None => self.lists[state.index()].head = next,
        }
        match next {
            Some(next_key) => {
                self.pieces.get_mut(&next_key).expect("list link").prev = prev
            }
            None => self.lists[state.index()].tail = prev,
        }
        debug_assert!(self.lists[state.index()].len > 0);
        self.lists[state.index()].len -= 1;
    }

    /// Moves the entry to the most recently used end of its current list.
    fn bump_lru(&mut self, key: PieceKey) {
        let state = self.pieces[&key].cache_state;
        self.list_remove(state, key);
        self.list_push_back(state, key);
        self.pieces.get_mut(&key).expect("bumped entry").expire =
            Instant::now();
    }

    /// Moves the entry to the most recently used end of another list.
    fn set_cache_state(&mut self, key: PieceKey, state: CacheState) {
        let old = self.pieces[&key].cache_state;
        if old == state {
            self.bump_lru(key);
            return;
        }
        self.list_remove(old, key);
        {
            let entry = self.pieces.get_mut(&key).expect("moved entry");
            entry.cache_state = state;
            entry.expire = Instant::now();
        }
        self.list_push_back(state, key);
    }

    /// Moves the entry into the list its dirty/hash state calls for.
    fn update_cache_state(&mut self, key: PieceKey) {
        let entry = match self.pieces.get(&key) {
            Some(entry) => entry,
            None => return,
        };
        let state = entry.cache_state;
        let wants_write = entry.num_dirty > 0 || entry.hash.is_some();
        if wants_write && state != CacheState::WriteLru {
            self.set_cache_state(key, CacheState::WriteLru);
        } else if !wants_write && state == CacheState::WriteLru {
            // a drained write piece turns into a read piece seen once
            self.set_cache_state(key, CacheState::ReadLru1);
        }
    }

    /// Registers a cache hit on the entry: a piece seen again graduates
    /// from L1 to L2.
    fn touch(&mut self, key: PieceKey) {
        match self.pieces[&key].cache_state {
            CacheState::ReadLru1 => {
                self.set_cache_state(key, CacheState::ReadLru2)
            }
            CacheState::ReadLru2 | CacheState::WriteLru => self.bump_lru(key),
            // ghosts hold no data; hits on them are handled at allocation
            CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost => {}
        }
    }

    // ------------------- allocation -------------------

    /// Looks up or inserts the entry for the piece. A hit on a ghost entry
    /// records the ARC signal and resurrects the entry into L2.
    pub fn allocate_piece(
        &mut self,
        key: PieceKey,
        piece_len: u32,
        state: CacheState,
    ) {
        if let Some(entry) = self.pieces.get(&key) {
            let current = entry.cache_state;
            if current.is_ghost() {
                self.last_cache_op = if current == CacheState::ReadLru1Ghost {
                    CacheOp::GhostHitL1
                } else {
                    CacheOp::GhostHitL2
                };
                log::debug!(
                    "Ghost hit on piece {} of torrent {}",
                    key.1,
                    key.0
                );
                self.set_cache_state(key, CacheState::ReadLru2);
            }
            return;
        }

        self.last_cache_op = CacheOp::Miss;
        let blocks: Vec<_> = (0..crate::block_count(piece_len))
            .map(|_| BlockEntry::new())
            .collect();
        let entry = PieceEntry {
            key,
            piece_len,
            blocks: blocks.into_boxed_slice(),
            num_blocks: 0,
            num_dirty: 0,
            refcount: 0,
            jobs: VecDeque::new(),
            hash: None,
            hashing: None,
            cache_state: state,
            expire: Instant::now(),
            marked_for_deletion: false,
            need_readback: false,
            prev: None,
            next: None,
        };
        self.pieces.insert(key, entry);
        self.storage_pieces.entry(key.0).or_default().insert(key.1);
        self.list_push_back(state, key);
    }

    /// Creates the piece's hash state if it doesn't have one yet, which
    /// also parks the entry on the write LRU.
    pub fn ensure_hash_state(&mut self, key: PieceKey) {
        let entry = match self.pieces.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        if entry.hash.is_none() {
            entry.hash = Some(PartialHash::new());
            self.update_cache_state(key);
        }
    }

    /// Installs a freshly downloaded block as dirty data, taking ownership
    /// of the buffer, and attaches the write job as a waiter to be
    /// completed when the block is flushed.
    pub fn add_dirty_block(
        &mut self,
        key: PieceKey,
        piece_len: u32,
        block: BlockIndex,
        buf: Bytes,
        job: Job,
        hasher: &dyn Hasher,
        out: &mut Vec<Completion>,
    ) {
        self.allocate_piece(key, piece_len, CacheState::ReadLru1);

        // dirty data may push us over the limit; make room by dropping read
        // blocks (never other dirty blocks)
        let evict = self.pool.over_limit(0);
        if evict > 0 {
            self.try_evict_blocks(evict, Some(key));
        }

        {
            let entry = self.pieces.get_mut(&key).expect("just allocated");
            debug_assert!(block < entry.blocks.len());
            let slot = &mut entry.blocks[block];

            if slot.pending || matches!(slot.data, BlockData::Reading) {
                // an operation is in flight for this block; the incoming
                // copy is a duplicate from another peer
                log::warn!(
                    "Duplicate write for in-flight block {} of piece {}",
                    block,
                    key.1
                );
                self.pool.free_shared(buf);
                let (piece, offset, len) = write_job_target(&job);
                out.push(Completion::ok(
                    job,
                    JobOutput::Written { piece, offset, len },
                ));
                return;
            }

            // replace whatever the slot held: a left-over read block from
            // hash checking, a staged read buffer, or a previous version of
            // the same dirty block
            match slot.data.take() {
                BlockData::None => {}
                BlockData::Uninit(old) => {
                    self.pool.free(old);
                    entry.num_blocks -= 1;
                    self.stats.read_cache_size -= 1;
                }
                BlockData::Filled(old) => {
                    self.pool.free_shared(old);
                    entry.num_blocks -= 1;
                    if slot.dirty {
                        slot.dirty = false;
                        entry.num_dirty -= 1;
                        self.stats.write_cache_size -= 1;
                    } else {
                        self.stats.read_cache_size -= 1;
                    }
                }
                BlockData::Reading => unreachable!("handled above"),
            }

            slot.data = BlockData::Filled(buf);
            slot.dirty = true;
            slot.written = false;
            entry.num_blocks += 1;
            entry.num_dirty += 1;
            self.stats.write_cache_size += 1;
            entry.jobs.push_back(job);
        }

        self.update_cache_state(key);
        self.bump_lru(key);

        // the new block may extend the run the hasher can chew through
        self.kick_hasher(key, hasher, out);
    }

    /// Allocates buffers for the blocks of `[begin, end)` that are neither
    /// present nor pending, marking them to be filled by a scheduled read,
    /// and attaches the job as a waiter.
    ///
    /// Returns the number of newly staged blocks; 0 means every block was
    /// already present or on its way, and the waiter is still attached. On
    /// failure the job is handed back untouched.
    pub fn allocate_pending(
        &mut self,
        key: PieceKey,
        begin: BlockIndex,
        end: BlockIndex,
        job: Job,
        prio: u8,
        force: bool,
    ) -> Result<usize, (Job, PendingError)> {
        debug_assert!(begin < end);
        let mut end = end;

        let blocks_to_allocate = {
            let entry = self.pieces.get(&key).expect("allocate_pending target");
            debug_assert!(end <= entry.blocks.len());
            entry.blocks[begin..end]
                .iter()
                .filter(|b| !b.has_buf() && !b.pending)
                .count()
        };

        let evict = self.pool.over_limit(blocks_to_allocate);
        if evict > 0 && self.try_evict_blocks(evict, Some(key)) > 0 && prio < 1
        {
            // we couldn't make room. This is not an out of memory
            // condition, just out of cache space; low priority requests
            // either shrink to a single block or bypass the cache
            if force {
                end = (begin + 1).min(end);
            } else {
                return Err((job, PendingError::NoSpace));
            }
        }

        let mut allocated = 0;
        for i in begin..end {
            let needs_buf = {
                let slot = &self.pieces[&key].blocks[i];
                !slot.has_buf() && !slot.pending
            };
            if !needs_buf {
                continue;
            }
            match self.pool.allocate("pending read") {
                Some(buf) => {
                    let entry = self.pieces.get_mut(&key).expect("entry");
                    entry.blocks[i].data = BlockData::Uninit(buf);
                    entry.num_blocks += 1;
                    self.stats.read_cache_size += 1;
                    allocated += 1;
                }
                None => {
                    // roll back this call's allocations and report the
                    // memory condition
                    let entry = self.pieces.get_mut(&key).expect("entry");
                    let mut rolled_back = Vec::new();
                    for slot in entry.blocks[begin..end].iter_mut() {
                        if let BlockData::Uninit(_) = slot.data {
                            if let BlockData::Uninit(buf) = slot.data.take() {
                                rolled_back.push(buf);
                                entry.num_blocks -= 1;
                                self.stats.read_cache_size -= 1;
                            }
                        }
                    }
                    self.pool.free_many(rolled_back);
                    return Err((job, PendingError::NoMemory));
                }
            }
        }

        let entry = self.pieces.get_mut(&key).expect("entry");
        if entry.num_dirty == 0 {
            // in case this was marked for deletion, don't do that anymore
            entry.marked_for_deletion = false;
        }
        entry.jobs.push_back(job);
        Ok(allocated)
    }

    /// Attaches a job to the piece without touching any blocks.
    pub fn attach_job(&mut self, key: PieceKey, job: Job) {
        self.pieces
            .get_mut(&key)
            .expect("attach_job target")
            .jobs
            .push_back(job);
    }

    // ------------------- IO staging -------------------

    /// Takes the staged buffer of an uninitialized block and pins the block
    /// for the duration of the read. Returns `None` if the block isn't
    /// staged for reading.
    pub fn stage_read_block(
        &mut self,
        key: PieceKey,
        index: BlockIndex,
    ) -> Option<Vec<u8>> {
        let entry = self.pieces.get_mut(&key)?;
        let block_len = entry.block_len(index) as usize;
        let slot = &mut entry.blocks[index];
        if !slot.is_uninit() {
            return None;
        }
        let mut buf = match slot.data.take() {
            BlockData::Uninit(buf) => buf,
            _ => unreachable!("checked above"),
        };
        buf.truncate(block_len);
        slot.data = BlockData::Reading;
        slot.pending = true;
        if slot.refcount == 0 {
            self.stats.pinned_blocks += 1;
        }
        slot.refcount += 1;
        entry.refcount += 1;
        Some(buf)
    }

    /// Clones out the payload of a dirty block and pins it for the duration
    /// of the write. Returns `None` if the block has nothing to flush.
    pub fn stage_write_block(
        &mut self,
        key: PieceKey,
        index: BlockIndex,
    ) -> Option<Bytes> {
        let entry = self.pieces.get_mut(&key)?;
        let slot = &mut entry.blocks[index];
        if !slot.dirty || slot.pending {
            return None;
        }
        let buf = slot.bytes()?.clone();
        slot.pending = true;
        if slot.refcount == 0 {
            self.stats.pinned_blocks += 1;
        }
        slot.refcount += 1;
        entry.refcount += 1;
        Some(buf)
    }

    /// Installs the data a completed read brought back. If the slot is no
    /// longer expecting it the buffer is simply returned to the pool.
    pub fn install_read_block(
        &mut self,
        key: PieceKey,
        index: BlockIndex,
        buf: Vec<u8>,
    ) {
        if let Some(entry) = self.pieces.get_mut(&key) {
            let slot = &mut entry.blocks[index];
            if matches!(slot.data, BlockData::Reading) {
                slot.data = BlockData::Filled(Bytes::from(buf));
                return;
            }
        }
        self.pool.free(buf);
    }

    // ------------------- completion -------------------

    /// Settles the blocks of `[begin, end)` after their IO chain completed,
    /// then reaps every waiter whose contract is now satisfied.
    ///
    /// On error all waiters fail, the range's buffers are released, and
    /// failed writes lose their dirty state.
    pub fn mark_as_done(
        &mut self,
        key: PieceKey,
        begin: BlockIndex,
        end: BlockIndex,
        error: Option<&JobError>,
        hasher: &dyn Hasher,
        out: &mut Vec<Completion>,
    ) {
        let entry = match self.pieces.get_mut(&key) {
            Some(entry) => entry,
            None => {
                log::warn!("Completion for unknown piece {:?}", key);
                return;
            }
        };
        debug_assert!(begin < end);
        debug_assert!(end <= entry.blocks.len());

        let mut flushed = 0u64;
        let mut freed_shared = Vec::new();
        for i in begin..end {
            let slot = &mut entry.blocks[i];
            debug_assert!(slot.refcount > 0);
            slot.refcount -= 1;
            entry.refcount -= 1;
            if slot.refcount == 0 {
                debug_assert!(self.stats.pinned_blocks > 0);
                self.stats.pinned_blocks -= 1;
            }
            if !slot.pending {
                continue;
            }
            slot.pending = false;

            if slot.dirty {
                // the write hit the disk (or failed trying); either way the
                // block is no longer dirty
                slot.dirty = false;
                entry.num_dirty -= 1;
                self.stats.write_cache_size -= 1;
                self.stats.read_cache_size += 1;
                if error.is_none() {
                    slot.written = true;
                    flushed += 1;
                }
            }

            if error.is_some() {
                // release the block unless someone still holds a pin on it
                if slot.refcount > 0 {
                    continue;
                }
                match slot.data.take() {
                    BlockData::None => continue,
                    BlockData::Reading => {
                        // the traveling buffer is freed by the scheduler
                    }
                    BlockData::Uninit(buf) => freed_shared.push(Err(buf)),
                    BlockData::Filled(buf) => freed_shared.push(Ok(buf)),
                }
                slot.written = false;
                entry.num_blocks -= 1;
                self.stats.read_cache_size -= 1;
            }
        }
        self.stats.blocks_written += flushed;
        for freed in freed_shared {
            match freed {
                Ok(bytes) => self.pool.free_shared(bytes),
                Err(buf) => self.pool.free(buf),
            }
        }

        self.update_cache_state(key);

        // freshly settled blocks may extend the hashable run; inline hash
        // progress reaps on its own
        if error.is_none() {
            self.kick_hasher(key, hasher, out);
        }
        self.reap_piece_jobs(key, error, 0, 0, false, out);

        self.maybe_free_piece(key, out);
    }

    /// Pins a block range on behalf of a hash job, so eviction keeps its
    /// hands off the blocks until they've been folded into the digest.
    /// Every block in the range must be present or staged.
    pub fn pin_blocks(
        &mut self,
        key: PieceKey,
        begin: BlockIndex,
        end: BlockIndex,
    ) {
        let entry = match self.pieces.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        for slot in entry.blocks[begin..end].iter_mut() {
            debug_assert!(slot.has_buf());
            if slot.refcount == 0 {
                self.stats.pinned_blocks += 1;
            }
            slot.refcount += 1;
            entry.refcount += 1;
        }
    }

    /// If the piece's hash has covered the whole piece and no hash
    /// operation is in flight, takes the state and returns the final
    /// digest.
    pub fn take_finished_hash(
        &mut self,
        key: PieceKey,
        volatile: bool,
    ) -> Option<Sha1Hash> {
        let entry = self.pieces.get_mut(&key)?;
        if entry.hashing.is_some() {
            return None;
        }
        let done = entry
            .hash
            .as_ref()
            .map(|h| h.offset >= entry.piece_len)
            .unwrap_or(false);
        if !done {
            return None;
        }
        let hash = entry.hash.take().expect("checked above");
        let digest: Sha1Hash = hash
            .ctx
            .expect("idle hash state has its context")
            .finalize()
            .into();
        if volatile {
            entry.marked_for_deletion = true;
        }
        self.update_cache_state(key);
        Some(digest)
    }

    /// Helper releasing hash/IO pins on a block range.
    fn unpin_blocks(&mut self, key: PieceKey, begin: BlockIndex, end: BlockIndex) {
        let entry = match self.pieces.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        for i in begin..end {
            let slot = &mut entry.blocks[i];
            debug_assert!(slot.refcount > 0);
            slot.refcount -= 1;
            if slot.refcount == 0 {
                debug_assert!(self.stats.pinned_blocks > 0);
                self.stats.pinned_blocks -= 1;
            }
            debug_assert!(entry.refcount > 0);
            entry.refcount -= 1;
        }
    }

    /// Looks at the piece's waiters and completes every one whose contract
    /// is now satisfied; the rest stay attached, in order.
    fn reap_piece_jobs(
        &mut self,
        key: PieceKey,
        error: Option<&JobError>,
        _hash_begin: BlockIndex,
        hash_end: BlockIndex,
        reap_hash_jobs: bool,
        out: &mut Vec<Completion>,
    ) {
        let mut jobs = match self.pieces.get_mut(&key) {
            Some(entry) => mem::take(&mut entry.jobs),
            None => return,
        };
        let mut keep = VecDeque::new();
        let mut sync_jobs = Vec::new();

        while let Some(mut job) = jobs.pop_front() {
            if let Some(err) = error {
                // a block error fails every waiter, whatever it was waiting
                // for; hash jobs first drop the pins they hold
                if let JobKind::Hash { cursor, .. } = &mut job.kind {
                    let end = self
                        .pieces
                        .get(&key)
                        .map(|e| e.blocks_in_piece())
                        .unwrap_or(*cursor);
                    if *cursor < end {
                        let begin = *cursor;
                        *cursor = end;
                        self.unpin_blocks(key, begin, end);
                    }
                }
                out.push(Completion::failed(job, err.clone()));
                continue;
            }

            match &mut job.kind {
                JobKind::Hash {
                    cursor,
                    volatile_read,
                    piece,
                } => {
                    let piece = *piece;
                    if reap_hash_jobs && *cursor < hash_end {
                        let begin = *cursor;
                        *cursor = hash_end;
                        self.unpin_blocks(key, begin, hash_end);
                    }
                    let (still_hashing, offset, piece_len) = {
                        let entry = self.pieces.get(&key).expect("reap entry");
                        (
                            entry.hashing.is_some(),
                            entry
                                .hash
                                .as_ref()
                                .map(|h| h.offset)
                                .unwrap_or(entry.piece_len),
                            entry.piece_len,
                        )
                    };
                    if still_hashing || offset < piece_len {
                        keep.push_back(job);
                        continue;
                    }
                    // the whole piece has been hashed; finalize the digest
                    let volatile = *volatile_read;
                    let entry = self.pieces.get_mut(&key).expect("reap entry");
                    match entry.hash.take() {
                        Some(hash) => {
                            let digest: Sha1Hash = hash
                                .ctx
                                .expect("idle hash state has its context")
                                .finalize()
                                .into();
                            if volatile {
                                entry.marked_for_deletion = true;
                            }
                            self.update_cache_state(key);
                            log::debug!(
                                "Piece {} hashed: {}",
                                piece,
                                hex::encode(&digest)
                            );
                            out.push(Completion::ok(
                                job,
                                JobOutput::Hashed { piece, digest },
                            ));
                        }
                        None => {
                            // another hash job already consumed the state
                            debug_assert!(false, "duplicate hash job");
                            out.push(Completion::failed(job, JobError::Aborted));
                        }
                    }
                }
                JobKind::Read {
                    piece,
                    offset,
                    len,
                    force_copy,
                } => {
                    let (piece, offset, len, force_copy) =
                        (*piece, *offset, *len, *force_copy);
                    let first = (offset / BLOCK_LEN) as usize;
                    let last = ((offset + len - 1) / BLOCK_LEN) as usize;
                    let blocked = {
                        let entry = self.pieces.get(&key).expect("reap entry");
                        entry.blocks[first].pending
                            || entry.blocks[last].pending
                            || entry.blocks[first].dirty
                            || entry.blocks[last].dirty
                    };
                    if blocked {
                        keep.push_back(job);
                        continue;
                    }
                    match self.copy_from_piece(key, offset, len, force_copy) {
                        TryRead::Hit(buf) => out.push(Completion::ok(
                            job,
                            JobOutput::Read { piece, offset, buf },
                        )),
                        TryRead::Miss => keep.push_back(job),
                        TryRead::NoMemory => out.push(Completion::failed(
                            job,
                            JobError::NoMemory,
                        )),
                    }
                }
                JobKind::Write {
                    piece, offset, len, ..
                } => {
                    let (piece, offset, len) = (*piece, *offset, *len);
                    let block = (offset / BLOCK_LEN) as usize;
                    let blocked = {
                        let entry = self.pieces.get(&key).expect("reap entry");
                        entry.blocks[block].pending || entry.blocks[block].dirty
                    };
                    if blocked {
                        keep.push_back(job);
                        continue;
                    }
                    out.push(Completion::ok(
                        job,
                        JobOutput::Written { piece, offset, len },
                    ));
                }
                JobKind::SyncPiece { .. } => sync_jobs.push(job),
                JobKind::FlushPiece { .. } => {
                    let dirty = self
                        .pieces
                        .get(&key)
                        .map(|e| e.num_dirty)
                        .unwrap_or(0);
                    if dirty > 0 {
                        keep.push_back(job);
                    } else {
                        out.push(Completion::ok(job, JobOutput::Done));
                    }
                }
                JobKind::CachePiece { .. } => {
                    let outstanding = {
                        let entry = self.pieces.get(&key).expect("reap entry");
                        entry.blocks.iter().any(|b| {
                            b.is_uninit()
                                || matches!(b.data, BlockData::Reading)
                                || (b.pending && !b.dirty)
                        })
                    };
                    if outstanding {
                        keep.push_back(job);
                    } else {
                        out.push(Completion::ok(job, JobOutput::Done));
                    }
                }
                _ => {
                    // no other job kind attaches as a piece waiter
                    debug_assert!(false, "unexpected waiter: {}", job.kind_name());
                    out.push(Completion::ok(job, JobOutput::Done));
                }
            }
        }

        // sync jobs are handled last, once all references settled
        let refcount = self
            .pieces
            .get(&key)
            .map(|e| e.refcount)
            .unwrap_or(0);
        for job in sync_jobs {
            if refcount == 0 {
                out.push(Completion::ok(job, JobOutput::Done));
            } else {
                keep.push_back(job);
            }
        }

        if let Some(entry) = self.pieces.get_mut(&key) {
            debug_assert!(entry.jobs.is_empty());
            entry.jobs = keep;
        } else {
            debug_assert!(keep.is_empty());
        }
    }

    // ------------------- hashing -------------------

    /// Finds the longest hashable run at the piece's hash cursor and
    /// submits it. If the hasher declines, the run is hashed inline, the
    /// progress applied, and the piece's waiters reaped on the spot.
    pub fn kick_hasher(
        &mut self,
        key: PieceKey,
        hasher: &dyn Hasher,
        out: &mut Vec<Completion>,
    ) {
        if let Some((begin, end)) = self.kick_hasher_inner(key, hasher) {
            self.reap_piece_jobs(key, None, begin, end, true, out);
        }
    }

    fn kick_hasher_inner(
        &mut self,
        key: PieceKey,
        hasher: &dyn Hasher,
    ) -> Option<(BlockIndex, BlockIndex)> {
        let (cursor, end) = {
            let entry = self.pieces.get(&key)?;
            let hash = entry.hash.as_ref()?;
            if entry.hashing.is_some() || hash.offset >= entry.piece_len {
                return None;
            }
            let cursor = (hash.offset / BLOCK_LEN) as usize;
            let mut end = cursor;
            // dirty blocks with writes in flight are still readable; only
            // reads in progress (or absent data) break the run
            while end < entry.blocks.len() {
                let block = &entry.blocks[end];
                match block.bytes() {
                    Some(_) if !block.pending || block.dirty => end += 1,
                    _ => break,
                }
            }
            (cursor, end)
        };
        if end == cursor {
            return None;
        }

        // pin the submitted blocks and take the digest context along
        let (ctx, blocks) = {
            let entry = self.pieces.get_mut(&key).expect("kick target");
            let ctx = entry
                .hash
                .as_mut()
                .and_then(|h| h.ctx.take())
                .expect("idle hash state has its context");
            let blocks: Vec<Bytes> = entry.blocks[cursor..end]
                .iter()
                .map(|b| b.bytes().expect("hashable block").clone())
                .collect();
            for slot in entry.blocks[cursor..end].iter_mut() {
                if slot.refcount == 0 {
                    self.stats.pinned_blocks += 1;
                }
                slot.refcount += 1;
                entry.refcount += 1;
            }
            entry.hashing = Some(cursor);
            (ctx, blocks)
        };

        log::trace!(
            "Hashing piece {} blocks [{}, {})",
            key.1,
            cursor,
            end
        );
        let job = HashJob {
            key,
            begin: cursor,
            end,
            ctx,
            blocks,
        };
        match hasher.async_hash(job) {
            // submitted; a hashing-done job will come back to us
            None => None,
            // the hasher wants it done inline
            Some(job) => {
                let done = job.digest();
                self.apply_hash_done(&done);
                Some((done.begin, done.end))
            }
        }
    }

    /// Puts the advanced digest context back and releases the submitted
    /// range's pins.
    fn apply_hash_done(&mut self, done: &HashDone) {
        {
            let entry = match self.pieces.get_mut(&done.key) {
                Some(entry) => entry,
                None => return,
            };
            debug_assert_eq!(entry.hashing, Some(done.begin));
            entry.hashing = None;
            let piece_len = entry.piece_len;
            if let Some(hash) = entry.hash.as_mut() {
                hash.ctx = Some(done.ctx.clone());
                let new_offset =
                    ((done.end as u32) * BLOCK_LEN).min(piece_len);
                debug_assert!(new_offset >= hash.offset);
                hash.offset = new_offset;
            }
        }
        self.unpin_blocks(done.key, done.begin, done.end);
    }

    /// Handles a hash worker's completion: advances the cursor, reaps
    /// waiters, and keeps the pipeline going if more blocks are ready.
    pub fn hashing_done(
        &mut self,
        done: HashDone,
        hasher: &dyn Hasher,
        out: &mut Vec<Completion>,
    ) {
        if !self.pieces.contains_key(&done.key) {
            log::warn!("Hash completion for unknown piece {:?}", done.key);
            return;
        }
        let key = done.key;
        self.apply_hash_done(&done);
        self.reap_piece_jobs(key, None, done.begin, done.end, true, out);

        // more blocks may have arrived while this range was hashing
        self.kick_hasher(key, hasher, out);

        self.maybe_free_piece(key, out);
    }

    // ------------------- reads -------------------

    /// Tries to serve the range from cache. Counts hits and promotes the
    /// entry on success.
    pub fn try_read(
        &mut self,
        key: PieceKey,
        offset: u32,
        len: u32,
        force_copy: bool,
    ) -> TryRead {
        if !self.contains(&key) {
            return TryRead::Miss;
        }
        let result = self.copy_from_piece(key, offset, len, force_copy);
        if let TryRead::Hit(_) = &result {
            self.touch(key);
            self.stats.blocks_read += 1;
            self.stats.blocks_read_hit += 1;
        }
        result
    }

    /// Copies (or lends) the requested range out of the piece. The range
    /// must be covered by present, non-pending blocks, otherwise it's a
    /// miss.
    fn copy_from_piece(
        &mut self,
        key: PieceKey,
        offset: u32,
        len: u32,
        force_copy: bool,
    ) -> TryRead {
        debug_assert!(len > 0);
        debug_assert!(len <= BLOCK_LEN);
        let first = (offset / BLOCK_LEN) as usize;
        let last = ((offset + len - 1) / BLOCK_LEN) as usize;

        {
            let entry = match self.pieces.get(&key) {
                Some(entry) => entry,
                None => return TryRead::Miss,
            };
            debug_assert!(last < entry.blocks.len());
            for block in &entry.blocks[first..=last] {
                if block.bytes().is_none() || block.pending {
                    return TryRead::Miss;
                }
            }
        }

        if first == last && !force_copy {
            // block aligned single block request: lend the cache block
            // instead of copying it
            let entry = self.pieces.get_mut(&key).expect("hit entry");
            let slot = &mut entry.blocks[first];
            let block_offset = (offset % BLOCK_LEN) as usize;
            let data = slot
                .bytes()
                .expect("checked above")
                .slice(block_offset..block_offset + len as usize);
            if slot.refcount == 0 {
                self.stats.pinned_blocks += 1;
            }
            slot.refcount += 1;
            slot.hitcount = slot.hitcount.saturating_add(1);
            entry.refcount += 1;
            self.stats.send_buffer_blocks += 1;
            return TryRead::Hit(ReadBuf::Shared(BlockRef {
                torrent: key.0,
                piece: key.1,
                block: first,
                data,
            }));
        }

        let mut buf = match self.pool.allocate("send buffer") {
            Some(buf) => buf,
            None => return TryRead::NoMemory,
        };

        let entry = self.pieces.get_mut(&key).expect("hit entry");
        let mut copied = 0usize;
        let mut block_offset = (offset % BLOCK_LEN) as usize;
        let mut remaining = len as usize;
        for i in first..=last {
            let slot = &mut entry.blocks[i];
            let data = slot.bytes().expect("checked above");
            let to_copy = remaining.min(data.len() - block_offset);
            buf[copied..copied + to_copy]
                .copy_from_slice(&data[block_offset..block_offset + to_copy]);
            slot.hitcount = slot.hitcount.saturating_add(1);
            copied += to_copy;
            remaining -= to_copy;
            block_offset = 0;
        }
        debug_assert_eq!(copied, len as usize);
        buf.truncate(len as usize);
        // the copy leaves the disk subsystem with the completion
        let buf = self.pool.detach(buf);
        TryRead::Hit(ReadBuf::Copied(buf))
    }

    /// Returns a zero-copy lease taken out with [`Self::try_read`],
    /// unpinning the block.
    pub fn reclaim_block(
        &mut self,
        bref: BlockRef,
        out: &mut Vec<Completion>,
    ) {
        let key = (bref.torrent, bref.piece);
        let entry = match self.pieces.get_mut(&key) {
            Some(entry) => entry,
            None => {
                log::warn!("Reclaim for unknown piece {:?}", key);
                return;
            }
        };
        let slot = &mut entry.blocks[bref.block];
        debug_assert!(slot.refcount > 0);
        slot.refcount -= 1;
        if slot.refcount == 0 {
            debug_assert!(self.stats.pinned_blocks > 0);
            self.stats.pinned_blocks -= 1;
        }
        debug_assert!(entry.refcount > 0);
        entry.refcount -= 1;
        debug_assert!(self.stats.send_buffer_blocks > 0);
        self.stats.send_buffer_blocks -= 1;
        drop(bref);

        self.maybe_free_piece(key, out);
    }

    // ------------------- eviction -------------------

    /// Tries to free `num` read blocks, oldest first. Which read list is
    /// drained first depends on the last ARC signal. Returns the shortfall
    /// (0 when fully satisfied).
    pub fn try_evict_blocks(
        &mut self,
        mut num: usize,
        ignore: Option<PieceKey>,
    ) -> usize {
        if num == 0 {
            return 0;
        }
        log::debug!("Evicting {} blocks from the read cache", num);

        let order = match self.last_cache_op {
            // a hit on the L1 ghost means L1 deserves more room: shrink L2
            CacheOp::GhostHitL1 => {
                [CacheState::ReadLru2, CacheState::ReadLru1]
            }
            _ => [CacheState::ReadLru1, CacheState::ReadLru2],
        };

        for state in order.iter().copied() {
            if num == 0 {
                break;
            }
            for key in self.list_keys(state) {
                if num == 0 {
                    break;
                }
                if Some(key) == ignore {
                    continue;
                }
                let (empty, all_dirty, refcount, has_hash, has_jobs) = {
                    let entry = &self.pieces[&key];
                    (
                        entry.num_blocks == 0,
                        entry.num_dirty == entry.num_blocks,
                        entry.refcount,
                        entry.hash.is_some(),
                        !entry.jobs.is_empty(),
                    )
                };
                if empty && !has_hash && refcount == 0 && !has_jobs {
                    // a stale entry with no buffers left; drop it entirely
                    self.erase_piece(key);
                    continue;
                }
                if all_dirty {
                    continue;
                }

                let mut freed = Vec::new();
                {
                    let entry = self.pieces.get_mut(&key).expect("entry");
                    for slot in entry.blocks.iter_mut() {
                        if num == 0 {
                            break;
                        }
                        if slot.refcount > 0
                            || slot.dirty
                            || slot.pending
                            || slot.bytes().is_none()
                        {
                            continue;
                        }
                        if let BlockData::Filled(buf) = slot.data.take() {
                            freed.push(buf);
                        }
                        slot.written = false;
                        slot.hitcount = 0;
                        entry.num_blocks -= 1;
                        self.stats.read_cache_size -= 1;
                        num -= 1;
                    }
                }
                self.pool.free_shared_many(freed);

                let (empty, refcount, has_hash, has_jobs) = {
                    let entry = &self.pieces[&key];
                    (
                        entry.num_blocks == 0,
                        entry.refcount,
                        entry.hash.is_some(),
                        !entry.jobs.is_empty(),
                    )
                };
                if empty && !has_hash && refcount == 0 && !has_jobs {
                    self.move_to_ghost(key);
                }
            }
        }
        num
    }

    /// Moves an emptied entry from a read list to its ghost shadow.
    fn move_to_ghost(&mut self, key: PieceKey) {
        let state = self.pieces[&key].cache_state;
        let ghost = match state {
            CacheState::ReadLru1 => CacheState::ReadLru1Ghost,
            CacheState::ReadLru2 => CacheState::ReadLru2Ghost,
            // write pieces and ghosts don't shadow
            _ => return,
        };
        debug_assert_eq!(self.pieces[&key].num_blocks, 0);
        self.set_cache_state(key, ghost);
        self.enforce_ghost_bound();
    }

    /// Keeps the combined ghost list population within the configured
    /// bound by erasing the oldest shadows.
    fn enforce_ghost_bound(&mut self) {
        loop {
            let g1 = self.lists[CacheState::ReadLru1Ghost.index()].len;
            let g2 = self.lists[CacheState::ReadLru2Ghost.index()].len;
            if g1 + g2 <= self.ghost_size {
                break;
            }
            // ghosts never carry buffers, pins, or waiters, so the oldest
            // one of the longer list can always go
            let victim_list = if g1 >= g2 {
                CacheState::ReadLru1Ghost
            } else {
                CacheState::ReadLru2Ghost
            };
            let victim = self.lists[victim_list.index()]
                .head
                .expect("nonempty ghost list");
            self.erase_piece(victim);
        }
    }

    /// Frees all unreferenced blocks of the piece. If nothing pins the
    /// entry it is removed outright and true is returned.
    pub fn evict_piece(&mut self, key: PieceKey) -> bool {
        let mut freed_bytes = Vec::new();
        let mut freed_vecs = Vec::new();
        {
            let entry = match self.pieces.get_mut(&key) {
                Some(entry) => entry,
                None => return true,
            };
            for slot in entry.blocks.iter_mut() {
                if !slot.has_buf() || slot.refcount > 0 {
                    continue;
                }
                debug_assert!(!slot.pending);
                match slot.data.take() {
                    BlockData::Filled(buf) => freed_bytes.push(buf),
                    BlockData::Uninit(buf) => freed_vecs.push(buf),
                    // an orphaned in-flight slot; its buffer was already
                    // released on the error path
                    BlockData::Reading => {}
                    BlockData::None => continue,
                }
                entry.num_blocks -= 1;
                if slot.dirty {
                    slot.dirty = false;
                    entry.num_dirty -= 1;
                    self.stats.write_cache_size -= 1;
                } else {
                    self.stats.read_cache_size -= 1;
                }
                slot.written = false;
                slot.hitcount = 0;
            }
        }
        self.pool.free_shared_many(freed_bytes);
        self.pool.free_many(freed_vecs);

        let entry = self.pieces.get(&key).expect("evicted entry");
        if entry.refcount == 0 {
            debug_assert!(entry.jobs.is_empty());
            self.erase_piece(key);
            true
        } else {
            self.update_cache_state(key);
            false
        }
    }

    /// Marks the piece for removal; it goes away now if nothing references
    /// it, or as soon as its last pin drops.
    pub fn mark_for_deletion(&mut self, key: PieceKey) {
        if !self.evict_piece(key) {
            self.pieces
                .get_mut(&key)
                .expect("marked entry")
                .marked_for_deletion = true;
        }
    }

    /// Unlinks and drops an entry. The entry must hold no buffers, pins,
    /// or waiters.
    fn erase_piece(&mut self, key: PieceKey) {
        let state = self.pieces[&key].cache_state;
        debug_assert_eq!(self.pieces[&key].num_blocks, 0);
        debug_assert_eq!(self.pieces[&key].refcount, 0);
        debug_assert!(self.pieces[&key].jobs.is_empty());
        self.list_remove(state, key);
        self.pieces.remove(&key);
        if let Some(pieces) = self.storage_pieces.get_mut(&key.0) {
            pieces.remove(&key.1);
        }
    }

    /// Frees the piece's unreferenced dirty blocks and fails its queued
    /// write jobs. Used when a torrent's pending data is being thrown away.
    pub fn abort_dirty(&mut self, key: PieceKey, out: &mut Vec<Completion>) {
        let mut freed = Vec::new();
        {
            let entry = match self.pieces.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            for slot in entry.blocks.iter_mut() {
                if !slot.dirty || slot.refcount > 0 {
                    continue;
                }
                debug_assert!(!slot.pending);
                if let BlockData::Filled(buf) = slot.data.take() {
                    freed.push(buf);
                }
                slot.dirty = false;
                entry.num_blocks -= 1;
                entry.num_dirty -= 1;
                self.stats.write_cache_size -= 1;
            }
        }
        self.pool.free_shared_many(freed);
        self.update_cache_state(key);

        let entry = self.pieces.get_mut(&key).expect("entry");
        let jobs = mem::take(&mut entry.jobs);
        for job in jobs {
            if matches!(job.kind, JobKind::Write { .. }) {
                out.push(Completion::failed(job, JobError::Aborted));
            } else {
                entry.jobs.push_back(job);
            }
        }
    }

    /// If the piece is marked for deletion and nothing pins it anymore,
    /// complete its sync waiters and remove it. Returns true if the entry
    /// was removed and the torrent has no cached pieces left.
    pub fn maybe_free_piece(
        &mut self,
        key: PieceKey,
        out: &mut Vec<Completion>,
    ) -> bool {
        let (refcount, marked) = match self.pieces.get(&key) {
            Some(entry) => (entry.refcount, entry.marked_for_deletion),
            None => return false,
        };
        if refcount > 0 || !marked {
            return false;
        }

        // the last reference just dropped: sync waiters complete, anything
        // else left behind is aborted with the piece
        let jobs = mem::take(&mut self.pieces.get_mut(&key).expect("entry").jobs);
        for job in jobs {
            if matches!(job.kind, JobKind::SyncPiece { .. }) {
                out.push(Completion::ok(job, JobOutput::Done));
            } else {
                out.push(Completion::failed(job, JobError::Aborted));
            }
        }

        let removed = self.evict_piece(key);
        debug_assert!(removed);
        removed && self.num_storage_pieces(key.0) == 0
    }

    /// Cancels queued write jobs whose target blocks aren't already being
    /// written, then evicts the piece.
    pub fn clear_piece(&mut self, key: PieceKey, out: &mut Vec<Completion>) {
        {
            let entry = match self.pieces.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            let jobs = mem::take(&mut entry.jobs);
            let mut keep = VecDeque::new();
            for job in jobs {
                let (first, last) = match &job.kind {
                    JobKind::Write { offset, len, .. } => (
                        (offset / BLOCK_LEN) as usize,
                        ((offset + len - 1) / BLOCK_LEN) as usize,
                    ),
                    _ => {
                        keep.push_back(job);
                        continue;
                    }
                };
                if entry.blocks[first].pending || entry.blocks[last].pending {
                    // already on its way to disk; let it finish
                    keep.push_back(job);
                } else {
                    out.push(Completion::failed(job, JobError::Aborted));
                }
            }
            entry.jobs = keep;
        }
        self.mark_for_deletion(key);
    }

    /// Tears the whole cache down, failing every remaining waiter. Used at
    /// shutdown after in-flight IO has drained.
    pub fn clear(&mut self, out: &mut Vec<Completion>) {
        let keys = self.all_piece_keys();
        for key in keys {
            let jobs = mem::take(
                &mut self.pieces.get_mut(&key).expect("entry").jobs,
            );
            for job in jobs {
                out.push(Completion::failed(job, JobError::Aborted));
            }

            let mut freed_bytes = Vec::new();
            let mut freed_vecs = Vec::new();
            {
                let entry = self.pieces.get_mut(&key).expect("entry");
                for slot in entry.blocks.iter_mut() {
                    slot.pending = false;
                    slot.dirty = false;
                    slot.refcount = 0;
                    match slot.data.take() {
                        BlockData::Filled(buf) => freed_bytes.push(buf),
                        BlockData::Uninit(buf) => freed_vecs.push(buf),
                        BlockData::None | BlockData::Reading => {}
                    }
                }
                entry.num_blocks = 0;
                entry.num_dirty = 0;
                entry.refcount = 0;
            }
            self.pool.free_shared_many(freed_bytes);
            self.pool.free_many(freed_vecs);
            self.erase_piece(key);
        }
        for pieces in self.storage_pieces.values_mut() {
            pieces.clear();
        }
        self.stats.read_cache_size = 0;
        self.stats.write_cache_size = 0;
        self.stats.pinned_blocks = 0;
    }

    /// Flags that a block past the hash cursor is being flushed; hashing
    /// this piece will need to read flushed blocks back.
    pub fn set_need_readback(&mut self, key: PieceKey) {
        if let Some(entry) = self.pieces.get_mut(&key) {
            entry.need_readback = true;
        }
    }

    // ------------------- invariants -------------------

    /// Validates the cache's internal consistency. Debug builds call this
    /// from the disk task; tests call it after every mutation batch.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariant(&self) {
        let mut read_blocks = 0;
        let mut write_blocks = 0;
        let mut pinned = 0;

        for (key, entry) in &self.pieces {
            assert_eq!(*key, entry.key);
            let mut num_blocks = 0;
            let mut num_dirty = 0;
            let mut refcount = 0;
            for block in entry.blocks.iter() {
                if block.has_buf() {
                    num_blocks += 1;
                    if block.dirty {
                        num_dirty += 1;
                        write_blocks += 1;
                    } else {
                        read_blocks += 1;
                    }
                } else {
                    assert!(!block.dirty);
                    assert!(!block.pending);
                    assert_eq!(block.refcount, 0);
                }
                if block.pending {
                    assert!(block.refcount >= 1);
                }
                if block.refcount > 0 {
                    pinned += 1;
                }
                refcount += block.refcount as usize;
            }
            assert_eq!(num_blocks, entry.num_blocks, "piece {:?}", key);
            assert_eq!(num_dirty, entry.num_dirty, "piece {:?}", key);
            assert_eq!(refcount, entry.refcount, "piece {:?}", key);
            assert!(entry.num_dirty <= entry.num_blocks);
            if entry.cache_state.is_ghost() {
                assert_eq!(entry.num_blocks, 0, "ghost with blocks: {:?}", key);
            }
            if let Some(hash) = &entry.hash {
                assert!(hash.offset <= entry.piece_len);
            }
        }

        assert_eq!(read_blocks, self.stats.read_cache_size);
        assert_eq!(write_blocks, self.stats.write_cache_size);
        assert_eq!(pinned, self.stats.pinned_blocks);
        assert!(
            self.stats.read_cache_size + self.stats.write_cache_size
                <= self.pool.in_use()
        );

        // every entry sits in exactly one list, and that list matches its
        // state
        let mut seen = 0;
        for state in [
            CacheState::WriteLru,
            CacheState::ReadLru1,
            CacheState::ReadLru1Ghost,
            CacheState::ReadLru2,
            CacheState::ReadLru2Ghost,
        ]
        .iter()
        .copied()
        {
            let keys = self.list_keys(state);
            assert_eq!(keys.len(), self.lists[state.index()].len);
            for key in keys {
                assert_eq!(self.pieces[&key].cache_state, state);
                seen += 1;
            }
        }
        assert_eq!(seen, self.pieces.len());
    }
}

/// Pulls the target coordinates out of a write job.
fn write_job_target(job: &Job) -> (PieceIndex, u32, u32) {
    match &job.kind {
        JobKind::Write {
            piece, offset, len, ..
        } => (*piece, *offset, *len),
        _ => unreachable!("write job expected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::WorkerHasher;
    use sha1::Sha1;
    use tokio::sync::mpsc;

    const TORRENT: TorrentId = 0;
    // four block pieces unless a test says otherwise
    const PIECE_LEN: u32 = 4 * BLOCK_LEN;

    fn setup(limit: usize) -> (BlockCache, WorkerHasher) {
        let pool = Arc::new(BufferPool::new(BLOCK_LEN as usize, limit));
        let mut cache = BlockCache::new(Arc::clone(&pool));
        cache.add_torrent(TORRENT);
        // zero threads: everything hashes inline, no runtime needed
        let (chan, _) = mpsc::unbounded_channel();
        (cache, WorkerHasher::new(0, chan))
    }

    fn read_job(piece: PieceIndex, offset: u32, len: u32, force_copy: bool) -> Job {
        Job::new(
            Some(TORRENT),
            JobKind::Read {
                piece,
                offset,
                len,
                force_copy,
            },
        )
    }

    fn write_job(piece: PieceIndex, offset: u32, len: u32) -> Job {
        Job::new(
            Some(TORRENT),
            JobKind::Write {
                piece,
                offset,
                len,
                buf: None,
            },
        )
    }

    /// Pulls a piece's first `count` blocks into the read cache through the
    /// full populate pipeline, filling block `i` with the byte `fill[i]`.
    fn prime_read_piece(
        cache: &mut BlockCache,
        hasher: &dyn Hasher,
        piece: PieceIndex,
        piece_len: u32,
        fill: &[u8],
    ) {
        let key = (TORRENT, piece);
        cache.allocate_piece(key, piece_len, CacheState::ReadLru1);
        let count = fill.len();
        // a cache-piece waiter completes without needing a send buffer,
        // which keeps tight-limit tests deterministic
        let job = Job::new(Some(TORRENT), JobKind::CachePiece { piece });
        let staged = cache
            .allocate_pending(key, 0, count, job, 0, true)
            .expect("allocate_pending");
        assert_eq!(staged, count);
        for (i, byte) in fill.iter().enumerate() {
            let mut buf = cache.stage_read_block(key, i).expect("staged block");
            for b in buf.iter_mut() {
                *b = *byte;
            }
            cache.install_read_block(key, i, buf);
        }
        let mut out = Vec::new();
        cache.mark_as_done(key, 0, count, None, hasher, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].result.is_ok());
        cache.check_invariant();
    }

    /// Installs a dirty block through the write path, like do_write does.
    fn put_dirty_block(
        cache: &mut BlockCache,
        hasher: &dyn Hasher,
        piece: PieceIndex,
        piece_len: u32,
        block: BlockIndex,
        byte: u8,
        out: &mut Vec<Completion>,
    ) {
        let key = (TORRENT, piece);
        let len = block_len(piece_len, block);
        let buf = Bytes::from(vec![byte; len as usize]);
        cache.pool().adopt();
        let job = write_job(piece, block as u32 * BLOCK_LEN, len);
        cache.add_dirty_block(key, piece_len, block, buf, job, hasher, out);
        cache.check_invariant();
    }

    #[test]
    fn test_zero_copy_hit_pins_block_until_reclaim() {
        let (mut cache, hasher) = setup(16);
        prime_read_piece(&mut cache, &hasher, 5, PIECE_LEN, &[0xAA]);
        let key = (TORRENT, 5);

        let hits_before = cache.stats().blocks_read_hit;
        let bref = match cache.try_read(key, 0, BLOCK_LEN, false) {
            TryRead::Hit(ReadBuf::Shared(bref)) => bref,
            _ => panic!("expected a zero-copy hit"),
        };
        assert_eq!(bref.data().len(), BLOCK_LEN as usize);
        assert!(bref.data().iter().all(|b| *b == 0xAA));
        assert_eq!(cache.stats().pinned_blocks, 1);
        assert_eq!(cache.stats().send_buffer_blocks, 1);
        assert_eq!(cache.stats().blocks_read_hit, hits_before + 1);
        assert_eq!(cache.entry(&key).unwrap().blocks[0].hitcount, 1);
        cache.check_invariant();

        // while the lease is out, the block cannot be evicted
        assert_eq!(cache.try_evict_blocks(1, None), 1);

        let mut out = Vec::new();
        cache.reclaim_block(bref, &mut out);
        assert!(out.is_empty());
        assert_eq!(cache.stats().pinned_blocks, 0);
        assert_eq!(cache.stats().send_buffer_blocks, 0);
        cache.check_invariant();

        // with the pin gone the block is evictable again
        assert_eq!(cache.try_evict_blocks(1, None), 0);
    }

    #[test]
    fn test_copied_read_crosses_block_boundary() {
        let (mut cache, hasher) = setup(16);
        prime_read_piece(&mut cache, &hasher, 0, PIECE_LEN, &[0x01, 0x02]);
        let key = (TORRENT, 0);

        let half = BLOCK_LEN / 2;
        let buf = match cache.try_read(key, half, BLOCK_LEN, false) {
            TryRead::Hit(ReadBuf::Copied(buf)) => buf,
            _ => panic!("expected a copied hit"),
        };
        assert_eq!(buf.len(), BLOCK_LEN as usize);
        assert!(buf[..half as usize].iter().all(|b| *b == 0x01));
        assert!(buf[half as usize..].iter().all(|b| *b == 0x02));
        // nothing was pinned for a copy
        assert_eq!(cache.stats().pinned_blocks, 0);
        cache.check_invariant();
    }

    #[test]
    fn test_force_copy_never_lends() {
        let (mut cache, hasher) = setup(16);
        prime_read_piece(&mut cache, &hasher, 0, PIECE_LEN, &[0x11]);
        match cache.try_read((TORRENT, 0), 0, BLOCK_LEN, true) {
            TryRead::Hit(ReadBuf::Copied(_)) => {}
            _ => panic!("force_copy must produce a copy"),
        }
        assert_eq!(cache.stats().pinned_blocks, 0);
    }

    #[test]
    fn test_read_of_absent_piece_misses() {
        let (mut cache, _) = setup(16);
        assert!(matches!(
            cache.try_read((TORRENT, 3), 0, BLOCK_LEN, false),
            TryRead::Miss
        ));
    }

    #[test]
    fn test_dirty_block_flush_completes_write_job() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 1);
        let mut out = Vec::new();
        put_dirty_block(&mut cache, &hasher, 1, PIECE_LEN, 0, 0xBC, &mut out);
        assert!(out.is_empty(), "write completes only after the flush");
        assert_eq!(cache.stats().write_cache_size, 1);
        assert_eq!(cache.entry(&key).unwrap().cache_state, CacheState::WriteLru);

        let staged = cache.stage_write_block(key, 0).expect("dirty block");
        assert_eq!(staged.len(), BLOCK_LEN as usize);
        // a pending dirty block cannot be staged twice
        assert!(cache.stage_write_block(key, 0).is_none());
        cache.check_invariant();

        cache.mark_as_done(key, 0, 1, None, &hasher, &mut out);
        assert_eq!(out.len(), 1);
        match &out[0].result {
            Ok(JobOutput::Written { piece, offset, len }) => {
                assert_eq!((*piece, *offset, *len), (1, 0, BLOCK_LEN));
            }
            other => panic!("unexpected write completion: {:?}", other.is_ok()),
        }

        let entry = cache.entry(&key).unwrap();
        assert_eq!(entry.num_dirty, 0);
        assert!(entry.blocks[0].written);
        // with no dirty data and no hash the entry left the write list
        assert_eq!(entry.cache_state, CacheState::ReadLru1);
        assert_eq!(cache.stats().blocks_written, 1);
        cache.check_invariant();
    }

    #[test]
    fn test_write_then_read_yields_written_data() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 2);
        let mut out = Vec::new();
        put_dirty_block(&mut cache, &hasher, 2, PIECE_LEN, 0, 0x42, &mut out);
        cache.stage_write_block(key, 0).unwrap();
        cache.mark_as_done(key, 0, 1, None, &hasher, &mut out);

        // the flushed block remains servable from cache
        match cache.try_read(key, 0, BLOCK_LEN, true) {
            TryRead::Hit(ReadBuf::Copied(buf)) => {
                assert!(buf.iter().all(|b| *b == 0x42));
            }
            _ => panic!("expected a hit on the written block"),
        }
    }

    #[test]
    fn test_eviction_strips_oldest_and_ghosts_entry() {
        let (mut cache, hasher) = setup(4);
        // fill the cache with two clean two-block pieces
        prime_read_piece(&mut cache, &hasher, 0, 2 * BLOCK_LEN, &[1, 1]);
        prime_read_piece(&mut cache, &hasher, 1, 2 * BLOCK_LEN, &[2, 2]);
        assert_eq!(cache.pool().in_use(), 4);

        // a new piece needs two blocks; the oldest piece is stripped
        let key = (TORRENT, 2);
        cache.allocate_piece(key, 2 * BLOCK_LEN, CacheState::ReadLru1);
        let job = read_job(2, 0, BLOCK_LEN, true);
        let staged = cache
            .allocate_pending(key, 0, 2, job, 0, true)
            .expect("eviction should have made room");
        assert_eq!(staged, 2);
        assert!(cache.pool().in_use() <= 4 + 1);

        let oldest = cache.entry(&(TORRENT, 0)).unwrap();
        assert_eq!(oldest.num_blocks, 0);
        assert!(oldest.cache_state.is_ghost());
        // the younger piece was not touched
        assert_eq!(cache.entry(&(TORRENT, 1)).unwrap().num_blocks, 2);
        cache.check_invariant();
    }

    #[test]
    fn test_ghost_hit_resurrects_into_l2() {
        let (mut cache, hasher) = setup(4);
        prime_read_piece(&mut cache, &hasher, 0, 2 * BLOCK_LEN, &[1, 1]);
        // strip it to a ghost
        assert_eq!(cache.try_evict_blocks(2, None), 0);
        assert!(cache
            .entry(&(TORRENT, 0))
            .unwrap()
            .cache_state
            .is_ghost());

        // a renewed interest in the piece is an ARC ghost hit
        cache.allocate_piece((TORRENT, 0), 2 * BLOCK_LEN, CacheState::ReadLru1);
        assert_eq!(
            cache.entry(&(TORRENT, 0)).unwrap().cache_state,
            CacheState::ReadLru2
        );
        cache.check_invariant();
    }

    #[test]
    fn test_repeat_hit_promotes_l1_to_l2() {
        let (mut cache, hasher) = setup(16);
        prime_read_piece(&mut cache, &hasher, 0, PIECE_LEN, &[7]);
        assert_eq!(
            cache.entry(&(TORRENT, 0)).unwrap().cache_state,
            CacheState::ReadLru1
        );
        match cache.try_read((TORRENT, 0), 0, BLOCK_LEN, true) {
            TryRead::Hit(_) => {}
            _ => panic!("expected hit"),
        }
        assert_eq!(
            cache.entry(&(TORRENT, 0)).unwrap().cache_state,
            CacheState::ReadLru2
        );
    }

    #[test]
    fn test_allocate_pending_out_of_space_and_memory() {
        let (mut cache, hasher) = setup(2);
        prime_read_piece(&mut cache, &hasher, 0, 2 * BLOCK_LEN, &[9, 9]);

        // pin both blocks so eviction cannot free anything
        let lease_a = match cache.try_read((TORRENT, 0), 0, BLOCK_LEN, false) {
            TryRead::Hit(ReadBuf::Shared(bref)) => bref,
            _ => panic!("expected lease"),
        };
        let lease_b = match cache.try_read((TORRENT, 0), BLOCK_LEN, BLOCK_LEN, false)
        {
            TryRead::Hit(ReadBuf::Shared(bref)) => bref,
            _ => panic!("expected lease"),
        };

        let key = (TORRENT, 1);
        cache.allocate_piece(key, 2 * BLOCK_LEN, CacheState::ReadLru1);

        // a low priority request without force is told to bypass the cache
        let job = read_job(1, 0, BLOCK_LEN, true);
        let (job, err) = cache
            .allocate_pending(key, 0, 2, job, 0, false)
            .expect_err("no room in the cache");
        assert_eq!(err, PendingError::NoSpace);

        // forcing shrinks the request but the pool is exhausted too
        let (_, err) = cache
            .allocate_pending(key, 0, 2, job, 0, true)
            .expect_err("pool is exhausted");
        assert_eq!(err, PendingError::NoMemory);

        let mut out = Vec::new();
        cache.reclaim_block(lease_a, &mut out);
        cache.reclaim_block(lease_b, &mut out);
        cache.check_invariant();
    }

    #[test]
    fn test_read_error_fails_all_waiters() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 0);
        cache.allocate_piece(key, PIECE_LEN, CacheState::ReadLru1);

        // two read jobs wait on the same pending range
        let staged = cache
            .allocate_pending(key, 0, 2, read_job(0, 0, BLOCK_LEN, true), 0, true)
            .unwrap();
        assert_eq!(staged, 2);
        let staged = cache
            .allocate_pending(
                key,
                0,
                1,
                read_job(0, 0, BLOCK_LEN / 2, true),
                0,
                true,
            )
            .unwrap();
        assert_eq!(staged, 0, "blocks already scheduled");
        assert_eq!(cache.entry(&key).unwrap().jobs.len(), 2);

        // the chain is issued and fails with an IO error
        let buf_a = cache.stage_read_block(key, 0).unwrap();
        let buf_b = cache.stage_read_block(key, 1).unwrap();
        cache.pool().free_many(vec![buf_a, buf_b]);
        cache.check_invariant();

        let error = JobError::Io(Arc::new(crate::error::StorageError::new(
            std::io::Error::new(std::io::ErrorKind::Other, "eio"),
        )));
        let mut out = Vec::new();
        cache.mark_as_done(key, 0, 2, Some(&error), &hasher, &mut out);

        assert_eq!(out.len(), 2);
        for completion in &out {
            assert!(matches!(completion.result, Err(JobError::Io(_))));
        }
        // the failed blocks are gone and the piece is eligible for eviction
        let entry = cache.entry(&key).unwrap();
        assert_eq!(entry.num_blocks, 0);
        assert_eq!(entry.refcount, 0);
        assert!(entry.jobs.is_empty());
        cache.check_invariant();
    }

    #[test]
    fn test_hash_advances_inline_and_finalizes_on_flush() {
        let (mut cache, hasher) = setup(16);
        let piece_len = 2 * BLOCK_LEN;
        let key = (TORRENT, 0);
        let mut out = Vec::new();

        // hashing is set up before the first block arrives, as do_write does
        cache.allocate_piece(key, piece_len, CacheState::ReadLru1);
        cache.ensure_hash_state(key);
        assert_eq!(cache.entry(&key).unwrap().cache_state, CacheState::WriteLru);

        put_dirty_block(&mut cache, &hasher, 0, piece_len, 0, 0xA1, &mut out);
        // the inline hasher chewed through the first block already
        assert_eq!(cache.entry(&key).unwrap().hash.as_ref().unwrap().offset, BLOCK_LEN);

        put_dirty_block(&mut cache, &hasher, 0, piece_len, 1, 0xB2, &mut out);
        assert_eq!(
            cache.entry(&key).unwrap().hash.as_ref().unwrap().offset,
            piece_len
        );
        assert!(out.is_empty());

        // a hash job arriving now finds everything hashed; it finalizes on
        // the next reap
        cache.attach_job(
            key,
            Job::new(
                Some(TORRENT),
                JobKind::Hash {
                    piece: 0,
                    volatile_read: false,
                    cursor: cache.entry(&key).unwrap().blocks_in_piece(),
                },
            ),
        );

        cache.stage_write_block(key, 0).unwrap();
        cache.stage_write_block(key, 1).unwrap();
        cache.mark_as_done(key, 0, 2, None, &hasher, &mut out);

        let mut digest = None;
        let mut writes = 0;
        for completion in out {
            match completion.result.expect("no failures expected") {
                JobOutput::Hashed { digest: d, .. } => digest = Some(d),
                JobOutput::Written { .. } => writes += 1,
                other => panic!("unexpected output: {:?}", matches!(other, JobOutput::Done)),
            }
        }
        assert_eq!(writes, 2);

        let mut expected = Sha1::new();
        expected.update(&vec![0xA1u8; BLOCK_LEN as usize]);
        expected.update(&vec![0xB2u8; BLOCK_LEN as usize]);
        let expected: Sha1Hash = expected.finalize().into();
        assert_eq!(digest.expect("hash completion"), expected);

        // hash state is gone and the drained piece left the write list
        let entry = cache.entry(&key).unwrap();
        assert!(entry.hash.is_none());
        assert_eq!(entry.cache_state, CacheState::ReadLru1);
        cache.check_invariant();
    }

    #[test]
    fn test_sync_piece_waits_for_pins_to_drain() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 0);
        let mut out = Vec::new();
        put_dirty_block(&mut cache, &hasher, 0, PIECE_LEN, 0, 0x77, &mut out);
        cache.stage_write_block(key, 0).unwrap();

        cache.attach_job(
            key,
            Job::new(Some(TORRENT), JobKind::SyncPiece { piece: 0 }),
        );

        cache.mark_as_done(key, 0, 1, None, &hasher, &mut out);
        let kinds: Vec<bool> = out
            .iter()
            .map(|c| matches!(c.job.kind, JobKind::SyncPiece { .. }))
            .collect();
        // both the write and the sync completed, sync after the write
        assert_eq!(out.len(), 2);
        assert_eq!(kinds, vec![false, true]);
        cache.check_invariant();
    }

    #[test]
    fn test_clear_piece_aborts_unissued_writes() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 0);
        let mut out = Vec::new();
        put_dirty_block(&mut cache, &hasher, 0, PIECE_LEN, 0, 1, &mut out);
        put_dirty_block(&mut cache, &hasher, 0, PIECE_LEN, 1, 2, &mut out);

        // only block 0 is being written
        cache.stage_write_block(key, 0).unwrap();

        cache.clear_piece(key, &mut out);
        // the write job for block 1 was aborted, block 0's is still in
        // flight
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].result, Err(JobError::Aborted)));
        let entry = cache.entry(&key).unwrap();
        assert!(entry.marked_for_deletion);
        assert_eq!(entry.jobs.len(), 1);
        cache.check_invariant();

        // once the in-flight write completes the piece goes away for good
        out.clear();
        cache.mark_as_done(key, 0, 1, None, &hasher, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].result.is_ok());
        assert!(cache.entry(&key).is_none());
        assert_eq!(cache.num_storage_pieces(TORRENT), 0);
        cache.check_invariant();
    }

    #[test]
    fn test_clear_fails_remaining_waiters() {
        let (mut cache, hasher) = setup(16);
        let key = (TORRENT, 0);
        cache.allocate_piece(key, PIECE_LEN, CacheState::ReadLru1);
        cache
            .allocate_pending(key, 0, 1, read_job(0, 0, BLOCK_LEN, true), 0, true)
            .unwrap();
        // drop the staged buffer as a failed shutdown path would
        let buf = cache.stage_read_block(key, 0).unwrap();
        cache.pool().free(buf);

        let mut out = Vec::new();
        cache.clear(&mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].result, Err(JobError::Aborted)));
        assert!(cache.all_piece_keys().is_empty());
        let _ = hasher;
    }
}
