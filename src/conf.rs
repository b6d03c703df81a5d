//! This module defines types used to configure the disk task and its parts.

use std::time::Duration;

/// The algorithm used to pick which dirty blocks to flush when the write
/// cache needs draining.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheAlgorithm {
    /// Scan the write LRU and flush the longest runs of contiguous dirty
    /// blocks, at least `write_cache_line_size` blocks long.
    LargestContiguous,
    /// Scan the write LRU and flush only the dirty prefix that has already
    /// been incorporated into the piece's running hash, so that no flushed
    /// block needs to be read back later for hashing.
    AvoidReadback,
}

/// The configuration of the disk task.
///
/// All sizes denominated in blocks refer to blocks of [`crate::BLOCK_LEN`]
/// bytes.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// The number of blocks the cache may hold, across all torrents. `None`
    /// auto-sizes to an eighth of physical RAM, or 1024 blocks if the amount
    /// of RAM cannot be determined. A value of 0 disables caching: reads and
    /// writes go straight to storage.
    pub cache_size: Option<usize>,

    /// Dirty blocks older than this are flushed by the periodic expiry
    /// sweep, even if they don't otherwise satisfy the flush conditions.
    pub cache_expiry: Duration,

    /// The number of blocks a cache miss reads ahead, clamped to the end of
    /// the piece.
    pub read_cache_line_size: usize,

    /// The minimum number of contiguous dirty blocks needed before a piece
    /// is flushed (outside of cache pressure and expiry).
    pub write_cache_line_size: usize,

    /// Which write-back algorithm to use.
    pub disk_cache_algorithm: CacheAlgorithm,

    /// Whether read blocks are cached at all. When disabled, reads bypass
    /// the cache entirely.
    pub use_read_cache: bool,

    /// When enabled, cache misses do not populate the read cache on their
    /// own; only explicit cache-piece jobs do.
    pub explicit_read_cache: bool,

    /// When enabled, pieces read for hash verification are dropped from the
    /// cache as soon as the hash completes, on the assumption that no other
    /// peer will request them.
    pub volatile_read_cache: bool,

    /// When enabled, cache pressure never triggers write-back; only read
    /// blocks are evicted. Dirty blocks then only leave via expiry or
    /// explicit flushes.
    pub dont_flush_write_cache: bool,

    /// Disables piece hashing entirely. Hash jobs complete immediately with
    /// a zero digest.
    pub disable_hash_checks: bool,

    /// Whether the issue queue may be elevator-sorted by physical disk
    /// offset. Only meaningful for the synchronous backend.
    pub allow_reordered_disk_operations: bool,

    /// The number of file handles kept open by the storage layer.
    pub file_pool_size: usize,

    /// The number of concurrent blocking IO operations issued to storage.
    pub aio_threads: usize,

    /// The number of concurrent piece hashing operations.
    pub hashing_threads: usize,

    /// Hint the OS to deprioritize disk IO issued by this task.
    pub low_prio_disk: bool,

    /// Lock cache blocks into physical memory (best effort).
    pub lock_disk_cache: bool,

    /// Open files without updating their access time.
    pub no_atime_storage: bool,

    /// Hint for storage backends to copy adjacent read blocks into one
    /// contiguous buffer instead of relying on vectored IO.
    pub coalesce_reads: bool,

    /// Hint for storage backends to copy adjacent dirty blocks into one
    /// contiguous buffer instead of relying on vectored IO.
    pub coalesce_writes: bool,
}

impl DiskConf {
    /// The fraction of the cache size given to each pair of ARC ghost lists.
    pub(crate) const GHOST_LIST_DIVISOR: usize = 4;

    /// Resolves the configured cache size to a concrete block count, using
    /// the given amount of physical RAM (in bytes) when auto-sizing.
    pub(crate) fn resolved_cache_size(&self, physical_ram: u64) -> usize {
        match self.cache_size {
            Some(size) => size,
            // if we don't know how much RAM we have, just set the cache size
            // to 16 MiB (1024 blocks)
            None if physical_ram == 0 => 1024,
            None => (physical_ram / 8 / crate::BLOCK_LEN as u64) as usize,
        }
    }
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            cache_size: None,
            cache_expiry: Duration::from_secs(300),
            read_cache_line_size: 32,
            write_cache_line_size: 32,
            disk_cache_algorithm: CacheAlgorithm::AvoidReadback,
            use_read_cache: true,
            explicit_read_cache: false,
            volatile_read_cache: false,
            dont_flush_write_cache: false,
            disable_hash_checks: false,
            allow_reordered_disk_operations: true,
            file_pool_size: 40,
            aio_threads: 4,
            hashing_threads: 1,
            low_prio_disk: true,
            lock_disk_cache: false,
            no_atime_storage: true,
            coalesce_reads: false,
            coalesce_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_cache_size() {
        let mut conf = DiskConf::default();

        // auto-sizing with known RAM: an eighth of RAM worth of blocks
        let ram = 8 * 1024 * 1024 * 1024u64;
        assert_eq!(
            conf.resolved_cache_size(ram),
            (ram / 8 / crate::BLOCK_LEN as u64) as usize
        );

        // auto-sizing with unknown RAM falls back to 1024 blocks
        assert_eq!(conf.resolved_cache_size(0), 1024);

        // explicit sizes are taken as is
        conf.cache_size = Some(77);
        assert_eq!(conf.resolved_cache_size(ram), 77);
    }
}
