//! Piece hashing offloaded from the disk task.
//!
//! The block cache submits contiguous block runs here as they become
//! available; the digest context travels to a blocking worker and back, so
//! the disk task never hashes on its own thread unless hashing is configured
//! to run inline (zero hashing threads).

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use {
    bytes::Bytes,
    sha1::{Digest, Sha1},
    tokio::{sync::mpsc::UnboundedSender, task},
};

use crate::{BlockIndex, PieceKey};

/// The interim state of a piece hash in progress.
///
/// The byte cursor only ever advances; each block contributes to the digest
/// exactly once, in order.
pub(crate) struct PartialHash {
    /// The number of bytes of the piece that have been hashed so far.
    pub offset: u32,
    /// The sha-1 context, present whenever no hash operation is in flight
    /// for the piece. While a worker owns the context this is `None`.
    pub ctx: Option<Sha1>,
}

impl PartialHash {
    pub fn new() -> Self {
        Self {
            offset: 0,
            ctx: Some(Sha1::new()),
        }
    }
}

/// A block range handed to the hasher, together with the digest context it
/// should fold the blocks into.
pub(crate) struct HashJob {
    pub key: PieceKey,
    /// The first block of the range being hashed.
    pub begin: BlockIndex,
    /// One past the last block of the range.
    pub end: BlockIndex,
    pub ctx: Sha1,
    /// The block payloads for `[begin, end)`, sliced to their exact lengths.
    pub blocks: Vec<Bytes>,
}

impl HashJob {
    /// Folds the blocks into the context, producing the completion message.
    pub fn digest(mut self) -> HashDone {
        debug_assert_eq!(self.blocks.len(), self.end - self.begin);
        for block in &self.blocks {
            self.ctx.update(&block[..]);
        }
        HashDone {
            key: self.key,
            begin: self.begin,
            end: self.end,
            ctx: self.ctx,
        }
    }
}

/// Posted back to the disk task when a hash job finishes.
pub(crate) struct HashDone {
    pub key: PieceKey,
    pub begin: BlockIndex,
    pub end: BlockIndex,
    /// The advanced digest context, to be put back into the piece's partial
    /// hash state.
    pub ctx: Sha1,
}

/// The interface the block cache submits hash work through.
pub(crate) trait Hasher {
    /// Submits a block range for asynchronous hashing. If the job could not
    /// be taken (hashing is configured inline), it is handed back and the
    /// caller must digest it on the spot.
    fn async_hash(&self, job: HashJob) -> Option<HashJob>;

    /// Called by the completion path when a hash job's result has been
    /// processed.
    fn hash_job_done(&self);

    /// The number of submitted jobs not yet completed.
    fn num_pending_jobs(&self) -> usize;
}

/// Hashes on the blocking thread pool, with at most a configured number of
/// jobs in flight; excess submissions queue up and are started as running
/// jobs complete.
pub(crate) struct WorkerHasher {
    threads: Cell<usize>,
    pending: Cell<usize>,
    backlog: RefCell<VecDeque<HashJob>>,
    done_chan: UnboundedSender<HashDone>,
}

impl WorkerHasher {
    pub fn new(threads: usize, done_chan: UnboundedSender<HashDone>) -> Self {
        Self {
            threads: Cell::new(threads),
            pending: Cell::new(0),
            backlog: RefCell::new(VecDeque::new()),
            done_chan,
        }
    }

    pub fn set_num_threads(&self, threads: usize) {
        self.threads.set(threads);
    }

    fn spawn(&self, job: HashJob) {
        let done_chan = self.done_chan.clone();
        task::spawn_blocking(move || {
            let done = job.digest();
            // the receiver half lives as long as the disk task; a send error
            // here means we're shutting down and the result is moot
            let _ = done_chan.send(done);
        });
    }
}

impl Hasher for WorkerHasher {
    fn async_hash(&self, job: HashJob) -> Option<HashJob> {
        if self.threads.get() == 0 {
            return Some(job);
        }
        self.pending.set(self.pending.get() + 1);
        if self.pending.get() <= self.threads.get() {
            self.spawn(job);
        } else {
            self.backlog.borrow_mut().push_back(job);
        }
        None
    }

    fn hash_job_done(&self) {
        debug_assert!(self.pending.get() > 0);
        self.pending.set(self.pending.get() - 1);
        if let Some(job) = self.backlog.borrow_mut().pop_front() {
            self.spawn(job);
        }
    }

    fn num_pending_jobs(&self) -> usize {
        self.pending.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_job(payload: &[Vec<u8>]) -> HashJob {
        HashJob {
            key: (0, 0),
            begin: 0,
            end: payload.len(),
            ctx: Sha1::new(),
            blocks: payload
                .iter()
                .map(|b| Bytes::from(b.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_inline_digest_matches_one_shot() {
        let blocks = vec![vec![0xAA; 100], vec![0xBB; 50]];
        let done = test_job(&blocks).digest();

        let mut expected = Sha1::new();
        expected.update(&blocks[0]);
        expected.update(&blocks[1]);
        assert_eq!(
            done.ctx.finalize().as_slice(),
            expected.finalize().as_slice()
        );
    }

    #[test]
    fn test_zero_threads_hashes_inline() {
        let (chan, _port) = mpsc::unbounded_channel();
        let hasher = WorkerHasher::new(0, chan);
        let job = test_job(&[vec![1, 2, 3]]);
        // the job is handed back for inline hashing
        assert!(hasher.async_hash(job).is_some());
        assert_eq!(hasher.num_pending_jobs(), 0);
    }

    #[tokio::test]
    async fn test_worker_posts_completion() {
        let (chan, mut port) = mpsc::unbounded_channel();
        let hasher = WorkerHasher::new(1, chan);

        let blocks = vec![vec![7u8; 64]];
        assert!(hasher.async_hash(test_job(&blocks)).is_none());
        assert_eq!(hasher.num_pending_jobs(), 1);

        let done = port.recv().await.expect("hash completion");
        hasher.hash_job_done();
        assert_eq!(hasher.num_pending_jobs(), 0);
        assert_eq!(done.begin, 0);
        assert_eq!(done.end, 1);

        let mut expected = Sha1::new();
        expected.update(&blocks[0]);
        assert_eq!(
            done.ctx.finalize().as_slice(),
            expected.finalize().as_slice()
        );
    }

    #[tokio::test]
    async fn test_backlog_drains_as_jobs_complete() {
        let (chan, mut port) = mpsc::unbounded_channel();
        let hasher = WorkerHasher::new(1, chan);

        assert!(hasher.async_hash(test_job(&[vec![1u8; 8]])).is_none());
        assert!(hasher.async_hash(test_job(&[vec![2u8; 8]])).is_none());
        assert_eq!(hasher.num_pending_jobs(), 2);

        // only one job runs at a time; completing it releases the backlog
        let _first = port.recv().await.expect("first completion");
        hasher.hash_job_done();
        assert_eq!(hasher.num_pending_jobs(), 1);

        let _second = port.recv().await.expect("second completion");
        hasher.hash_job_done();
        assert_eq!(hasher.num_pending_jobs(), 0);
    }
}
