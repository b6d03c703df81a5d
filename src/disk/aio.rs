//! Async control blocks: the unit of work handed to the storage backend.
//!
//! A logical request (a read-ahead line, a dirty flush run) is translated
//! into a chain of control blocks sharing one [`AsyncHandler`]. Each block
//! is executed on a blocking IO worker; when the handler's last block
//! reports in, the aggregated result is applied to the cache or the
//! originating job.
//!
//! For the synchronous backend the issue queue is kept in elevator order:
//! blocks are inserted by their physical disk offset along the current sweep
//! direction, so the disk head moves in one direction as long as possible.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;

use crate::{
    error::JobError,
    storage::Storage,
    BlockIndex, PieceIndex, TorrentId,
};

/// Identifies the [`AsyncHandler`] a control block reports to.
pub(crate) type HandlerId = usize;

/// What a control block does.
pub(crate) enum AcbOp {
    /// Fill the buffers from storage. The buffers travel with the block and
    /// come back through the completion.
    Read { bufs: Vec<Vec<u8>> },
    /// Write the shared payloads to storage.
    Write { bufs: Vec<Bytes> },
}

/// One pending storage operation.
pub(crate) struct Acb {
    pub storage: Arc<dyn Storage>,
    pub torrent: TorrentId,
    pub piece: PieceIndex,
    /// Byte offset within the piece.
    pub offset: u32,
    /// The cache block index the first buffer corresponds to.
    pub first_block: BlockIndex,
    /// Position on the physical disk, the elevator sort key.
    pub phys_offset: u64,
    pub op: AcbOp,
    pub handler: HandlerId,
}

impl Acb {
    pub fn read(
        storage: Arc<dyn Storage>,
        torrent: TorrentId,
        piece: PieceIndex,
        first_block: BlockIndex,
        offset: u32,
        bufs: Vec<Vec<u8>>,
        handler: HandlerId,
    ) -> Self {
        let phys_offset = storage.physical_offset(piece, offset);
        Self {
            storage,
            torrent,
            piece,
            offset,
            first_block,
            phys_offset,
            op: AcbOp::Read { bufs },
            handler,
        }
    }

    pub fn write(
        storage: Arc<dyn Storage>,
        torrent: TorrentId,
        piece: PieceIndex,
        first_block: BlockIndex,
        offset: u32,
        bufs: Vec<Bytes>,
        handler: HandlerId,
    ) -> Self {
        let phys_offset = storage.physical_offset(piece, offset);
        Self {
            storage,
            torrent,
            piece,
            offset,
            first_block,
            phys_offset,
            op: AcbOp::Write { bufs },
            handler,
        }
    }

    /// The number of payload bytes this block transfers.
    pub fn num_bytes(&self) -> usize {
        match &self.op {
            AcbOp::Read { bufs } => bufs.iter().map(|b| b.len()).sum(),
            AcbOp::Write { bufs } => bufs.iter().map(|b| b.len()).sum(),
        }
    }

    /// Executes the operation synchronously. Run on a blocking worker, off
    /// the disk task.
    pub fn run(self) -> super::io::IoComplete {
        let expected = self.num_bytes();
        let (transferred, error, read_bufs) = match self.op {
            AcbOp::Read { mut bufs } => {
                match self.storage.readv(&mut bufs, self.piece, self.offset) {
                    Ok(n) if n < expected => {
                        // fewer bytes than the blocks called for: the file
                        // ends inside the requested range
                        (n, Some(JobError::FileTooShort), Some(bufs))
                    }
                    Ok(n) => {
                        self.storage.readv_done(&bufs, self.piece, self.offset);
                        (n, None, Some(bufs))
                    }
                    Err(e) => (0, Some(JobError::from(e)), Some(bufs)),
                }
            }
            AcbOp::Write { bufs } => {
                match self.storage.writev(&bufs, self.piece, self.offset) {
                    Ok(n) => (n, None, None),
                    Err(e) => (0, Some(JobError::from(e)), None),
                }
            }
        };
        super::io::IoComplete {
            handler: self.handler,
            first_block: self.first_block,
            transferred,
            error,
            read_bufs,
        }
    }
}

pub(crate) fn same_sign(a: i64, b: i64) -> bool {
    ((a < 0) == (b < 0)) || a == 0 || b == 0
}

fn between(v: i64, b1: i64, b2: i64) -> bool {
    (b2 <= b1 && v <= b1 && v >= b2) || (b2 >= b1 && v >= b1 && v <= b2)
}

/// Whether `v` belongs right before `next`, given the previous offset on
/// the sweep and the local elevator direction.
fn elevator_ordered(v: i64, next: i64, prev: i64, elevator: i64) -> bool {
    // if the point is in between prev and next, we should always sort it in
    // between them, i.e. we're in the right place
    if between(v, prev, next) {
        return true;
    }

    // if the point is in the elevator direction from prev (and not in
    // between prev and next) and the next point is not in the elevator
    // direction, we've found the right spot as well
    if same_sign(v - prev, elevator) && !same_sign(next - prev, elevator) {
        return true;
    }

    false
}

/// Appends a chain of control blocks to the issue queue.
///
/// With a zero direction the chain is appended verbatim (async backends
/// preserve submission order). Otherwise each block is insertion sorted by
/// physical offset along the current sweep, never in front of the head
/// element, which marks where the disk head currently is.
pub(crate) fn append_acbs(
    queue: &mut VecDeque<Acb>,
    chain: Vec<Acb>,
    elevator_direction: i8,
) -> usize {
    let count = chain.len();
    if elevator_direction == 0 || queue.is_empty() {
        queue.extend(chain);
        return count;
    }

    for acb in chain {
        let v = acb.phys_offset as i64;
        let mut elevator = elevator_direction as i64;
        let mut prev = queue[0].phys_offset as i64;
        let mut idx = 0;
        while let Some(next) = queue.get(idx) {
            let next = next.phys_offset as i64;
            // never insert in front of the first element, since that's the
            // one that determines where the current head is
            if idx != 0 && elevator_ordered(v, next, prev, elevator) {
                break;
            }
            if !same_sign(next - prev, elevator) {
                // the elevator direction changed at this point (the knee)
                elevator = -elevator;
            }
            prev = next;
            idx += 1;
        }
        queue.insert(idx, acb);
    }
    count
}

/// Aggregates the control blocks of one logical request.
pub(crate) struct AsyncHandler {
    /// Outstanding control blocks. The handler retires when this drains.
    pub refs: usize,
    /// Total bytes transferred across the chain.
    pub transferred: usize,
    /// The first error any block of the chain reported; later errors are
    /// ignored.
    pub error: Option<JobError>,
    /// The buffer a bypass read brought back, stashed until retirement.
    pub bypass_buf: Option<Vec<u8>>,
    pub kind: HandlerKind,
}

impl AsyncHandler {
    pub fn new(refs: usize, kind: HandlerKind) -> Self {
        Self {
            refs,
            transferred: 0,
            error: None,
            bypass_buf: None,
            kind,
        }
    }
}

/// What to do when a handler's chain fully completes.
pub(crate) enum HandlerKind {
    /// A cache range of a piece: settle `[begin, end)` and reap waiters.
    CacheRange {
        torrent: TorrentId,
        piece: PieceIndex,
        begin: BlockIndex,
        end: BlockIndex,
        write: bool,
        /// Payload bytes, deducted from the pending write accounting when
        /// a write chain retires.
        bytes: usize,
    },
    /// A read that bypassed the cache; completes the job directly.
    BypassRead { job: super::job::Job },
    /// A write that bypassed the cache.
    BypassWrite {
        job: super::job::Job,
        bytes: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::NullStorage;

    fn acb(phys_offset: u64) -> Acb {
        let storage: Arc<dyn Storage> = Arc::new(NullStorage::default());
        Acb {
            storage,
            torrent: 0,
            piece: 0,
            offset: 0,
            first_block: 0,
            phys_offset,
            op: AcbOp::Write { bufs: Vec::new() },
            handler: 0,
        }
    }

    fn offsets(queue: &VecDeque<Acb>) -> Vec<u64> {
        queue.iter().map(|a| a.phys_offset).collect()
    }

    #[test]
    fn test_zero_direction_appends_verbatim() {
        let mut queue = VecDeque::new();
        append_acbs(&mut queue, vec![acb(30), acb(10), acb(20)], 0);
        assert_eq!(offsets(&queue), vec![30, 10, 20]);
    }

    #[test]
    fn test_insert_along_upward_sweep() {
        let mut queue = VecDeque::new();
        append_acbs(&mut queue, vec![acb(10), acb(20), acb(30)], 1);
        assert_eq!(offsets(&queue), vec![10, 20, 30]);

        // 25 is passed between 20 and 30 on the way up
        append_acbs(&mut queue, vec![acb(25)], 1);
        assert_eq!(offsets(&queue), vec![10, 20, 25, 30]);
    }

    #[test]
    fn test_offset_behind_head_lands_after_the_sweep() {
        let mut queue = VecDeque::new();
        append_acbs(&mut queue, vec![acb(10), acb(20), acb(30)], 1);
        // 5 is behind the head going up; it's served on the way back
        append_acbs(&mut queue, vec![acb(5)], 1);
        assert_eq!(offsets(&queue), vec![10, 20, 30, 5]);
    }

    #[test]
    fn test_insert_before_the_knee() {
        let mut queue = VecDeque::new();
        // an up sweep that has already turned around at 30
        append_acbs(&mut queue, vec![acb(10), acb(30), acb(20)], 1);
        append_acbs(&mut queue, vec![acb(25)], 1);
        assert_eq!(offsets(&queue), vec![10, 25, 30, 20]);
    }

    #[test]
    fn test_never_inserts_before_head() {
        let mut queue = VecDeque::new();
        append_acbs(&mut queue, vec![acb(20)], 1);
        append_acbs(&mut queue, vec![acb(10)], 1);
        assert_eq!(offsets(&queue)[0], 20);
    }

    #[test]
    fn test_downward_sweep() {
        let mut queue = VecDeque::new();
        append_acbs(&mut queue, vec![acb(30), acb(20), acb(10)], -1);
        append_acbs(&mut queue, vec![acb(25)], -1);
        assert_eq!(offsets(&queue), vec![30, 25, 20, 10]);
    }
}
