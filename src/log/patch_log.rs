//! The patch log facade and its ring allocator.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::info;

use crate::block::BlockId;
use crate::cache::{AccessMode, BufHandle, BufferCache, Serializer};
use crate::config::PatchLogConfig;
use crate::error::Result;
use crate::index::PatchIndex;
use crate::patch::Patch;

use super::layout::{LogBlockView, RecordScan, LOG_BLOCK_MAGIC};

/// Point-in-time counters describing the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchLogStats {
    /// Number of log blocks in the ring.
    pub block_count: u32,
    /// Block currently receiving appends; `None` for an inert log.
    pub active_block: Option<BlockId>,
    /// Byte offset of the next append within the active block.
    pub next_offset: usize,
    /// Log blocks currently holding no patches.
    pub empty_blocks: u32,
}

/// Out-of-core patch log over a ring of dedicated log blocks.
///
/// Patches appended through [`store_patch`](Self::store_patch) land in the
/// active block; when it fills up, the next ring block is compacted in
/// place and becomes active. When compaction cannot make room the caller
/// flushes: [`flush_n_oldest_blocks`](Self::flush_n_oldest_blocks) forces
/// the data blocks referenced by old log blocks to be rewritten whole so
/// their patches can be wiped. At startup
/// [`load_patches`](Self::load_patches) rebuilds the in-core index from
/// the surviving records.
///
/// The log runs on one logical thread. `store_patch` and
/// [`compress_block`](Self::compress_block) never suspend; the flush and
/// recovery entry points do, at the documented buffer-cache and
/// serializer calls.
pub struct PatchLog<S, C, I>
where
    S: Serializer,
    C: BufferCache,
    I: PatchIndex,
{
    pub(super) serializer: Arc<S>,
    pub(super) cache: Arc<C>,
    pub(super) index: Arc<I>,
    pub(super) first_block: BlockId,
    pub(super) block_count: u32,
    pub(super) block_size: usize,
    pub(super) bufs: Vec<C::Handle>,
    pub(super) empty: RefCell<Vec<bool>>,
    pub(super) active: Cell<BlockId>,
    pub(super) next_offset: Cell<usize>,
    pub(super) waiters: Cell<u32>,
    home_thread: ThreadId,
}

impl<S, C, I> PatchLog<S, C, I>
where
    S: Serializer,
    C: BufferCache,
    I: PatchIndex,
{
    /// Acquire the log-block range and make the log ready for appends.
    ///
    /// Blocks the serializer reports in use must already carry the log
    /// magic; anything else means the range is misconfigured or storage
    /// is damaged, and `open` fails naming the offending block. Blocks
    /// not yet in use are created and formatted empty. A zero
    /// `block_count` yields an inert log that accepts nothing.
    pub async fn open(
        serializer: Arc<S>,
        cache: Arc<C>,
        index: Arc<I>,
        config: &PatchLogConfig,
    ) -> Result<Self> {
        let block_size = serializer.block_size();
        let mut log = Self {
            serializer,
            cache,
            index,
            first_block: config.first_block,
            block_count: config.block_count,
            block_size,
            bufs: Vec::with_capacity(config.block_count as usize),
            empty: RefCell::new(vec![false; config.block_count as usize]),
            active: Cell::new(config.first_block),
            next_offset: Cell::new(LOG_BLOCK_MAGIC.len()),
            waiters: Cell::new(0),
            home_thread: thread::current().id(),
        };
        if log.block_count == 0 {
            return Ok(log);
        }

        for slot in 0..log.block_count {
            let block = BlockId(log.first_block.0 + slot);
            if log.serializer.block_in_use(block).await {
                let buf = log.cache.acquire(block, AccessMode::NonLocking).await?;
                LogBlockView::new(&buf, block_size).check_magic()?;
                log.bufs.push(buf);
            } else {
                let buf = log.cache.create(block)?;
                LogBlockView::new(&buf, block_size).format()?;
                log.bufs.push(buf);
                log.empty.borrow_mut()[slot as usize] = true;
            }
        }

        log.set_active(log.first_block)?;
        info!(
            first_block = %log.first_block,
            block_count = log.block_count,
            "patch log opened"
        );
        Ok(log)
    }

    /// Append one patch to the active block.
    ///
    /// Returns `Ok(false)` when the patch does not fit even after
    /// compacting the next ring block; the caller is then expected to
    /// drain the log with [`flush_n_oldest_blocks`](Self::flush_n_oldest_blocks)
    /// and retry, or fall back to rewriting the data block whole. Never
    /// suspends, so it is safe to call from the flush critical section.
    pub fn store_patch(&self, patch: &Patch) -> Result<bool> {
        self.assert_home_thread();
        if self.block_count == 0 {
            return Ok(false);
        }

        let size = patch.serialized_size();
        debug_assert!(self.next_offset.get() <= self.block_size);
        let mut free = self.block_size - self.next_offset.get();
        if size > free {
            let saved = self.active.get();
            self.reclaim_space()?;
            free = self.block_size - self.next_offset.get();
            if size > free {
                // Go back to the block we started on, so that it is first
                // in line when the caller flushes the oldest blocks.
                self.set_active(saved)?;
                return Ok(false);
            }
        }

        let active = self.active.get();
        let offset = self.next_offset.get();
        self.empty.borrow_mut()[self.slot(active)] = false;
        LogBlockView::new(self.buf(active), self.block_size).write_record(offset, patch)?;
        self.next_offset.set(offset + size);
        Ok(true)
    }

    /// Compact the next ring block and direct appends at it.
    fn reclaim_space(&self) -> Result<()> {
        let target = self.select_for_compression();
        self.compress_block(target)?;
        self.set_active(target)
    }

    /// The ring position after the active block. The block just made
    /// active is never the immediate compaction target, which gives every
    /// block a full ring revolution of grace.
    fn select_for_compression(&self) -> BlockId {
        let mut next = self.active.get().0 + 1;
        if next >= self.first_block.0 + self.block_count {
            next -= self.block_count;
        }
        BlockId(next)
    }

    /// Move the write cursor to `block`, recomputing the append offset by
    /// scanning the records already present.
    pub(super) fn set_active(&self, block: BlockId) -> Result<()> {
        debug_assert!(self.contains(block));
        self.active.set(block);

        let view = LogBlockView::new(self.buf(block), self.block_size);
        view.check_magic()?;
        let image = view.snapshot()?;
        let mut scan = RecordScan::new(&image);
        while scan.next().is_some() {}
        self.next_offset.set(scan.offset());
        Ok(())
    }

    /// Release every log-block buffer and drop the in-memory state.
    ///
    /// Nothing is persisted here: the `empty` flags are re-derived by the
    /// boot scan on the next open.
    pub fn shutdown(mut self) {
        self.assert_home_thread();
        for buf in self.bufs.drain(..) {
            buf.release();
        }
        self.empty.borrow_mut().clear();
    }

    /// Snapshot of the log's counters.
    pub fn stats(&self) -> PatchLogStats {
        PatchLogStats {
            block_count: self.block_count,
            active_block: (self.block_count > 0).then(|| self.active.get()),
            next_offset: self.next_offset.get(),
            empty_blocks: self.empty.borrow().iter().filter(|empty| **empty).count() as u32,
        }
    }

    pub(super) fn buf(&self, block: BlockId) -> &C::Handle {
        &self.bufs[self.slot(block)]
    }

    pub(super) fn slot(&self, block: BlockId) -> usize {
        debug_assert!(self.contains(block));
        (block.0 - self.first_block.0) as usize
    }

    fn contains(&self, block: BlockId) -> bool {
        block.0 >= self.first_block.0 && block.0 < self.first_block.0 + self.block_count
    }

    pub(super) fn assert_home_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.home_thread,
            "patch log accessed off its home thread"
        );
    }
}
