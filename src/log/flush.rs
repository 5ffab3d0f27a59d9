//! Flushing log blocks by forcing full rewrites of their data blocks.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::debug;

use crate::block::BlockId;
use crate::cache::{AccessMode, BufHandle, BufferCache, Serializer};
use crate::error::{PatchLogError, Result};
use crate::index::PatchIndex;

use super::layout::{LogBlockView, RecordScan};
use super::patch_log::PatchLog;

impl<S, C, I> PatchLog<S, C, I>
where
    S: Serializer,
    C: BufferCache,
    I: PatchIndex,
{
    /// Evacuate one log block: make sure every data block it patches gets
    /// rewritten whole on the next cache flush, then wipe the log block.
    ///
    /// May suspend while acquiring data blocks through the buffer cache.
    pub async fn flush_block(&self, block: BlockId) -> Result<()> {
        self.assert_home_thread();

        let image = {
            let view = LogBlockView::new(self.buf(block), self.block_size);
            view.check_magic()?;
            view.snapshot()?
        };

        for record in RecordScan::new(&image) {
            let data_block = record.patch.block_id();
            // Only blocks the in-core index still tracks can have
            // applicable patches; deleted data blocks never appear there.
            if !self.index.has_patches(data_block) {
                continue;
            }
            // No lock is needed: nothing is read or written here. The
            // acquisition exists to bring the block into memory so the
            // next writeback persists it whole.
            let data_buf = self.cache.acquire(data_block, AccessMode::NonLocking).await?;
            // Acquiring the block may itself have evicted its patches
            // from the in-core index; the earlier observation is stale.
            if self.index.has_patches(data_block) {
                data_buf.ensure_flush();
            }
            data_buf.release();
        }

        let view = LogBlockView::new(self.buf(block), self.block_size);
        view.format()?;
        self.empty.borrow_mut()[self.slot(block)] = true;
        debug!(block = %block, "log block flushed");
        Ok(())
    }

    /// Flush the `n` ring positions after the active block, skipping
    /// blocks that are already empty.
    ///
    /// `n` is clamped to the ring size. A single target is flushed
    /// inline; several targets run as concurrent tasks counted down by
    /// `waiters`, and this call returns once the last one finishes.
    /// Flushing the whole ring wipes the active block too, so the write
    /// cursor is re-derived afterwards.
    pub async fn flush_n_oldest_blocks(&self, n: u32) -> Result<()> {
        self.assert_home_thread();
        if self.block_count == 0 {
            return Ok(());
        }
        let n = n.min(self.block_count);

        let mut targets = Vec::new();
        for step in 1..=n {
            let mut id = self.active.get().0 + step;
            if id >= self.first_block.0 + self.block_count {
                id -= self.block_count;
            }
            let block = BlockId(id);
            if !self.empty.borrow()[self.slot(block)] {
                targets.push(block);
            }
        }

        if n == 1 {
            // Save the task round trip for a single block.
            if let Some(block) = targets.first() {
                self.flush_block(*block).await?;
            }
        } else if !targets.is_empty() {
            let tasks = targets
                .iter()
                .map(|block| {
                    self.waiters.set(self.waiters.get() + 1);
                    let block = *block;
                    let task: FlushTask<'_> = Box::pin(async move {
                        let result = self.flush_block(block).await;
                        self.waiters.set(self.waiters.get() - 1);
                        result
                    });
                    Some(task)
                })
                .collect::<Vec<_>>();
            let remaining = tasks.len();
            FlushBarrier {
                tasks,
                remaining,
                first_error: None,
            }
            .await?;
            debug_assert_eq!(self.waiters.get(), 0);
        }

        if n == self.block_count {
            self.set_active(self.active.get())?;
        }
        Ok(())
    }
}

type FlushTask<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Countdown barrier over per-block flush tasks: polls every outstanding
/// task until all have finished, then reports the first error, if any.
struct FlushBarrier<'a> {
    tasks: Vec<Option<FlushTask<'a>>>,
    remaining: usize,
    first_error: Option<PatchLogError>,
}

impl Future for FlushBarrier<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        for slot in this.tasks.iter_mut() {
            if let Some(task) = slot {
                if let Poll::Ready(result) = task.as_mut().poll(cx) {
                    if let Err(err) = result {
                        this.first_error.get_or_insert(err);
                    }
                    *slot = None;
                    this.remaining -= 1;
                }
            }
        }
        if this.remaining == 0 {
            match this.first_error.take() {
                Some(err) => Poll::Ready(Err(err)),
                None => Poll::Ready(Ok(())),
            }
        } else {
            Poll::Pending
        }
    }
}
