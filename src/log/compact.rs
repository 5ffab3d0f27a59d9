//! In-place compaction of a single log block.

use tracing::debug;

use crate::block::BlockId;
use crate::cache::{BufferCache, Serializer};
use crate::error::Result;
use crate::index::PatchIndex;
use crate::patch::Patch;

use super::layout::{LogBlockView, RecordScan, LOG_BLOCK_MAGIC};
use super::patch_log::PatchLog;

impl<S, C, I> PatchLog<S, C, I>
where
    S: Serializer,
    C: BufferCache,
    I: PatchIndex,
{
    /// Rewrite `block` keeping only live patches, reclaiming the space of
    /// the rest.
    ///
    /// A patch is live iff the in-core index still tracks patches for its
    /// data block and the patch is not older than the oldest tracked one:
    /// anything older has been superseded by a full write of the data
    /// block (or the block is gone entirely) and has no replay value.
    /// Kept records retain their relative order. The block is rewritten
    /// only when at least one patch was dropped, and the whole routine
    /// never suspends: the log block is already resident.
    pub fn compress_block(&self, block: BlockId) -> Result<()> {
        self.assert_home_thread();

        let view = LogBlockView::new(self.buf(block), self.block_size);
        view.check_magic()?;
        let image = view.snapshot()?;

        let mut live: Vec<Patch> = Vec::new();
        let mut dropped = 0usize;
        let mut dropped_bytes = 0usize;
        for record in RecordScan::new(&image) {
            match self.index.oldest_patch(record.patch.block_id()) {
                Some(oldest) if record.patch >= oldest => live.push(record.patch),
                _ => {
                    dropped += 1;
                    dropped_bytes += record.len;
                }
            }
        }

        if dropped == 0 {
            return Ok(());
        }

        view.format()?;
        let mut offset = LOG_BLOCK_MAGIC.len();
        for patch in &live {
            view.write_record(offset, patch)?;
            offset += patch.serialized_size();
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                block = %block,
                kept = live.len(),
                dropped,
                dropped_bytes,
                "log block compacted"
            );
        }
        Ok(())
    }
}
