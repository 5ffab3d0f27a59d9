//! Boot-time scan rebuilding the in-core patch index.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::block::BlockId;
use crate::cache::{BufferCache, Serializer};
use crate::error::Result;
use crate::index::PatchIndex;
use crate::patch::Patch;

use super::layout::{LogBlockView, RecordScan};
use super::patch_log::PatchLog;

impl<S, C, I> PatchLog<S, C, I>
where
    S: Serializer,
    C: BufferCache,
    I: PatchIndex,
{
    /// Walk every log block once and hand the recovered per-data-block
    /// patch lists, sorted in replay order, to the in-core index.
    ///
    /// Purely read-side: the log blocks are left exactly as found. A
    /// patch whose data block no longer exists is dropped here; keeping
    /// it would make a later flush fail on a block the serializer cannot
    /// produce.
    pub async fn load_patches(&self) -> Result<()> {
        self.assert_home_thread();
        if self.block_count == 0 {
            return Ok(());
        }

        let mut patch_map: BTreeMap<BlockId, Vec<Patch>> = BTreeMap::new();
        let mut dropped = 0usize;
        for slot in 0..self.block_count {
            let block = BlockId(self.first_block.0 + slot);
            let image = {
                let view = LogBlockView::new(self.buf(block), self.block_size);
                view.check_magic()?;
                view.snapshot()?
            };
            for record in RecordScan::new(&image) {
                let data_block = record.patch.block_id();
                if self.serializer.block_in_use(data_block).await {
                    patch_map.entry(data_block).or_default().push(record.patch);
                } else {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            warn!(dropped, "dropped patches whose data blocks are gone");
        }

        let mut delivered = 0usize;
        for (data_block, mut patches) in patch_map {
            patches.sort();
            delivered += patches.len();
            self.index.load_block_patch_list(data_block, patches);
        }
        info!(delivered, "patch log recovery scan complete");
        Ok(())
    }
}
