//! Seam to the in-core diff storage.
//!
//! The in-core index maps data block ids to their outstanding patches and
//! is the authority on which patches are still live. The log reads it to
//! decide what survives compaction and whether a flush still has work to
//! do, and writes to it exactly once: the boot scan hands over the patch
//! lists rebuilt from disk.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::patch::Patch;

/// Read-mostly view of the in-core diff storage.
///
/// Implementations must never track an empty patch list: `oldest_patch`
/// returning `Some` implies at least one live patch for that block, and a
/// data block that was deleted must not appear at all.
pub trait PatchIndex {
    /// Whether any live patches are tracked for `block`.
    fn has_patches(&self, block: BlockId) -> bool;

    /// The oldest live patch tracked for `block`.
    fn oldest_patch(&self, block: BlockId) -> Option<Patch>;

    /// Boot-time hand-off of the patches recovered for `block`, sorted in
    /// replay order.
    fn load_block_patch_list(&self, block: BlockId, patches: Vec<Patch>);
}

/// In-memory diff storage used by the tests and doc examples.
///
/// Keeps per-block lists sorted in replay order and drops a block's entry
/// as soon as its list would become empty.
#[derive(Debug, Default)]
pub struct MemPatchIndex {
    lists: Mutex<HashMap<BlockId, Vec<Patch>>>,
}

impl MemPatchIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `patch` as live, keeping the block's list sorted.
    pub fn insert(&self, patch: Patch) {
        let mut lists = self.lists.lock();
        let list = lists.entry(patch.block_id()).or_default();
        let at = list.binary_search(&patch).unwrap_or_else(|at| at);
        list.insert(at, patch);
    }

    /// Forget every patch tracked for `block`, as the buffer cache does
    /// when bringing the block in memory applies or discards them.
    pub fn evict_block(&self, block: BlockId) {
        self.lists.lock().remove(&block);
    }

    /// Snapshot of the patches tracked for `block`.
    pub fn patches(&self, block: BlockId) -> Option<Vec<Patch>> {
        self.lists.lock().get(&block).cloned()
    }

    /// Number of blocks with at least one tracked patch.
    pub fn tracked_blocks(&self) -> usize {
        self.lists.lock().len()
    }
}

impl PatchIndex for MemPatchIndex {
    fn has_patches(&self, block: BlockId) -> bool {
        self.lists.lock().contains_key(&block)
    }

    fn oldest_patch(&self, block: BlockId) -> Option<Patch> {
        self.lists.lock().get(&block).and_then(|list| list.first().cloned())
    }

    fn load_block_patch_list(&self, block: BlockId, patches: Vec<Patch>) {
        debug_assert!(
            patches.windows(2).all(|pair| pair[0] <= pair[1]),
            "patch list for block {block} delivered out of order"
        );
        if patches.is_empty() {
            return;
        }
        self.lists.lock().insert(block, patches);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;

    fn patch(block: u32, counter: u32) -> Patch {
        Patch::new(
            BlockId(block),
            counter,
            PatchOp::WriteAt {
                offset: 0,
                bytes: vec![counter as u8],
            },
        )
    }

    #[test]
    fn test_insert_keeps_replay_order() {
        let index = MemPatchIndex::new();
        index.insert(patch(1, 3));
        index.insert(patch(1, 1));
        index.insert(patch(1, 2));

        let list = index.patches(BlockId(1)).unwrap();
        let counters: Vec<u32> = list.iter().map(Patch::counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
        assert_eq!(index.oldest_patch(BlockId(1)).unwrap().counter(), 1);
    }

    #[test]
    fn test_evict_block() {
        let index = MemPatchIndex::new();
        index.insert(patch(1, 1));
        assert!(index.has_patches(BlockId(1)));

        index.evict_block(BlockId(1));
        assert!(!index.has_patches(BlockId(1)));
        assert!(index.oldest_patch(BlockId(1)).is_none());
    }

    #[test]
    fn test_load_ignores_empty_list() {
        let index = MemPatchIndex::new();
        index.load_block_patch_list(BlockId(4), Vec::new());
        assert!(!index.has_patches(BlockId(4)));
        assert_eq!(index.tracked_blocks(), 0);
    }

    #[test]
    fn test_load_replaces_existing_list() {
        let index = MemPatchIndex::new();
        index.insert(patch(2, 9));
        index.load_block_patch_list(BlockId(2), vec![patch(2, 1), patch(2, 2)]);

        let counters: Vec<u32> = index
            .patches(BlockId(2))
            .unwrap()
            .iter()
            .map(Patch::counter)
            .collect();
        assert_eq!(counters, vec![1, 2]);
    }
}
