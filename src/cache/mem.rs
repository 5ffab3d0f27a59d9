//! In-memory buffer cache and serializer.
//!
//! Test doubles for the host engine's storage side. `MemSerializer` and
//! `MemBufferCache` share one [`MemStorage`], so a block created through
//! the cache is immediately reported as in use by the serializer, and a
//! deleted data block vanishes from both, matching how the real engine's
//! serializer and cache sit on the same device.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockId;
use crate::error::{PatchLogError, Result};

use super::{AccessMode, BufHandle, BufferCache, Serializer};

type BlockData = Arc<Mutex<Vec<u8>>>;

/// Shared backing store: every block currently allocated, by id.
#[derive(Debug)]
pub struct MemStorage {
    block_size: usize,
    blocks: Mutex<HashMap<BlockId, BlockData>>,
}

impl MemStorage {
    /// Create an empty store of fixed-size blocks.
    pub fn new(block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            blocks: Mutex::new(HashMap::new()),
        })
    }

    /// The fixed block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate a zeroed block. Returns false if the id is taken.
    pub fn insert(&self, block: BlockId) -> bool {
        self.allocate(block).is_some()
    }

    /// Deallocate a block. Returns false if it did not exist.
    pub fn remove(&self, block: BlockId) -> bool {
        self.blocks.lock().remove(&block).is_some()
    }

    /// Whether a block with this id is allocated.
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.lock().contains_key(&block)
    }

    /// Copy of a block's current contents.
    pub fn read_block(&self, block: BlockId) -> Option<Vec<u8>> {
        self.blocks.lock().get(&block).map(|data| data.lock().clone())
    }

    fn allocate(&self, block: BlockId) -> Option<BlockData> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(&block) {
            return None;
        }
        let data = Arc::new(Mutex::new(vec![0u8; self.block_size]));
        blocks.insert(block, Arc::clone(&data));
        Some(data)
    }

    fn get(&self, block: BlockId) -> Option<BlockData> {
        self.blocks.lock().get(&block).cloned()
    }
}

/// Serializer double answering from the shared store.
#[derive(Debug)]
pub struct MemSerializer {
    storage: Arc<MemStorage>,
}

impl MemSerializer {
    /// Create a serializer over `storage`.
    pub fn new(storage: Arc<MemStorage>) -> Self {
        Self { storage }
    }
}

impl Serializer for MemSerializer {
    fn block_in_use(
        &self,
        block: BlockId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + '_>> {
        Box::pin(async move {
            // Model the hop to the serializer's home thread.
            tokio::task::yield_now().await;
            self.storage.contains(block)
        })
    }

    fn block_size(&self) -> usize {
        self.storage.block_size()
    }
}

type AcquireHook = Box<dyn Fn(BlockId) + Send>;

/// Buffer cache double over the shared store.
///
/// Records every `ensure_flush` request and every block marked dirty, and
/// runs an optional `on_acquire` hook so tests can model the patch
/// eviction a block acquisition may trigger in the real cache.
pub struct MemBufferCache {
    storage: Arc<MemStorage>,
    dirty: Arc<Mutex<HashSet<BlockId>>>,
    flush_requests: Arc<Mutex<Vec<BlockId>>>,
    on_acquire: Mutex<Option<AcquireHook>>,
}

impl MemBufferCache {
    /// Create a cache over `storage`.
    pub fn new(storage: Arc<MemStorage>) -> Self {
        Self {
            storage,
            dirty: Arc::new(Mutex::new(HashSet::new())),
            flush_requests: Arc::new(Mutex::new(Vec::new())),
            on_acquire: Mutex::new(None),
        }
    }

    /// Install a hook invoked with the block id on every `acquire`.
    pub fn set_on_acquire(&self, hook: impl Fn(BlockId) + Send + 'static) {
        *self.on_acquire.lock() = Some(Box::new(hook));
    }

    /// Blocks for which `ensure_flush` was requested, in call order.
    pub fn flush_requests(&self) -> Vec<BlockId> {
        self.flush_requests.lock().clone()
    }

    /// Forget recorded `ensure_flush` requests.
    pub fn clear_flush_requests(&self) {
        self.flush_requests.lock().clear();
    }

    /// Whether `block` has been written through a handle.
    pub fn is_dirty(&self, block: BlockId) -> bool {
        self.dirty.lock().contains(&block)
    }

    fn handle(&self, block: BlockId, data: BlockData) -> MemBufHandle {
        MemBufHandle {
            block,
            data,
            block_size: self.storage.block_size(),
            dirty: Arc::clone(&self.dirty),
            flush_requests: Arc::clone(&self.flush_requests),
        }
    }
}

impl BufferCache for MemBufferCache {
    type Handle = MemBufHandle;

    fn acquire(
        &self,
        block: BlockId,
        _mode: AccessMode,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Handle>> + '_>> {
        Box::pin(async move {
            // Model the wait for the block to become resident.
            tokio::task::yield_now().await;
            if let Some(hook) = self.on_acquire.lock().as_ref() {
                hook(block);
            }
            let data = self
                .storage
                .get(block)
                .ok_or(PatchLogError::BlockMissing(block))?;
            Ok(self.handle(block, data))
        })
    }

    fn create(&self, block: BlockId) -> Result<Self::Handle> {
        let data = self
            .storage
            .allocate(block)
            .ok_or(PatchLogError::BlockExists(block))?;
        Ok(self.handle(block, data))
    }
}

/// Handle to one block of a [`MemBufferCache`].
pub struct MemBufHandle {
    block: BlockId,
    data: BlockData,
    block_size: usize,
    dirty: Arc<Mutex<HashSet<BlockId>>>,
    flush_requests: Arc<Mutex<Vec<BlockId>>>,
}

impl MemBufHandle {
    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.block_size {
            return Err(PatchLogError::OutOfBounds {
                block: self.block,
                offset,
                len,
            });
        }
        Ok(())
    }
}

impl BufHandle for MemBufHandle {
    fn block_id(&self) -> BlockId {
        self.block
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, dst.len())?;
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_bounds(offset, src.len())?;
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
        self.dirty.lock().insert(self.block);
        Ok(())
    }

    fn ensure_flush(&self) {
        self.flush_requests.lock().push(self.block);
    }

    fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build runtime")
    }

    #[test]
    fn test_create_then_acquire() {
        let storage = MemStorage::new(128);
        let cache = MemBufferCache::new(Arc::clone(&storage));

        let created = cache.create(BlockId(3)).unwrap();
        created.write_at(0, b"abc").unwrap();
        created.release();

        assert!(storage.contains(BlockId(3)));
        assert!(cache.is_dirty(BlockId(3)));

        let handle = rt()
            .block_on(cache.acquire(BlockId(3), AccessMode::NonLocking))
            .unwrap();
        let mut buf = [0u8; 3];
        handle.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        handle.release();
    }

    #[test]
    fn test_create_existing_block_fails() {
        let storage = MemStorage::new(128);
        let cache = MemBufferCache::new(Arc::clone(&storage));

        assert!(storage.insert(BlockId(9)));
        assert!(matches!(
            cache.create(BlockId(9)),
            Err(PatchLogError::BlockExists(BlockId(9)))
        ));
    }

    #[test]
    fn test_acquire_missing_block_fails() {
        let storage = MemStorage::new(128);
        let cache = MemBufferCache::new(storage);

        let result = rt().block_on(cache.acquire(BlockId(5), AccessMode::NonLocking));
        assert!(matches!(result, Err(PatchLogError::BlockMissing(BlockId(5)))));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let storage = MemStorage::new(16);
        let cache = MemBufferCache::new(storage);

        let handle = cache.create(BlockId(1)).unwrap();
        let mut buf = [0u8; 8];
        assert!(handle.read_at(12, &mut buf).is_err());
        assert!(handle.write_at(9, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_ensure_flush_recorded() {
        let storage = MemStorage::new(16);
        let cache = MemBufferCache::new(storage);

        let handle = cache.create(BlockId(2)).unwrap();
        handle.ensure_flush();
        handle.ensure_flush();
        handle.release();

        assert_eq!(cache.flush_requests(), vec![BlockId(2), BlockId(2)]);
        cache.clear_flush_requests();
        assert!(cache.flush_requests().is_empty());
    }

    #[test]
    fn test_serializer_tracks_storage() {
        let storage = MemStorage::new(64);
        let serializer = MemSerializer::new(Arc::clone(&storage));
        assert_eq!(serializer.block_size(), 64);

        let rt = rt();
        assert!(!rt.block_on(serializer.block_in_use(BlockId(7))));
        storage.insert(BlockId(7));
        assert!(rt.block_on(serializer.block_in_use(BlockId(7))));
        storage.remove(BlockId(7));
        assert!(!rt.block_on(serializer.block_in_use(BlockId(7))));
    }

    #[test]
    fn test_on_acquire_hook_runs() {
        let storage = MemStorage::new(16);
        let cache = MemBufferCache::new(Arc::clone(&storage));
        storage.insert(BlockId(4));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cache.set_on_acquire(move |block| sink.lock().push(block));

        rt().block_on(cache.acquire(BlockId(4), AccessMode::NonLocking))
            .unwrap()
            .release();
        assert_eq!(*seen.lock(), vec![BlockId(4)]);
    }
}
