//! On-disk layout of a log block.
//!
//! Every log block starts with a fixed magic prefix followed by an
//! append-only run of patch records; the rest of the block is zero filled
//! when wiped:
//!
//! ```text
//! +------------+--------------------------------+-----------+
//! | OXPLOG1\0  |  patch records, back to back   | zero fill |
//! |  8 bytes   |                                |           |
//! +------------+--------------------------------+-----------+
//! ```
//!
//! There is no record count and no end marker: a scan walks records until
//! a load fails or the remaining space cannot hold a minimal record. The
//! zero fill guarantees the first byte pair past the last record decodes
//! as a zero length, which no valid record has.

use crate::cache::BufHandle;
use crate::error::{PatchLogError, Result};
use crate::patch::Patch;

/// Magic prefix identifying a log block. Stable across restarts.
pub const LOG_BLOCK_MAGIC: [u8; 8] = *b"OXPLOG1\0";

/// Checked byte view over one log block, accessed through its cache
/// handle.
pub(crate) struct LogBlockView<'a, H: BufHandle> {
    buf: &'a H,
    block_size: usize,
}

impl<'a, H: BufHandle> LogBlockView<'a, H> {
    pub(crate) fn new(buf: &'a H, block_size: usize) -> Self {
        Self { buf, block_size }
    }

    /// Wipe the block: write the magic and zero everything after it.
    pub(crate) fn format(&self) -> Result<()> {
        let mut image = vec![0u8; self.block_size];
        image[..LOG_BLOCK_MAGIC.len()].copy_from_slice(&LOG_BLOCK_MAGIC);
        self.buf.write_at(0, &image)
    }

    /// Validate the magic prefix through the read-only path.
    pub(crate) fn check_magic(&self) -> Result<()> {
        let mut magic = [0u8; LOG_BLOCK_MAGIC.len()];
        self.buf.read_at(0, &mut magic)?;
        if magic != LOG_BLOCK_MAGIC {
            return Err(PatchLogError::BadMagic(self.buf.block_id()));
        }
        Ok(())
    }

    /// Copy the whole block out for scanning.
    pub(crate) fn snapshot(&self) -> Result<Vec<u8>> {
        let mut image = vec![0u8; self.block_size];
        self.buf.read_at(0, &mut image)?;
        Ok(image)
    }

    /// Serialize one record at `offset`.
    pub(crate) fn write_record(&self, offset: usize, patch: &Patch) -> Result<()> {
        let size = patch.serialized_size();
        if offset + size > self.block_size {
            return Err(PatchLogError::OutOfBounds {
                block: self.buf.block_id(),
                offset,
                len: size,
            });
        }
        let mut record = vec![0u8; size];
        patch.encode(&mut record)?;
        self.buf.write_at(offset, &record)
    }
}

/// One record yielded by [`RecordScan`].
pub(crate) struct ScannedRecord {
    pub(crate) patch: Patch,
    #[allow(dead_code)]
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

/// Iterator over the records of a block image, starting after the magic.
///
/// After the iterator is exhausted, [`RecordScan::offset`] is the first
/// free byte, which is the append offset for that block.
pub(crate) struct RecordScan<'a> {
    image: &'a [u8],
    offset: usize,
}

impl<'a> RecordScan<'a> {
    pub(crate) fn new(image: &'a [u8]) -> Self {
        debug_assert!(image.len() >= LOG_BLOCK_MAGIC.len());
        Self {
            image,
            offset: LOG_BLOCK_MAGIC.len(),
        }
    }

    /// Offset one past the last record read so far.
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for RecordScan<'_> {
    type Item = ScannedRecord;

    fn next(&mut self) -> Option<ScannedRecord> {
        if self.offset + Patch::MIN_SERIALIZED_SIZE >= self.image.len() {
            return None;
        }
        let patch = Patch::load(&self.image[self.offset..])?;
        let len = patch.serialized_size();
        let offset = self.offset;
        self.offset += len;
        Some(ScannedRecord { patch, offset, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::cache::{BufferCache, MemBufferCache, MemStorage};
    use crate::patch::PatchOp;

    const BLOCK_SIZE: usize = 256;

    fn patch(counter: u32, payload: usize) -> Patch {
        Patch::new(
            BlockId(90),
            counter,
            PatchOp::WriteAt {
                offset: 0,
                bytes: vec![counter as u8; payload],
            },
        )
    }

    #[test]
    fn test_format_writes_magic_and_zeroes() {
        let storage = MemStorage::new(BLOCK_SIZE);
        let cache = MemBufferCache::new(std::sync::Arc::clone(&storage));
        let buf = cache.create(BlockId(1)).unwrap();

        buf.write_at(32, &[0xFF; 16]).unwrap();
        LogBlockView::new(&buf, BLOCK_SIZE).format().unwrap();

        let image = storage.read_block(BlockId(1)).unwrap();
        assert_eq!(&image[..8], &LOG_BLOCK_MAGIC);
        assert!(image[8..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_check_magic() {
        let storage = MemStorage::new(BLOCK_SIZE);
        let cache = MemBufferCache::new(storage);
        let buf = cache.create(BlockId(2)).unwrap();

        let view = LogBlockView::new(&buf, BLOCK_SIZE);
        assert!(matches!(
            view.check_magic(),
            Err(PatchLogError::BadMagic(BlockId(2)))
        ));

        view.format().unwrap();
        view.check_magic().unwrap();
    }

    #[test]
    fn test_scan_roundtrip() {
        let storage = MemStorage::new(BLOCK_SIZE);
        let cache = MemBufferCache::new(std::sync::Arc::clone(&storage));
        let buf = cache.create(BlockId(3)).unwrap();
        let view = LogBlockView::new(&buf, BLOCK_SIZE);
        view.format().unwrap();

        let patches = [patch(1, 4), patch(2, 0), patch(3, 17)];
        let mut offset = LOG_BLOCK_MAGIC.len();
        for p in &patches {
            view.write_record(offset, p).unwrap();
            offset += p.serialized_size();
        }

        let image = view.snapshot().unwrap();
        let mut scan = RecordScan::new(&image);
        let mut seen = Vec::new();
        for record in scan.by_ref() {
            seen.push(record.patch);
        }
        assert_eq!(seen, patches);
        assert_eq!(scan.offset(), offset);
    }

    #[test]
    fn test_scan_stops_at_free_space() {
        let mut image = vec![0u8; BLOCK_SIZE];
        image[..8].copy_from_slice(&LOG_BLOCK_MAGIC);
        assert_eq!(RecordScan::new(&image).count(), 0);

        let mut scan = RecordScan::new(&image);
        assert!(scan.next().is_none());
        assert_eq!(scan.offset(), LOG_BLOCK_MAGIC.len());
    }

    #[test]
    fn test_scan_stops_near_block_end() {
        let p = patch(1, 0);
        let mut image = vec![0u8; BLOCK_SIZE];
        image[..8].copy_from_slice(&LOG_BLOCK_MAGIC);

        // A record whose end leaves less than a minimal record of space.
        let tail = BLOCK_SIZE - 8 - p.serialized_size();
        p.encode(&mut image[tail..]).unwrap();

        // The scan never probes past the point where a minimal record
        // could not fit, so the tail record is only reachable by records
        // leading up to it.
        let mut offset = 8;
        let mut cursor = RecordScan::new(&image);
        while let Some(record) = cursor.next() {
            offset = record.offset + record.len;
        }
        assert!(offset <= tail);
    }

    #[test]
    fn test_write_record_rejects_overflow() {
        let storage = MemStorage::new(BLOCK_SIZE);
        let cache = MemBufferCache::new(storage);
        let buf = cache.create(BlockId(4)).unwrap();
        let view = LogBlockView::new(&buf, BLOCK_SIZE);
        view.format().unwrap();

        let big = patch(1, BLOCK_SIZE);
        assert!(matches!(
            view.write_record(8, &big),
            Err(PatchLogError::OutOfBounds { .. })
        ));
    }
}
