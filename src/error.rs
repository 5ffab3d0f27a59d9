//! Error types for the patch log.

use crate::block::BlockId;

/// Errors surfaced by the patch log.
///
/// Running out of log space is not an error: `store_patch` reports it
/// through its `Ok(false)` return so the caller can schedule a flush.
#[derive(Debug, thiserror::Error)]
pub enum PatchLogError {
    /// A block claimed to be a live log block does not start with the log
    /// magic. The log range is misconfigured or storage is damaged.
    #[error("block {0} is not a log block (magic mismatch)")]
    BadMagic(BlockId),
    /// A block the log needs is not present in storage.
    #[error("block {0} is not present in storage")]
    BlockMissing(BlockId),
    /// A block id handed out for a fresh log block is already occupied.
    #[error("block {0} already exists")]
    BlockExists(BlockId),
    /// A read or write would cross the end of a block.
    #[error("out of bounds on block {block}: offset {offset}, len {len}")]
    OutOfBounds {
        /// Block the access targeted.
        block: BlockId,
        /// Starting byte offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
    },
    /// A record does not fit the destination buffer.
    #[error("destination buffer too small for record")]
    BufferTooSmall,
    /// A patch names a byte range outside its data block.
    #[error("patch range out of bounds: offset {offset}, len {len}, block len {block_len}")]
    BadPatchRange {
        /// Starting byte offset named by the patch.
        offset: usize,
        /// Length named by the patch.
        len: usize,
        /// Actual length of the data block image.
        block_len: usize,
    },
    /// An I/O error reported by the buffer cache.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PatchLogError>;
