//! Patch records and their wire codec.
//!
//! A patch is a small delta against one data block: persisting it is much
//! cheaper than rewriting the whole block. Patches are serialized into log
//! blocks back to back, with no framing beyond the record format itself.
//!
//! ## Record format
//!
//! All fields little-endian:
//!
//! ```text
//! +--------+----------+---------+--------+------------------+
//! | length | block_id | counter | opcode |  operation body  |
//! |  2 B   |   4 B    |   4 B   |  1 B   |     variable     |
//! +--------+----------+---------+--------+------------------+
//! ```
//!
//! `length` is the total record size including the header. A `length` of
//! zero marks free space: wiped log blocks are zero-filled, so the scan
//! loop stops at the first zero length. `counter` is a per-data-block
//! sequence number assigned by the writer; together with the block id it
//! gives patches their replay order.

use crate::block::BlockId;
use crate::error::{PatchLogError, Result};

/// Byte offset of each header field within a record.
const LENGTH_OFFSET: usize = 0;
const BLOCK_OFFSET: usize = 2;
const COUNTER_OFFSET: usize = 6;
const OPCODE_OFFSET: usize = 10;
const HEADER_SIZE: usize = 11;

const OPCODE_WRITE_AT: u8 = 1;
const OPCODE_MOVE_RANGE: u8 = 2;

/// The modification a patch applies to its data block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatchOp {
    /// Overwrite bytes starting at `offset` within the data block.
    WriteAt {
        /// Byte offset within the data block.
        offset: u16,
        /// Replacement bytes.
        bytes: Vec<u8>,
    },
    /// Copy `len` bytes from `src` to `dest` within the data block. The
    /// ranges may overlap.
    MoveRange {
        /// Destination byte offset.
        dest: u16,
        /// Source byte offset.
        src: u16,
        /// Number of bytes to move.
        len: u16,
    },
}

impl PatchOp {
    fn body_size(&self) -> usize {
        match self {
            PatchOp::WriteAt { bytes, .. } => 2 + bytes.len(),
            PatchOp::MoveRange { .. } => 6,
        }
    }

    /// Replay this operation onto a data block image.
    pub fn apply_to(&self, data: &mut [u8]) -> Result<()> {
        match self {
            PatchOp::WriteAt { offset, bytes } => {
                let start = *offset as usize;
                let end = start + bytes.len();
                if end > data.len() {
                    return Err(PatchLogError::BadPatchRange {
                        offset: start,
                        len: bytes.len(),
                        block_len: data.len(),
                    });
                }
                data[start..end].copy_from_slice(bytes);
                Ok(())
            }
            PatchOp::MoveRange { dest, src, len } => {
                let dest = *dest as usize;
                let src = *src as usize;
                let len = *len as usize;
                let out_of_range = |offset| PatchLogError::BadPatchRange {
                    offset,
                    len,
                    block_len: data.len(),
                };
                if src + len > data.len() {
                    return Err(out_of_range(src));
                }
                if dest + len > data.len() {
                    return Err(out_of_range(dest));
                }
                data.copy_within(src..src + len, dest);
                Ok(())
            }
        }
    }
}

/// One delta record targeting a single data block.
///
/// The derived order is `(block id, counter, op)`: patches for the same
/// data block replay in counter order, and including the operation makes
/// the order total over distinct records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Patch {
    block: BlockId,
    counter: u32,
    op: PatchOp,
}

impl Patch {
    /// Smallest possible serialized record: a `WriteAt` with no payload.
    /// Scans use this to stop before the zero-filled tail of a block.
    pub const MIN_SERIALIZED_SIZE: usize = HEADER_SIZE + 2;

    /// Create a patch for `block` with the given replay counter.
    pub fn new(block: BlockId, counter: u32, op: PatchOp) -> Self {
        Self { block, counter, op }
    }

    /// The data block this patch amends.
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// Per-data-block sequence number.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The operation carried by this patch.
    pub fn op(&self) -> &PatchOp {
        &self.op
    }

    /// Exact number of bytes `encode` will write.
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.op.body_size()
    }

    /// Serialize the record into the front of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        let size = self.serialized_size();
        if dst.len() < size {
            return Err(PatchLogError::BufferTooSmall);
        }
        dst[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&(size as u16).to_le_bytes());
        dst[BLOCK_OFFSET..BLOCK_OFFSET + 4].copy_from_slice(&self.block.0.to_le_bytes());
        dst[COUNTER_OFFSET..COUNTER_OFFSET + 4].copy_from_slice(&self.counter.to_le_bytes());
        match &self.op {
            PatchOp::WriteAt { offset, bytes } => {
                dst[OPCODE_OFFSET] = OPCODE_WRITE_AT;
                dst[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(&offset.to_le_bytes());
                dst[HEADER_SIZE + 2..size].copy_from_slice(bytes);
            }
            PatchOp::MoveRange { dest, src, len } => {
                dst[OPCODE_OFFSET] = OPCODE_MOVE_RANGE;
                dst[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(&dest.to_le_bytes());
                dst[HEADER_SIZE + 2..HEADER_SIZE + 4].copy_from_slice(&src.to_le_bytes());
                dst[HEADER_SIZE + 4..HEADER_SIZE + 6].copy_from_slice(&len.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Serialize the record into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.serialized_size()];
        self.encode(&mut bytes)
            .expect("buffer sized to serialized_size");
        bytes
    }

    /// Deserialize a record from the front of `src`.
    ///
    /// Returns `None` when the bytes cannot represent a record: a zero
    /// length (free space), a length below the minimum or past the end of
    /// `src`, an unknown opcode, or a body inconsistent with the declared
    /// length. Never reads past the declared record length.
    pub fn load(src: &[u8]) -> Option<Patch> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let length = u16::from_le_bytes([src[LENGTH_OFFSET], src[LENGTH_OFFSET + 1]]) as usize;
        if length < Self::MIN_SERIALIZED_SIZE || length > src.len() {
            return None;
        }
        let block = BlockId(u32::from_le_bytes(
            src[BLOCK_OFFSET..BLOCK_OFFSET + 4].try_into().ok()?,
        ));
        let counter = u32::from_le_bytes(src[COUNTER_OFFSET..COUNTER_OFFSET + 4].try_into().ok()?);
        let op = match src[OPCODE_OFFSET] {
            OPCODE_WRITE_AT => {
                let offset = u16::from_le_bytes([src[HEADER_SIZE], src[HEADER_SIZE + 1]]);
                let bytes = src[HEADER_SIZE + 2..length].to_vec();
                PatchOp::WriteAt { offset, bytes }
            }
            OPCODE_MOVE_RANGE => {
                if length != HEADER_SIZE + 6 {
                    return None;
                }
                let dest = u16::from_le_bytes([src[HEADER_SIZE], src[HEADER_SIZE + 1]]);
                let src_off = u16::from_le_bytes([src[HEADER_SIZE + 2], src[HEADER_SIZE + 3]]);
                let len = u16::from_le_bytes([src[HEADER_SIZE + 4], src[HEADER_SIZE + 5]]);
                PatchOp::MoveRange {
                    dest,
                    src: src_off,
                    len,
                }
            }
            _ => return None,
        };
        Some(Patch { block, counter, op })
    }
}
