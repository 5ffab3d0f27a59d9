//! oxipatch - An out-of-core patch log for a copy-on-write block storage engine
//!
//! Writes to data blocks are captured as small *patches* (delta records)
//! and appended to a fixed ring of dedicated log blocks on disk, letting
//! the engine defer rewriting full data blocks. On crash recovery the
//! patches are replayed against their data blocks; during normal
//! operation they age out when the underlying block is eventually
//! rewritten wholesale.
//!
//! # Components
//!
//! - [`patch`]: the patch record codec and replay order
//! - [`log`]: the log-block layout, ring allocator, compactor, flusher
//!   and boot scanner behind the [`PatchLog`] facade
//! - [`cache`] and [`index`]: the seams to the host engine's buffer
//!   cache, serializer and in-core diff storage, with in-memory
//!   implementations for tests
//!
//! # Quick start
//!
//! ```rust,ignore
//! use oxipatch::cache::{MemBufferCache, MemSerializer, MemStorage};
//! use oxipatch::config::PatchLogConfig;
//! use oxipatch::index::MemPatchIndex;
//! use oxipatch::{BlockId, Patch, PatchLog, PatchOp};
//!
//! let storage = MemStorage::new(4096);
//! let log = PatchLog::open(serializer, cache, index,
//!     &PatchLogConfig::new(BlockId(0), 8)).await?;
//!
//! let patch = Patch::new(BlockId(42), 1, PatchOp::WriteAt { offset: 0, bytes });
//! if !log.store_patch(&patch)? {
//!     log.flush_n_oldest_blocks(2).await?;
//! }
//! ```

#![warn(missing_docs)]

pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod patch;

// Re-exports for convenience
pub use block::BlockId;
pub use error::{PatchLogError, Result};
pub use log::{PatchLog, PatchLogStats, LOG_BLOCK_MAGIC};
pub use patch::{Patch, PatchOp};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::block::BlockId;
    pub use crate::cache::{AccessMode, BufHandle, BufferCache, Serializer};
    pub use crate::config::PatchLogConfig;
    pub use crate::index::PatchIndex;
    pub use crate::log::{PatchLog, PatchLogStats};
    pub use crate::patch::{Patch, PatchOp};
}
