//! Block identifiers.

use std::fmt;

use serde::Deserialize;

/// Names one fixed-size block in the underlying storage.
///
/// Ids are assigned by the serializer. The patch log treats them as opaque
/// except for the modular arithmetic over its own reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockId {
    fn from(raw: u32) -> Self {
        BlockId(raw)
    }
}
