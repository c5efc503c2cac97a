use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A block head as announced by the chain node.
///
/// `level` is the block height. Consecutive events from one upstream session never share a
/// level, but a reorg can make the level go backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub level: u64,
    pub hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl BlockEvent {
    pub fn new(level: u64, hash: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            level,
            hash: hash.into(),
            timestamp,
        }
    }
}
