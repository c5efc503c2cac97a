use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::BlockEvent;

/// Block announcement pushed from the hub to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBlockMessage {
    pub block: BlockEvent,
    /// Hub wall clock when the message was built.
    #[serde(rename = "serverTime", with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

/// Every frame the hub sends, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Block(NormalizedBlockMessage),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid stream message: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamMessage {
    pub fn block(block: BlockEvent, server_time: OffsetDateTime) -> Self {
        StreamMessage::Block(NormalizedBlockMessage { block, server_time })
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}
