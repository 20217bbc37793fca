//! Message channel envelopes (`{type, payload}`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands sent by a page to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    QueueUpload(Value),
    QueueAnnotation(Value),
    GetCacheStatus,
    ClearCache,
    SkipWaiting,
}

/// Replies and broadcasts sent by the engine to pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Entry count per partition and pending item count per queue.
    CacheStatus(BTreeMap<String, usize>),
    CacheCleared,
    #[serde(rename_all = "camelCase")]
    UploadComplete { id: i64, file_name: Option<String> },
}

impl WorkerMessage {
    pub fn to_value(&self) -> Value {
        // Maps with string keys, integers and strings always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
