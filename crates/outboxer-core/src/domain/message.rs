//! Message - claim 済みイベントのメモリ上の表現
//!
//! 1 回の claim を処理するコールスタックだけが所有し、ワーカー間で共有しない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::EventId;

/// Decoded outbox row handed to hooks and handlers.
///
/// Serialises as `{ "id", "type", "before", "after", "at", "attempts", "metadata" }`,
/// which is also the default handler argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Set on messages passed to `error_event` hooks after rescheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    /// Set on messages passed to `error_event` hooks after rescheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Message {
    /// Looks up a correlation value in `metadata`.
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}
