//! Event rows - outbox テーブルの行モデル
//!
//! # 不変条件
//! 行がテーブルに存在する間は「まだ処理に成功していない」。
//! claim で削除され、失敗時のみ attempts / run_at / last_error を更新して残る。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::Message;

/// Primary key of an outbox row. Monotonic, used as the FIFO tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EventId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the outbox table, as returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub event_type: String,
    pub data_before: Option<Value>,
    pub data_after: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: Option<Value>,
    /// Value of the configured group column, rendered as text.
    pub group_key: Option<String>,
    /// Inbox deduplication key.
    pub unique_id: Option<String>,
}

impl EventRecord {
    /// `attempts < max_attempts` かつ `run_at` が null または過去
    pub fn is_eligible(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.attempts < max_attempts && self.run_at.is_none_or(|run_at| run_at < now)
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: self.id,
            event_type: self.event_type.clone(),
            before: self.data_before.clone(),
            after: self.data_after.clone(),
            at: self.created_at,
            attempts: self.attempts,
            metadata: self.metadata.clone(),
            run_at: self.run_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Insert builder for application code writing into the outbox.
///
/// ```ignore
/// let event = NewEvent::new("order_created")
///     .after(json!({ "order_id": 42 }))
///     .group("order-42");
/// store.enqueue(&event).await?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub data_before: Option<Value>,
    pub data_after: Option<Value>,
    pub metadata: Option<Value>,
    pub group_key: Option<String>,
    pub unique_id: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Self::default()
        }
    }

    pub fn before(mut self, data: Value) -> Self {
        self.data_before = Some(data);
        self
    }

    pub fn after(mut self, data: Value) -> Self {
        self.data_after = Some(data);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn group(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    pub fn unique_id(mut self, id: impl Into<String>) -> Self {
        self.unique_id = Some(id.into());
        self
    }
}

/// Snapshot of the outbox backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// Never attempted (`last_error` is null).
    pub pending: u64,
    /// Failed at least once, retries left.
    pub failing: u64,
    /// Retries exhausted.
    pub failed: u64,
    /// Rows in the inbox table, when one is configured.
    pub inbox: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn record(attempts: u32, run_at: Option<DateTime<Utc>>) -> EventRecord {
        EventRecord {
            id: EventId::new(1),
            event_type: "event_created".into(),
            data_before: None,
            data_after: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            attempts,
            run_at,
            last_error: None,
            metadata: None,
            group_key: None,
            unique_id: None,
        }
    }

    #[rstest]
    #[case::fresh(0, None, true)]
    #[case::due_retry(3, Some(-10), true)]
    #[case::future_retry(3, Some(10), false)]
    #[case::exhausted_without_run_at(10, None, false)]
    #[case::exhausted_and_due(10, Some(-10), false)]
    fn eligibility(
        #[case] attempts: u32,
        #[case] offset_secs: Option<i64>,
        #[case] expected: bool,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let run_at = offset_secs.map(|s| now + Duration::seconds(s));
        assert_eq!(record(attempts, run_at).is_eligible(now, 10), expected);
    }

    #[test]
    fn run_at_equal_to_now_is_not_yet_due() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(!record(1, Some(now)).is_eligible(now, 10));
    }

    #[test]
    fn new_event_builder_sets_fields() {
        let event = NewEvent::new("order_created")
            .after(serde_json::json!({ "id": 1 }))
            .group("order-1")
            .unique_id("evt-1");
        assert_eq!(event.event_type, "order_created");
        assert_eq!(event.group_key.as_deref(), Some("order-1"));
        assert_eq!(event.unique_id.as_deref(), Some("evt-1"));
        assert!(event.data_before.is_none());
    }
}
