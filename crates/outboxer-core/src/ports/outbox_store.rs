//! OutboxStore port - Event Store Adapter の抽象化
//!
//! claim エンジンが必要とする最小限のデータベース操作を定義します。
//! ロック・savepoint・`DELETE ... RETURNING` の意味論はアダプタ側が保証し、
//! 行の選び方と結果の記録はエンジン（`app::fetcher`）が決めます。
//!
//! # 実装
//! - `impls::inmem_store`: 行ロックと未コミット削除を再現するテスト用実装
//! - `impls::pg_store`: PostgreSQL (`FOR UPDATE SKIP LOCKED`)

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{EventId, EventRecord, NewEvent, OutboxCounts};
use crate::error::StoreError;

/// Filter for the selection query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub max_attempts: u32,
    /// Only consider the head (lowest id with retries left) of each group.
    pub group_heads: bool,
}

/// A row locked by `lock_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: EventId,
    pub group_key: Option<String>,
}

/// A row locked by `lock_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMember {
    pub id: EventId,
    /// Passes the selection filter right now.
    pub eligible: bool,
    /// `attempts >= max_attempts`
    pub exhausted: bool,
}

/// Retry bookkeeping written for a failed row.
#[derive(Debug, Clone, PartialEq)]
pub struct Reschedule {
    /// `run_at = now + retry_in`, `now` being the store's clock.
    pub retry_in: Duration,
    pub last_error: String,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Opens the outer claim transaction.
    async fn begin(&self) -> Result<Box<dyn ClaimTransaction>, StoreError>;

    /// Inserts a row outside of any claim (application side of the pattern).
    async fn enqueue(&self, event: &NewEvent) -> Result<EventId, StoreError>;

    async fn counts(&self, max_attempts: u32) -> Result<OutboxCounts, StoreError>;
}

/// One open claim transaction.
///
/// Dropping it without `commit` rolls it back and releases every lock it holds.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// Locks the next eligible row, skipping rows locked by other transactions.
    ///
    /// Ordering: `run_at` descending with nulls first, then `id` ascending.
    async fn lock_next(&mut self, selection: &Selection) -> Result<Option<Candidate>, StoreError>;

    /// Counts every row of the group, locked or not.
    async fn count_group(&mut self, group_key: &str) -> Result<u64, StoreError>;

    /// Locks every row of the group this transaction can lock without waiting,
    /// ordered by `id`.
    async fn lock_group(
        &mut self,
        group_key: &str,
        selection: &Selection,
    ) -> Result<Vec<GroupMember>, StoreError>;

    async fn savepoint(&mut self) -> Result<(), StoreError>;

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError>;

    async fn release_savepoint(&mut self) -> Result<(), StoreError>;

    /// Deletes a row and returns its final values.
    async fn retire(&mut self, id: EventId) -> Result<Option<EventRecord>, StoreError>;

    /// Inserts `unique_id` into the inbox. `false` means it was already there.
    async fn record_delivery(&mut self, unique_id: &str) -> Result<bool, StoreError>;

    /// `attempts += 1`, `run_at = now + retry_in`, `last_error = ...`
    async fn reschedule(
        &mut self,
        id: EventId,
        reschedule: &Reschedule,
    ) -> Result<EventRecord, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
