//! InMemoryOutboxStore - 開発・テスト用の Event Store Adapter
//!
//! # 再現している意味論
//! - 行ロック: claim トランザクションが `lock_next` / `lock_group` で取得し、
//!   commit / rollback / drop で解放する。他トランザクションがロック中の行は見えない（SKIP LOCKED）
//! - 未コミットの削除: `retire` した行は commit まで表に残り、他トランザクションの
//!   `count_group` には数えられる（MVCC と同じ見え方）
//! - savepoint: undo ログの位置で表現し、`rollback_to_savepoint` で巻き戻す
//! - inbox: unique_id の集合。未コミットの挿入も他トランザクションからは衝突として見える
//!
//! `std::sync::Mutex` は await を跨いで保持しない。

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EventId, EventRecord, NewEvent, OutboxCounts};
use crate::error::StoreError;
use crate::ports::{
    Candidate, ClaimTransaction, Clock, GroupMember, OutboxStore, Reschedule, Selection,
    SystemClock,
};

type TxId = u64;

struct StoredRow {
    record: EventRecord,
    locked_by: Option<TxId>,
    deleted_by: Option<TxId>,
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<EventId, StoredRow>,
    /// unique_id -> inserting transaction (None once committed)
    inbox: HashMap<String, Option<TxId>>,
    next_id: i64,
    next_tx: TxId,
}

impl StoreState {
    fn visible_to(&self, tx: TxId) -> impl Iterator<Item = &StoredRow> {
        self.rows
            .values()
            .filter(move |row| row.deleted_by != Some(tx))
    }

    fn lockable_by(row: &StoredRow, tx: TxId) -> bool {
        row.deleted_by.is_none() && row.locked_by.is_none_or(|owner| owner == tx)
    }

    fn is_group_head(&self, tx: TxId, record: &EventRecord, max_attempts: u32) -> bool {
        let Some(key) = record.group_key.as_deref() else {
            return true;
        };
        !self.visible_to(tx).any(|other| {
            other.record.group_key.as_deref() == Some(key)
                && other.record.id < record.id
                && !other.record.is_exhausted(max_attempts)
        })
    }

    fn release(&mut self, tx: TxId) {
        for row in self.rows.values_mut() {
            if row.locked_by == Some(tx) {
                row.locked_by = None;
            }
        }
    }
}

/// `run_at` descending with nulls first, then `id` ascending.
fn selection_order(a: &EventRecord, b: &EventRecord) -> Ordering {
    let by_run_at = match (a.run_at, b.run_at) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    };
    by_run_at.then(a.id.cmp(&b.id))
}

fn lock_state(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory outbox table with an optional inbox.
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryOutboxStore::new());
/// store.insert(NewEvent::new("event_created").after(json!({"foo": "bar"})));
/// let fetcher = Fetcher::new(store.clone(), config);
/// ```
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    inbox: bool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                next_id: 1,
                next_tx: 1,
                ..StoreState::default()
            })),
            clock,
            inbox: false,
        }
    }

    /// Reports the inbox in `counts`, as a store configured with an inbox
    /// table does.
    pub fn with_inbox(mut self) -> Self {
        self.inbox = true;
        self
    }

    pub fn insert(&self, event: NewEvent) -> EventId {
        self.insert_with_state(event, 0, None)
    }

    /// Inserts a row that already carries retry state.
    pub fn insert_with_state(
        &self,
        event: NewEvent,
        attempts: u32,
        run_at: Option<DateTime<Utc>>,
    ) -> EventId {
        let now = self.clock.now();
        let mut state = lock_state(&self.state);
        let id = EventId::new(state.next_id);
        state.next_id += 1;
        state.rows.insert(
            id,
            StoredRow {
                record: EventRecord {
                    id,
                    event_type: event.event_type,
                    data_before: event.data_before,
                    data_after: event.data_after,
                    created_at: now,
                    attempts,
                    run_at,
                    last_error: None,
                    metadata: event.metadata,
                    group_key: event.group_key,
                    unique_id: event.unique_id,
                },
                locked_by: None,
                deleted_by: None,
            },
        );
        id
    }

    /// Current row, including rows whose deletion is not yet committed.
    pub fn get(&self, id: EventId) -> Option<EventRecord> {
        lock_state(&self.state)
            .rows
            .get(&id)
            .map(|row| row.record.clone())
    }

    pub fn len(&self) -> usize {
        lock_state(&self.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inbox_len(&self) -> usize {
        lock_state(&self.state)
            .inbox
            .values()
            .filter(|owner| owner.is_none())
            .count()
    }

    pub fn is_locked(&self, id: EventId) -> bool {
        lock_state(&self.state)
            .rows
            .get(&id)
            .is_some_and(|row| row.locked_by.is_some())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn begin(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        let id = {
            let mut state = lock_state(&self.state);
            let id = state.next_tx;
            state.next_tx += 1;
            id
        };
        Ok(Box::new(InMemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            undo: Vec::new(),
            savepoint: None,
            finished: false,
        }))
    }

    async fn enqueue(&self, event: &NewEvent) -> Result<EventId, StoreError> {
        Ok(self.insert(event.clone()))
    }

    async fn counts(&self, max_attempts: u32) -> Result<OutboxCounts, StoreError> {
        let state = lock_state(&self.state);
        let inbox = state.inbox.values().filter(|owner| owner.is_none()).count();
        let mut counts = OutboxCounts {
            inbox: self.inbox.then_some(inbox as u64),
            ..OutboxCounts::default()
        };
        for row in state.rows.values() {
            let record = &row.record;
            if record.is_exhausted(max_attempts) {
                counts.failed += 1;
            } else if record.last_error.is_some() {
                counts.failing += 1;
            } else {
                counts.pending += 1;
            }
        }
        Ok(counts)
    }
}

enum Undo {
    Delete(EventId),
    Inbox(String),
    Update(EventRecord),
}

/// Claim transaction over [`InMemoryOutboxStore`].
pub struct InMemoryTransaction {
    id: TxId,
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
    undo: Vec<Undo>,
    /// Position in `undo` where the open savepoint starts.
    savepoint: Option<usize>,
    finished: bool,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Closed(format!("transaction {} finished", self.id)));
        }
        Ok(())
    }

    fn undo_to(&mut self, state: &mut StoreState, mark: usize) {
        while self.undo.len() > mark {
            let Some(entry) = self.undo.pop() else {
                break;
            };
            match entry {
                Undo::Delete(id) => {
                    if let Some(row) = state.rows.get_mut(&id) {
                        row.deleted_by = None;
                    }
                }
                Undo::Inbox(unique_id) => {
                    state.inbox.remove(&unique_id);
                }
                Undo::Update(previous) => {
                    if let Some(row) = state.rows.get_mut(&previous.id) {
                        row.record = previous;
                    }
                }
            }
        }
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        let state_ref = Arc::clone(&self.state);
        let mut state = lock_state(&state_ref);
        self.undo_to(&mut state, 0);
        state.release(self.id);
        self.finished = true;
    }
}

#[async_trait]
impl ClaimTransaction for InMemoryTransaction {
    async fn lock_next(&mut self, selection: &Selection) -> Result<Option<Candidate>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let tx = self.id;
        let mut state = lock_state(&self.state);

        let next = state
            .rows
            .values()
            .filter(|row| StoreState::lockable_by(row, tx))
            .filter(|row| row.record.is_eligible(now, selection.max_attempts))
            .filter(|row| {
                !selection.group_heads
                    || state.is_group_head(tx, &row.record, selection.max_attempts)
            })
            .min_by(|a, b| selection_order(&a.record, &b.record))
            .map(|row| Candidate {
                id: row.record.id,
                group_key: row.record.group_key.clone(),
            });

        if let Some(candidate) = &next
            && let Some(row) = state.rows.get_mut(&candidate.id)
        {
            row.locked_by = Some(tx);
        }
        Ok(next)
    }

    async fn count_group(&mut self, group_key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let state = lock_state(&self.state);
        Ok(state
            .visible_to(self.id)
            .filter(|row| row.record.group_key.as_deref() == Some(group_key))
            .count() as u64)
    }

    async fn lock_group(
        &mut self,
        group_key: &str,
        selection: &Selection,
    ) -> Result<Vec<GroupMember>, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let tx = self.id;
        let mut state = lock_state(&self.state);

        // BTreeMap iteration is already in id order
        Ok(state
            .rows
            .values_mut()
            .filter(|row| row.record.group_key.as_deref() == Some(group_key))
            .filter(|row| StoreState::lockable_by(row, tx))
            .map(|row| {
                row.locked_by = Some(tx);
                GroupMember {
                    id: row.record.id,
                    eligible: row.record.is_eligible(now, selection.max_attempts),
                    exhausted: row.record.is_exhausted(selection.max_attempts),
                }
            })
            .collect())
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.savepoint = Some(self.undo.len());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let Some(mark) = self.savepoint else {
            return Err(StoreError::Closed("no savepoint to roll back to".into()));
        };
        let state_ref = Arc::clone(&self.state);
        let mut state = lock_state(&state_ref);
        self.undo_to(&mut state, mark);
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.savepoint = None;
        Ok(())
    }

    async fn retire(&mut self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        self.ensure_open()?;
        let tx = self.id;
        let mut state = lock_state(&self.state);
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(None);
        };
        if row.deleted_by.is_some() || row.locked_by.is_some_and(|owner| owner != tx) {
            return Ok(None);
        }
        row.deleted_by = Some(tx);
        row.locked_by = Some(tx);
        let record = row.record.clone();
        drop(state);
        self.undo.push(Undo::Delete(id));
        Ok(Some(record))
    }

    async fn record_delivery(&mut self, unique_id: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state);
        if state.inbox.contains_key(unique_id) {
            return Ok(false);
        }
        state.inbox.insert(unique_id.to_string(), Some(self.id));
        drop(state);
        self.undo.push(Undo::Inbox(unique_id.to_string()));
        Ok(true)
    }

    async fn reschedule(
        &mut self,
        id: EventId,
        reschedule: &Reschedule,
    ) -> Result<EventRecord, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let retry_in = chrono::Duration::from_std(reschedule.retry_in)
            .map_err(|e| StoreError::Database(format!("retry delay out of range: {e}")))?;
        let mut state = lock_state(&self.state);
        let row = state
            .rows
            .get_mut(&id)
            .filter(|row| row.deleted_by.is_none())
            .ok_or(StoreError::NotFound(id.get()))?;

        let previous = row.record.clone();
        row.record.attempts += 1;
        row.record.run_at = Some(now + retry_in);
        row.record.last_error = Some(reschedule.last_error.clone());
        let updated = row.record.clone();
        drop(state);
        self.undo.push(Undo::Update(previous));
        Ok(updated)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let tx = self.id;
        let mut state = lock_state(&self.state);
        state.rows.retain(|_, row| row.deleted_by != Some(tx));
        for owner in state.inbox.values_mut() {
            if *owner == Some(tx) {
                *owner = None;
            }
        }
        state.release(tx);
        drop(state);
        self.undo.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.abort();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.abort();
    }
}
