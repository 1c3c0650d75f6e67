//! PgOutboxStore - PostgreSQL の Event Store Adapter
//!
//! # 設計原則
//! - 選択は `FOR UPDATE SKIP LOCKED`。他の claim が掴んでいる行は待たずに飛ばす
//! - 行の削除（`DELETE ... RETURNING`）が claim の確定点
//! - 1 行ごとに savepoint を張り、handler 失敗時は削除だけを巻き戻す
//! - SQL はテーブル名・カラム名を埋め込んで起動時に一度だけ組み立てる
//!   （識別子は `Settings::validate` で検証済み）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use crate::config::Settings;
use crate::domain::{EventId, EventRecord, NewEvent, OutboxCounts};
use crate::error::StoreError;
use crate::ports::{Candidate, ClaimTransaction, GroupMember, OutboxStore, Reschedule, Selection};

const SAVEPOINT: &str = "SAVEPOINT outboxer_claim";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT outboxer_claim";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT outboxer_claim";

/// SQL text rendered for one table layout.
#[derive(Debug)]
struct Statements {
    lock_next: String,
    lock_next_group_head: String,
    count_group: Option<String>,
    lock_group: Option<String>,
    retire: String,
    reschedule: String,
    record_delivery: Option<String>,
    enqueue: String,
    enqueue_binds_group: bool,
    enqueue_binds_unique_id: bool,
    counts: String,
    count_inbox: Option<String>,
    schema: String,
}

impl Statements {
    fn render(settings: &Settings) -> Self {
        let table = &settings.table;
        let group_expr = settings
            .group_column
            .as_deref()
            .map(|column| format!("{column}::text"))
            .unwrap_or_else(|| "NULL::text".to_string());
        let unique_expr = settings
            .inbox
            .as_ref()
            .map(|inbox| format!("{}::text", inbox.column))
            .unwrap_or_else(|| "NULL::text".to_string());
        let returning = format!(
            "id, type, data_before, data_after, created_at, attempts, run_at, last_error, \
             metadata, {group_expr} AS group_key, {unique_expr} AS unique_id"
        );
        let eligible = "candidate.attempts < $1 \
                        AND (candidate.run_at IS NULL OR candidate.run_at < now())";
        let candidate_group = settings
            .group_column
            .as_deref()
            .map(|column| format!("candidate.{column}::text"))
            .unwrap_or_else(|| "NULL::text".to_string());

        let lock_next = format!(
            "SELECT candidate.id, {candidate_group} AS group_key FROM {table} AS candidate \
             WHERE {eligible} \
             ORDER BY candidate.run_at DESC NULLS FIRST, candidate.id \
             LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let lock_next_group_head = match settings.group_column.as_deref() {
            Some(column) => format!(
                "SELECT candidate.id, {candidate_group} AS group_key FROM {table} AS candidate \
                 WHERE {eligible} \
                 AND NOT EXISTS (SELECT 1 FROM {table} AS prior \
                   WHERE prior.{column} = candidate.{column} \
                   AND prior.id < candidate.id AND prior.attempts < $1) \
                 ORDER BY candidate.run_at DESC NULLS FIRST, candidate.id \
                 LIMIT 1 FOR UPDATE OF candidate SKIP LOCKED"
            ),
            None => lock_next.clone(),
        };

        let count_group = settings
            .group_column
            .as_deref()
            .map(|column| format!("SELECT COUNT(*) FROM {table} WHERE {column}::text = $1"));
        let lock_group = settings.group_column.as_deref().map(|column| {
            format!(
                "SELECT id, \
                   (attempts < $2 AND (run_at IS NULL OR run_at < now())) AS eligible, \
                   (attempts >= $2) AS exhausted \
                 FROM {table} WHERE {column}::text = $1 \
                 ORDER BY id FOR UPDATE SKIP LOCKED"
            )
        });

        let mut insert_columns = vec!["type", "data_before", "data_after", "metadata"];
        if let Some(column) = settings.group_column.as_deref() {
            insert_columns.push(column);
        }
        if let Some(inbox) = &settings.inbox {
            insert_columns.push(inbox.column.as_str());
        }
        let placeholders: Vec<String> = (1..=insert_columns.len())
            .map(|i| format!("${i}"))
            .collect();

        Self {
            lock_next,
            lock_next_group_head,
            count_group,
            lock_group,
            retire: format!("DELETE FROM {table} WHERE id = $1 RETURNING {returning}"),
            reschedule: format!(
                "UPDATE {table} SET attempts = attempts + 1, \
                 run_at = clock_timestamp() + make_interval(secs => $2::double precision), \
                 last_error = $3 \
                 WHERE id = $1 RETURNING {returning}"
            ),
            record_delivery: settings.inbox.as_ref().map(|inbox| {
                format!(
                    "INSERT INTO {table} ({column}) VALUES ($1) \
                     ON CONFLICT DO NOTHING RETURNING {column}",
                    table = inbox.table,
                    column = inbox.column
                )
            }),
            enqueue: format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING id",
                insert_columns.join(", "),
                placeholders.join(", ")
            ),
            enqueue_binds_group: settings.group_column.is_some(),
            enqueue_binds_unique_id: settings.inbox.is_some(),
            counts: format!(
                "SELECT \
                   COUNT(*) FILTER (WHERE attempts < $1 AND last_error IS NULL) AS pending, \
                   COUNT(*) FILTER (WHERE attempts < $1 AND last_error IS NOT NULL) AS failing, \
                   COUNT(*) FILTER (WHERE attempts >= $1) AS failed \
                 FROM {table}"
            ),
            count_inbox: settings
                .inbox
                .as_ref()
                .map(|inbox| format!("SELECT COUNT(*) FROM {}", inbox.table)),
            schema: render_schema(settings),
        }
    }
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn render_schema(settings: &Settings) -> String {
    let table = &settings.table;
    let index_prefix = unqualified(table);
    let mut extra_columns = String::new();
    if let Some(column) = settings.group_column.as_deref() {
        extra_columns.push_str(&format!(",\n  {column} TEXT"));
    }
    if let Some(inbox) = &settings.inbox {
        extra_columns.push_str(&format!(",\n  {} TEXT", inbox.column));
    }

    let mut schema = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20 id BIGSERIAL PRIMARY KEY,\n\
         \x20 type VARCHAR NOT NULL,\n\
         \x20 data_before JSONB,\n\
         \x20 data_after JSONB,\n\
         \x20 created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
         \x20 attempts INTEGER NOT NULL DEFAULT 0,\n\
         \x20 run_at TIMESTAMPTZ,\n\
         \x20 last_error TEXT,\n\
         \x20 metadata JSONB{extra_columns}\n\
         );\n\
         CREATE INDEX IF NOT EXISTS {index_prefix}_run_at_idx ON {table} (run_at DESC);\n"
    );
    if let Some(column) = settings.group_column.as_deref() {
        schema.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS {index_prefix}_{column}_idx ON {table} ({column}, id);\n"
        ));
    }
    if let Some(inbox) = &settings.inbox {
        schema.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {inbox_table} (\n\
             \x20 {inbox_column} TEXT PRIMARY KEY,\n\
             \x20 created_at TIMESTAMPTZ NOT NULL DEFAULT now()\n\
             );\n",
            inbox_table = inbox.table,
            inbox_column = inbox.column,
        ));
    }
    schema
}

fn decode_record(row: &PgRow) -> Result<EventRecord, StoreError> {
    let attempts: i32 = row.try_get("attempts")?;
    Ok(EventRecord {
        id: EventId::new(row.try_get("id")?),
        event_type: row.try_get("type")?,
        data_before: row.try_get::<Option<Value>, _>("data_before")?,
        data_after: row.try_get::<Option<Value>, _>("data_after")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        run_at: row.try_get::<Option<DateTime<Utc>>, _>("run_at")?,
        last_error: row.try_get("last_error")?,
        metadata: row.try_get::<Option<Value>, _>("metadata")?,
        group_key: row.try_get("group_key")?,
        unique_id: row.try_get("unique_id")?,
    })
}

fn to_count(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

/// Outbox table on PostgreSQL.
///
/// # 使用例
/// ```ignore
/// let store = PgOutboxStore::connect("postgres://localhost/app", &settings).await?;
/// store.install_schema().await?;
/// store.enqueue(&NewEvent::new("order_created").after(json!({"id": 1}))).await?;
/// ```
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    sql: Arc<Statements>,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, settings: &Settings) -> Self {
        Self {
            pool,
            sql: Arc::new(Statements::render(settings)),
        }
    }

    /// One connection per worker plus one spare for enqueue / counts.
    pub async fn connect(url: &str, settings: &Settings) -> Result<Self, StoreError> {
        let max_connections = u32::try_from(settings.concurrency + 1).unwrap_or(u32::MAX);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool, settings))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// DDL for the configured outbox (and inbox) tables.
    pub fn schema_sql(&self) -> &str {
        &self.sql.schema
    }

    /// Creates the tables and indexes if they do not exist.
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(&self.sql.schema).execute(&self.pool).await?;
        tracing::info!("outbox schema installed");
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn begin(&self) -> Result<Box<dyn ClaimTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgClaimTransaction {
            tx,
            sql: Arc::clone(&self.sql),
        }))
    }

    async fn enqueue(&self, event: &NewEvent) -> Result<EventId, StoreError> {
        let mut query = sqlx::query_scalar::<_, i64>(&self.sql.enqueue)
            .bind(&event.event_type)
            .bind(event.data_before.as_ref().map(Json))
            .bind(event.data_after.as_ref().map(Json))
            .bind(event.metadata.as_ref().map(Json));
        if self.sql.enqueue_binds_group {
            query = query.bind(event.group_key.as_deref());
        }
        if self.sql.enqueue_binds_unique_id {
            query = query.bind(event.unique_id.as_deref());
        }
        let id = query.fetch_one(&self.pool).await?;
        Ok(EventId::new(id))
    }

    async fn counts(&self, max_attempts: u32) -> Result<OutboxCounts, StoreError> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let row = sqlx::query(&self.sql.counts)
            .bind(max_attempts)
            .fetch_one(&self.pool)
            .await?;
        let inbox = match &self.sql.count_inbox {
            Some(sql) => Some(to_count(
                sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?,
            )),
            None => None,
        };
        Ok(OutboxCounts {
            pending: to_count(row.try_get("pending")?),
            failing: to_count(row.try_get("failing")?),
            failed: to_count(row.try_get("failed")?),
            inbox,
        })
    }
}

/// Claim transaction on a pooled connection.
///
/// Dropping it returns the connection with a rollback queued.
pub struct PgClaimTransaction {
    tx: Transaction<'static, Postgres>,
    sql: Arc<Statements>,
}

#[async_trait]
impl ClaimTransaction for PgClaimTransaction {
    async fn lock_next(&mut self, selection: &Selection) -> Result<Option<Candidate>, StoreError> {
        let sql = if selection.group_heads {
            &self.sql.lock_next_group_head
        } else {
            &self.sql.lock_next
        };
        let max_attempts = i32::try_from(selection.max_attempts).unwrap_or(i32::MAX);
        let row = sqlx::query(sql)
            .bind(max_attempts)
            .fetch_optional(&mut *self.tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Candidate {
            id: EventId::new(row.try_get("id")?),
            group_key: row.try_get("group_key")?,
        }))
    }

    async fn count_group(&mut self, group_key: &str) -> Result<u64, StoreError> {
        let Some(sql) = &self.sql.count_group else {
            return Ok(0);
        };
        let count: i64 = sqlx::query_scalar(sql)
            .bind(group_key)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(to_count(count))
    }

    async fn lock_group(
        &mut self,
        group_key: &str,
        selection: &Selection,
    ) -> Result<Vec<GroupMember>, StoreError> {
        let Some(sql) = &self.sql.lock_group else {
            return Ok(Vec::new());
        };
        let max_attempts = i32::try_from(selection.max_attempts).unwrap_or(i32::MAX);
        let rows = sqlx::query(sql)
            .bind(group_key)
            .bind(max_attempts)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(GroupMember {
                    id: EventId::new(row.try_get("id")?),
                    eligible: row.try_get("eligible")?,
                    exhausted: row.try_get("exhausted")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()
    }

    async fn savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(SAVEPOINT).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(ROLLBACK_TO_SAVEPOINT)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), StoreError> {
        sqlx::query(RELEASE_SAVEPOINT).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn retire(&mut self, id: EventId) -> Result<Option<EventRecord>, StoreError> {
        let row = sqlx::query(&self.sql.retire)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn record_delivery(&mut self, unique_id: &str) -> Result<bool, StoreError> {
        let Some(sql) = &self.sql.record_delivery else {
            return Ok(true);
        };
        let inserted = sqlx::query(sql)
            .bind(unique_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(inserted.is_some())
    }

    async fn reschedule(
        &mut self,
        id: EventId,
        reschedule: &Reschedule,
    ) -> Result<EventRecord, StoreError> {
        let row = sqlx::query(&self.sql.reschedule)
            .bind(id.get())
            .bind(reschedule.retry_in.as_secs_f64())
            .bind(&reschedule.last_error)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::NotFound(id.get()))?;
        decode_record(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
