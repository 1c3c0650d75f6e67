//! Fetcher - claim エンジン
//!
//! # 1 ラウンドの流れ
//! 1. トランザクション開始、`lock_next` で候補を 1 件ロック（SKIP LOCKED）
//! 2. グループ列が設定されていれば、グループの全行をロックできた場合のみ続行
//!    （`count_group` と `lock_group` の件数が一致しなければ空ラウンド）
//! 3. 対象行ごとに savepoint → `retire`（DELETE ... RETURNING）→ inbox 記録 →
//!    before_event → processor
//! 4. 失敗した行は savepoint まで巻き戻し、同じトランザクション内で `reschedule`
//! 5. commit 後に after_event / error_event を呼ぶ
//!
//! グループは id 順に処理し、最初の失敗でそのラウンドを打ち切る。
//! 残りの行は commit でロックが外れ、次のラウンドで先頭になった行から再開される。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Configuration;
use crate::domain::{EventId, EventRecord, Message};
use crate::error::{HandlerError, OutboxError, StoreError, error_report};
use crate::ports::{ClaimTransaction, GroupMember, OutboxStore, Reschedule, Selection};

/// Callback invoked once per claimed message.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a [`Processor`].
pub struct FnProcessor<F>(F);

pub fn from_fn<F>(f: F) -> FnProcessor<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    FnProcessor(f)
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    async fn process(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message)
    }
}

enum Outcome {
    Delivered(Message),
    Failed(EventRecord, HandlerError),
}

/// Claims outbox rows and hands them to a [`Processor`].
///
/// # 使用例
/// ```ignore
/// let fetcher = Fetcher::new(store, Arc::new(config));
/// let processed = fetcher
///     .fetch_events(&from_fn(|message| {
///         println!("{}", message.event_type);
///         Ok(())
///     }))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Fetcher {
    store: Arc<dyn OutboxStore>,
    config: Arc<Configuration>,
}

impl Fetcher {
    pub fn new(store: Arc<dyn OutboxStore>, config: Arc<Configuration>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn selection(&self) -> Selection {
        let settings = self.config.settings();
        Selection {
            max_attempts: settings.max_attempts,
            group_heads: settings.group_column.is_some(),
        }
    }

    /// Locks the rows for this round. Empty when nothing is claimable or the
    /// candidate's group is partly held by another claimant.
    async fn select(&self, tx: &mut dyn ClaimTransaction) -> Result<Vec<EventId>, StoreError> {
        let selection = self.selection();
        let Some(candidate) = tx.lock_next(&selection).await? else {
            return Ok(Vec::new());
        };
        let group = match candidate.group_key {
            Some(group) if selection.group_heads => group,
            _ => return Ok(vec![candidate.id]),
        };

        let total = tx.count_group(&group).await?;
        let members = tx.lock_group(&group, &selection).await?;
        if members.len() as u64 != total {
            debug!(
                group = %group,
                total,
                lockable = members.len(),
                "group is busy, skipping round"
            );
            return Ok(Vec::new());
        }

        Ok(group_run(&members))
    }

    /// Runs one claim round and returns how many messages reached `processor`.
    ///
    /// Handler failures are rescheduled and do not surface here. Store errors
    /// and after/error hook failures do.
    pub async fn fetch_events<P>(&self, processor: &P) -> Result<usize, OutboxError>
    where
        P: Processor + ?Sized,
    {
        let settings = self.config.settings();
        let hooks = self.config.hooks();

        let mut tx = self.store.begin().await?;
        let ids = self.select(tx.as_mut()).await?;
        if ids.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut processed = 0;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            tx.savepoint().await?;
            let Some(record) = tx.retire(id).await? else {
                tx.release_savepoint().await?;
                continue;
            };

            if settings.inbox.is_some()
                && let Some(unique_id) = record.unique_id.as_deref()
                && !tx.record_delivery(unique_id).await?
            {
                debug!(event_id = %id, unique_id, "duplicate delivery discarded");
                tx.release_savepoint().await?;
                continue;
            }

            let message = record.to_message();
            let result = match hooks.run_before_event(&message) {
                Ok(()) => {
                    processed += 1;
                    processor.process(&message).await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    tx.release_savepoint().await?;
                    debug!(event_id = %id, event_type = %message.event_type, "event processed");
                    outcomes.push(Outcome::Delivered(message));
                }
                Err(err) => {
                    tx.rollback_to_savepoint().await?;
                    tx.release_savepoint().await?;
                    outcomes.push(Outcome::Failed(record, err));
                    // later rows of a group must wait for this one
                    break;
                }
            }
        }

        let mut finished = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Outcome::Delivered(message) => finished.push((message, None)),
                Outcome::Failed(record, err) => {
                    let attempts = record.attempts.saturating_add(1);
                    let reschedule = Reschedule {
                        retry_in: settings.retry.next_delay(attempts),
                        last_error: error_report(&*err),
                    };
                    let updated = tx.reschedule(record.id, &reschedule).await?;
                    warn!(
                        event_id = %record.id,
                        event_type = %record.event_type,
                        attempts,
                        retry_in_ms = reschedule.retry_in.as_millis() as u64,
                        error = %err,
                        "event failed, rescheduled"
                    );
                    finished.push((updated.to_message(), Some(err)));
                }
            }
        }

        tx.commit().await?;

        for (message, err) in &finished {
            match err {
                None => hooks.run_after_event(message)?,
                Some(err) => hooks.run_error_event(message, err)?,
            }
        }
        Ok(processed)
    }

    /// Claims and deletes one round of rows without invoking hooks or retries.
    pub async fn take_events(&self) -> Result<Vec<Message>, OutboxError> {
        let inbox = self.config.settings().inbox.is_some();

        let mut tx = self.store.begin().await?;
        let ids = self.select(tx.as_mut()).await?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = tx.retire(id).await? else {
                continue;
            };
            if inbox
                && let Some(unique_id) = record.unique_id.as_deref()
                && !tx.record_delivery(unique_id).await?
            {
                continue;
            }
            messages.push(record.to_message());
        }

        tx.commit().await?;
        Ok(messages)
    }
}

/// Leading run of a locked group that can be processed now: exhausted rows
/// are skipped, the run stops at the first row that is not yet due.
fn group_run(members: &[GroupMember]) -> Vec<EventId> {
    members
        .iter()
        .filter(|member| !member.exhausted)
        .take_while(|member| member.eligible)
        .map(|member| member.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewEvent;
    use crate::impls::InMemoryOutboxStore;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn fetcher(store: &InMemoryOutboxStore, config: Configuration) -> Fetcher {
        Fetcher::new(Arc::new(store.clone()), Arc::new(config))
    }

    fn config() -> Configuration {
        Configuration::builder().build().unwrap()
    }

    fn grouped() -> Configuration {
        Configuration::builder()
            .group_column("group_id")
            .build()
            .unwrap()
    }

    fn record_types(
        seen: &Mutex<Vec<String>>,
    ) -> impl Fn(&Message) -> Result<(), HandlerError> + '_ {
        move |message| {
            seen.lock().unwrap().push(message.event_type.clone());
            Ok(())
        }
    }

    #[test]
    fn group_run_skips_exhausted_and_stops_at_first_not_due() {
        let member = |id, eligible, exhausted| GroupMember {
            id: EventId::new(id),
            eligible,
            exhausted,
        };
        let members = [
            member(1, false, true),
            member(2, true, false),
            member(3, true, false),
            member(4, false, false),
            member(5, true, false),
        ];
        assert_eq!(group_run(&members), vec![EventId::new(2), EventId::new(3)]);
    }

    #[tokio::test]
    async fn processes_one_row_and_deletes_it() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("event_created").after(json!({ "foo": "bar" })));
        let fetcher = fetcher(&store, config());

        let seen = Mutex::new(Vec::new());
        let processed = fetcher
            .fetch_events(&from_fn(record_types(&seen)))
            .await
            .unwrap();

        assert_eq!(processed, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["event_created".to_string()]);
        assert!(store.is_empty());
        assert_eq!(fetcher.fetch_events(&from_fn(|_| Ok(()))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_table_returns_zero() {
        let store = InMemoryOutboxStore::new();
        let fetcher = fetcher(&store, config());
        let processed = fetcher.fetch_events(&from_fn(|_| Ok(()))).await.unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_row_goes_to_exactly_one_claimant() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("event_created"));
        let fetcher = fetcher(&store, config());

        let rounds: Vec<_> = (0..8)
            .map(|_| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move {
                    let slow = from_fn(|_| {
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(())
                    });
                    fetcher.fetch_events(&slow).await.unwrap()
                })
            })
            .collect();

        let mut counts = Vec::new();
        for round in rounds {
            counts.push(round.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimants_deliver_each_row_exactly_once() {
        let store = InMemoryOutboxStore::new();
        for n in 0..40 {
            store.insert(NewEvent::new("event_created").after(json!({ "n": n })));
        }
        let fetcher = fetcher(&store, config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let fetcher = fetcher.clone();
            let seen = Arc::clone(&seen);
            tasks.push(tokio::spawn(async move {
                let processor = from_fn(move |message: &Message| {
                    seen.lock().unwrap().push(message.id);
                    Ok(())
                });
                while fetcher.fetch_events(&processor).await.unwrap() > 0 {
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 40);
        assert_eq!(unique.len(), 40);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = InMemoryOutboxStore::with_clock(clock.clone());
        let id = store.insert(NewEvent::new("event_created"));
        let fetcher = fetcher(&store, config());
        let failing = from_fn(|_| Err("boom".into()));

        assert_eq!(fetcher.fetch_events(&failing).await.unwrap(), 1);
        let row = store.get(id).unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.run_at, Some(t0 + chrono::Duration::seconds(1)));
        assert!(row.last_error.as_deref().unwrap().starts_with("boom"));
        assert!(!store.is_locked(id));

        // not due yet
        assert_eq!(fetcher.fetch_events(&failing).await.unwrap(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(fetcher.fetch_events(&failing).await.unwrap(), 1);
        let row = store.get(id).unwrap();
        assert_eq!(row.attempts, 2);
        assert_eq!(
            row.run_at,
            Some(t0 + chrono::Duration::seconds(2) + chrono::Duration::seconds(2))
        );
    }

    #[tokio::test]
    async fn exhausted_rows_stay_but_are_never_claimed() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert_with_state(NewEvent::new("event_created"), 3, None);
        let config = Configuration::builder().max_attempts(3).build().unwrap();
        let fetcher = fetcher(&store, config);

        let calls = AtomicUsize::new(0);
        let processed = fetcher
            .fetch_events(&from_fn(|_| {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        assert!(store.get(id).is_some());
    }

    #[tokio::test]
    async fn claims_newest_scheduled_retries_before_fresh_rows_in_id_order() {
        let store = InMemoryOutboxStore::new();
        let past = Utc::now() - chrono::Duration::minutes(5);
        store.insert(NewEvent::new("fresh_1"));
        store.insert_with_state(NewEvent::new("retry_old"), 1, Some(past));
        store.insert(NewEvent::new("fresh_2"));
        store.insert_with_state(
            NewEvent::new("retry_new"),
            1,
            Some(past + chrono::Duration::minutes(1)),
        );
        let fetcher = fetcher(&store, config());

        let seen = Mutex::new(Vec::new());
        let processor = from_fn(record_types(&seen));
        while fetcher.fetch_events(&processor).await.unwrap() > 0 {}

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["fresh_1", "fresh_2", "retry_new", "retry_old"]
        );
    }

    #[tokio::test]
    async fn before_event_failure_counts_as_handler_failure() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert(NewEvent::new("event_created"));
        let config = Configuration::builder()
            .before_event(|_| Err("not ready".into()))
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        let calls = AtomicUsize::new(0);
        let processed = fetcher
            .fetch_events(&from_fn(|_| {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(processed, 0);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        let row = store.get(id).unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("not ready"));
    }

    #[tokio::test]
    async fn after_and_error_hooks_run_with_outcome() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("good"));
        store.insert(NewEvent::new("bad"));

        let after = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let after_hook = Arc::clone(&after);
        let error_hook = Arc::clone(&errors);
        let config = Configuration::builder()
            .after_event(move |message| {
                after_hook.lock().unwrap().push(message.event_type.clone());
                Ok(())
            })
            .error_event(move |message, err| {
                error_hook.lock().unwrap().push((
                    message.event_type.clone(),
                    message.attempts,
                    err.to_string(),
                ));
                Ok(())
            })
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        let processor = from_fn(|message: &Message| {
            if message.event_type == "bad" {
                Err("rejected".into())
            } else {
                Ok(())
            }
        });
        fetcher.fetch_events(&processor).await.unwrap();
        fetcher.fetch_events(&processor).await.unwrap();

        assert_eq!(*after.lock().unwrap(), vec!["good".to_string()]);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![("bad".to_string(), 1, "rejected".to_string())]
        );
    }

    #[tokio::test]
    async fn after_hook_failure_surfaces_after_commit() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("event_created"));
        let config = Configuration::builder()
            .after_event(|_| Err("metrics down".into()))
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        let err = fetcher
            .fetch_events(&from_fn(|_| Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::Hook { .. }));
        assert!(err.to_string().starts_with("after_event hook failed"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn inbox_discards_duplicate_unique_ids() {
        let store = InMemoryOutboxStore::new();
        for unique_id in ["foo", "bar", "foo"] {
            store.insert(NewEvent::new("event_created").unique_id(unique_id));
        }
        let config = Configuration::builder()
            .inbox("inbox", "unique_id")
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        let calls = AtomicUsize::new(0);
        let processor = from_fn(|_| {
            calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        let mut rounds = 0;
        while !store.is_empty() {
            fetcher.fetch_events(&processor).await.unwrap();
            rounds += 1;
        }

        assert_eq!(rounds, 3);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(store.inbox_len(), 2);
    }

    #[tokio::test]
    async fn failed_delivery_does_not_keep_inbox_entry() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert(NewEvent::new("event_created").unique_id("foo"));
        let config = Configuration::builder()
            .inbox("inbox", "unique_id")
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        fetcher
            .fetch_events(&from_fn(|_| Err("boom".into())))
            .await
            .unwrap();

        assert_eq!(store.inbox_len(), 0);
        assert_eq!(store.get(id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn without_inbox_unique_ids_are_ignored() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("event_created").unique_id("foo"));
        store.insert(NewEvent::new("event_created").unique_id("foo"));
        let fetcher = fetcher(&store, config());

        let calls = AtomicUsize::new(0);
        let processor = from_fn(|_| {
            calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        while fetcher.fetch_events(&processor).await.unwrap() > 0 {}

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(store.inbox_len(), 0);
    }

    /// Runs a second claim round from inside the handler.
    struct Nested {
        inner: Fetcher,
        seen: Mutex<Vec<String>>,
        nested_seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Nested {
        async fn process(&self, message: &Message) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(message.event_type.clone());
            let nested_seen = Arc::clone(&self.nested_seen);
            self.inner
                .fetch_events(&from_fn(move |message: &Message| {
                    nested_seen.lock().unwrap().push(message.event_type.clone());
                    Ok(())
                }))
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn claimant_holding_a_group_blocks_that_group_only() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("a1").group("A"));
        store.insert(NewEvent::new("a2").group("A"));
        store.insert(NewEvent::new("b1").group("B"));
        let fetcher = fetcher(&store, grouped());

        let nested_seen = Arc::new(Mutex::new(Vec::new()));
        let processor = Nested {
            inner: fetcher.clone(),
            seen: Mutex::new(Vec::new()),
            nested_seen: Arc::clone(&nested_seen),
        };
        let processed = fetcher.fetch_events(&processor).await.unwrap();

        // the outer round owned group A and processed it in order
        assert_eq!(processed, 2);
        assert_eq!(*processor.seen.lock().unwrap(), vec!["a1", "a2"]);
        // nested rounds could only reach group B
        assert_eq!(*nested_seen.lock().unwrap(), vec!["b1"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn group_round_stops_at_first_failure() {
        let store = InMemoryOutboxStore::new();
        let a1 = store.insert(NewEvent::new("a1").group("A"));
        let a2 = store.insert(NewEvent::new("a2").group("A"));
        let fetcher = fetcher(&store, grouped());

        let seen = Mutex::new(Vec::new());
        let processor = from_fn(|message: &Message| {
            seen.lock().unwrap().push(message.event_type.clone());
            Err("boom".into())
        });
        let processed = fetcher.fetch_events(&processor).await.unwrap();

        assert_eq!(processed, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a1"]);
        assert_eq!(store.get(a1).unwrap().attempts, 1);
        assert_eq!(store.get(a2).unwrap().attempts, 0);

        // a2 waits behind the rescheduled head
        assert_eq!(fetcher.fetch_events(&processor).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_with_locked_member_is_skipped() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("a1").group("A"));
        let a2 = store.insert(NewEvent::new("a2").group("A"));
        let fetcher = fetcher(&store, grouped());

        // another claimant holds a2 only
        let mut other = store.begin().await.unwrap();
        other.retire(a2).await.unwrap();

        let calls = AtomicUsize::new(0);
        let processor = from_fn(|_| {
            calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        assert_eq!(fetcher.fetch_events(&processor).await.unwrap(), 0);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);

        other.rollback().await.unwrap();
        assert_eq!(fetcher.fetch_events(&processor).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rows_without_group_are_independent_in_group_mode() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("loose_1"));
        store.insert(NewEvent::new("loose_2"));
        let fetcher = fetcher(&store, grouped());

        let processor = from_fn(|_| Ok(()));
        assert_eq!(fetcher.fetch_events(&processor).await.unwrap(), 1);
        assert_eq!(fetcher.fetch_events(&processor).await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn take_events_returns_messages_without_hooks() {
        let store = InMemoryOutboxStore::new();
        store.insert(NewEvent::new("event_created").after(json!({ "foo": "bar" })));

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_calls);
        let config = Configuration::builder()
            .after_event(move |_| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
            .build()
            .unwrap();
        let fetcher = fetcher(&store, config);

        let messages = fetcher.take_events().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].after, Some(json!({ "foo": "bar" })));
        assert_eq!(hook_calls.load(AtomicOrdering::SeqCst), 0);
        assert!(store.is_empty());
        assert!(fetcher.take_events().await.unwrap().is_empty());
    }
}
