//! Pool - ワーカー集合の起動・停止・自己修復
//!
//! # 状態遷移
//! `Idle --start--> Running --stop--> Stopping --(全ユニット終了)--> Idle`
//!
//! # 停止
//! 1. 全ワーカーに finish を通知（処理中のラウンドは最後まで走る）
//! 2. `shutdown_timeout` まで終了を待つ
//! 3. 残ったユニットは abort する。abort は await 地点でしか効かないため、
//!    同期的にブロックしている handler は止められない
//!
//! # 自己修復
//! ワーカーがエラーまたは panic で終了したら `error_worker` hook に報告し、
//! プールが Running の間は同じ枠に新しいワーカーを起動する。

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::error::OutboxError;
use crate::ports::OutboxStore;

use super::backend::Backend;
use super::worker::{Worker, WorkerSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Stopping,
}

/// How a unit's task ended.
enum UnitExit {
    Finished,
    Crashed,
}

struct Unit {
    id: u64,
    label: String,
    signal: WorkerSignal,
    abort: AbortHandle,
}

struct PoolInner {
    state: PoolState,
    units: Vec<Unit>,
    backend: Option<Backend>,
}

struct Shared {
    store: Arc<dyn OutboxStore>,
    config: Arc<Configuration>,
    inner: Mutex<PoolInner>,
    /// Number of units whose task has not been reaped yet.
    live: watch::Sender<usize>,
    next_unit: AtomicU64,
}

/// Fixed-size set of workers over one store.
///
/// # 使用例
/// ```ignore
/// let pool = Pool::new(store, Arc::new(config));
/// pool.start()?;
/// tokio::signal::ctrl_c().await?;
/// pool.stop().await;
/// ```
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(store: Arc<dyn OutboxStore>, config: Arc<Configuration>) -> Self {
        let (live, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                store,
                config,
                inner: Mutex::new(PoolInner {
                    state: PoolState::Idle,
                    units: Vec::new(),
                    backend: None,
                }),
                live,
                next_unit: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    /// Number of live workers.
    pub fn size(&self) -> usize {
        *self.shared.live.borrow()
    }

    /// Labels of the live workers, oldest first.
    pub fn worker_labels(&self) -> Vec<String> {
        self.shared
            .lock()
            .units
            .iter()
            .map(|unit| unit.label.clone())
            .collect()
    }

    /// Spawns `concurrency` workers on the configured backend.
    ///
    /// Threaded mode must be called from inside a tokio runtime.
    pub fn start(&self) -> Result<(), OutboxError> {
        let settings = self.shared.config.settings();
        let mut inner = self.shared.lock();
        if inner.state != PoolState::Idle {
            return Err(OutboxError::AlreadyRunning);
        }
        if inner.backend.is_none() {
            inner.backend = Some(Backend::start(settings.worker_mode)?);
        }

        inner.state = PoolState::Running;
        for _ in 0..settings.concurrency {
            self.shared.spawn_unit(&mut inner);
        }
        info!(
            concurrency = settings.concurrency,
            mode = %settings.worker_mode,
            "outbox pool started"
        );
        Ok(())
    }

    /// Finishes every worker, waits up to `shutdown_timeout`, then aborts
    /// whatever is left. Returns once no unit is running, also for callers
    /// that arrive while another stop is in progress.
    pub async fn stop(&self) {
        let mut live = self.shared.live.subscribe();
        let stopping_elsewhere = {
            let mut inner = self.shared.lock();
            match inner.state {
                PoolState::Idle => return,
                PoolState::Stopping => true,
                PoolState::Running => {
                    inner.state = PoolState::Stopping;
                    for unit in &inner.units {
                        unit.signal.finish();
                    }
                    false
                }
            }
        };
        if stopping_elsewhere {
            // the first caller owns the timeout and the abort
            let _ = live.wait_for(|n| *n == 0).await;
            self.shared.mark_stopped();
            return;
        }
        info!("outbox pool stopping");

        tokio::task::yield_now().await;

        let timeout = self.shared.config.settings().shutdown_timeout;
        let drained = tokio::time::timeout(timeout, live.wait_for(|n| *n == 0))
            .await
            .is_ok();

        if !drained {
            {
                let inner = self.shared.lock();
                warn!(
                    remaining = inner.units.len(),
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown timeout elapsed, aborting workers"
                );
                for unit in &inner.units {
                    unit.abort.abort();
                }
            }
            let _ = live.wait_for(|n| *n == 0).await;
        }

        self.shared.mark_stopped();
        info!("outbox pool stopped");
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_stopped(&self) {
        let mut inner = self.lock();
        if inner.state == PoolState::Stopping {
            inner.state = PoolState::Idle;
        }
    }

    fn spawn_unit(self: &Arc<Self>, inner: &mut PoolInner) {
        let Some(backend) = inner.backend.as_ref() else {
            return;
        };
        let handle = backend.handle().clone();

        let id = self.next_unit.fetch_add(1, Ordering::Relaxed);
        let label = format!("outboxer-worker-{id}");
        let (worker, signal) = Worker::new(
            label.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        );

        let join = handle.spawn(run_unit(worker, Arc::clone(&self.config)));
        let abort = join.abort_handle();
        let shared = Arc::clone(self);
        handle.spawn(async move {
            let outcome = join.await;
            shared.on_unit_exit(id, outcome);
        });

        debug!(worker = %label, "worker spawned");
        inner.units.push(Unit {
            id,
            label,
            signal,
            abort,
        });
        self.live.send_replace(inner.units.len());
    }

    fn on_unit_exit(self: &Arc<Self>, id: u64, outcome: Result<UnitExit, JoinError>) {
        let label = {
            let inner = self.lock();
            inner
                .units
                .iter()
                .find(|unit| unit.id == id)
                .map(|unit| unit.label.clone())
                .unwrap_or_default()
        };

        let crashed = match outcome {
            Ok(UnitExit::Finished) => false,
            Ok(UnitExit::Crashed) => true,
            Err(err) if err.is_cancelled() => {
                debug!(worker = %label, "worker aborted");
                false
            }
            Err(err) => {
                let panicked = OutboxError::WorkerPanicked {
                    worker: label.clone(),
                    message: panic_message(err.into_panic()),
                };
                error!(worker = %label, error = %panicked, "worker panicked");
                self.config.hooks().run_error_worker(&panicked);
                true
            }
        };

        let mut inner = self.lock();
        inner.units.retain(|unit| unit.id != id);
        let replace = crashed && inner.state == PoolState::Running;
        if replace {
            self.spawn_unit(&mut inner);
        }
        self.live.send_replace(inner.units.len());
        drop(inner);

        if replace {
            info!(worker = %label, "replaced crashed worker");
        }
    }
}

async fn run_unit(mut worker: Worker, config: Arc<Configuration>) -> UnitExit {
    match worker.work().await {
        Ok(()) => UnitExit::Finished,
        Err(err) => {
            error!(worker = %worker.label(), error = %err, "worker crashed");
            config.hooks().run_error_worker(&err);
            UnitExit::Crashed
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
