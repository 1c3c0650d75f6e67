//! Worker backends
//!
//! | mode | 実行場所 |
//! |---|---|
//! | `Threaded` | 呼び出し元の tokio ランタイム（multi-thread なら各ワーカーが OS スレッド上で並行に動く） |
//! | `Fiber` | 専用 OS スレッド 1 本の current_thread ランタイム（全ワーカーが協調的に交互実行） |
//!
//! Fiber ドライバはプールと同じ寿命を持ち、プールを drop すると停止する。
//! DB 接続は開いたランタイムの reactor に紐付くため、プールの再起動でもドライバを作り直さない。

use std::thread;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::WorkerMode;
use crate::error::OutboxError;

pub(crate) enum Backend {
    Threaded(Handle),
    Fiber(FiberDriver),
}

impl Backend {
    pub(crate) fn start(mode: WorkerMode) -> Result<Self, OutboxError> {
        match mode {
            WorkerMode::Threaded => Handle::try_current()
                .map(Backend::Threaded)
                .map_err(|_| OutboxError::NoRuntime),
            WorkerMode::Fiber => FiberDriver::start().map(Backend::Fiber),
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        match self {
            Backend::Threaded(handle) => handle,
            Backend::Fiber(driver) => &driver.handle,
        }
    }
}

/// Single OS thread driving a current-thread runtime.
pub(crate) struct FiberDriver {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FiberDriver {
    fn start() -> Result<Self, OutboxError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| OutboxError::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        thread::Builder::new()
            .name("outboxer-fibers".into())
            .spawn(move || {
                // resolves on send or when the driver is dropped
                runtime.block_on(async {
                    let _ = stopped.await;
                });
                debug!("fiber driver stopped");
            })
            .map_err(|e| OutboxError::Runtime(e.to_string()))?;

        Ok(Self {
            handle,
            shutdown: Some(shutdown),
        })
    }
}

impl Drop for FiberDriver {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn threaded_uses_ambient_runtime() {
        let backend = Backend::start(WorkerMode::Threaded).unwrap();
        let value = backend.handle().spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn threaded_requires_a_runtime() {
        assert!(matches!(
            Backend::start(WorkerMode::Threaded),
            Err(OutboxError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn fiber_runs_tasks_on_its_own_thread() {
        let backend = Backend::start(WorkerMode::Fiber).unwrap();
        let name = backend
            .handle()
            .spawn(async { thread::current().name().map(str::to_owned) })
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("outboxer-fibers"));
    }
}
