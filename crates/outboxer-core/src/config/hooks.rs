//! LifecycleHooks - ライフサイクルフックの型付きスロット
//!
//! | hook | 呼ばれるタイミング | 失敗時 |
//! |---|---|---|
//! | before_event | handler 呼び出し直前 | handler の失敗と同じ扱い（リトライ） |
//! | after_event | claim ラウンドの commit 後（成功行） | ワーカーまで伝播 |
//! | error_event | claim ラウンドの commit 後（失敗行） | ワーカーまで伝播 |
//! | error_worker | ワーカーが捕捉されないエラーで止まる直前 | - |
//! | start / stop | Application の起動・停止時 | - |
//!
//! 各 hook は登録順に同期的に呼ばれる。相関 ID などは `Message::metadata` で受け取る。

use std::fmt;
use std::sync::Arc;

use crate::domain::Message;
use crate::error::{HandlerError, OutboxError};

pub type EventHook = Arc<dyn Fn(&Message) -> Result<(), HandlerError> + Send + Sync>;
pub type ErrorEventHook =
    Arc<dyn Fn(&Message, &HandlerError) -> Result<(), HandlerError> + Send + Sync>;
pub type WorkerErrorHook = Arc<dyn Fn(&OutboxError) + Send + Sync>;
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeEvent,
    AfterEvent,
    ErrorEvent,
    ErrorWorker,
    Start,
    Stop,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::BeforeEvent => "before_event",
            HookKind::AfterEvent => "after_event",
            HookKind::ErrorEvent => "error_event",
            HookKind::ErrorWorker => "error_worker",
            HookKind::Start => "start",
            HookKind::Stop => "stop",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default, Clone)]
pub struct LifecycleHooks {
    pub(crate) before_event: Vec<EventHook>,
    pub(crate) after_event: Vec<EventHook>,
    pub(crate) error_event: Vec<ErrorEventHook>,
    pub(crate) error_worker: Vec<WorkerErrorHook>,
    pub(crate) start: Vec<LifecycleHook>,
    pub(crate) stop: Vec<LifecycleHook>,
}

impl LifecycleHooks {
    pub fn count(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::BeforeEvent => self.before_event.len(),
            HookKind::AfterEvent => self.after_event.len(),
            HookKind::ErrorEvent => self.error_event.len(),
            HookKind::ErrorWorker => self.error_worker.len(),
            HookKind::Start => self.start.len(),
            HookKind::Stop => self.stop.len(),
        }
    }

    /// Stops at the first failing hook.
    pub fn run_before_event(&self, message: &Message) -> Result<(), HandlerError> {
        self.before_event.iter().try_for_each(|hook| hook(message))
    }

    pub fn run_after_event(&self, message: &Message) -> Result<(), OutboxError> {
        self.after_event
            .iter()
            .try_for_each(|hook| hook(message))
            .map_err(|source| OutboxError::Hook {
                hook: HookKind::AfterEvent.as_str(),
                source,
            })
    }

    pub fn run_error_event(
        &self,
        message: &Message,
        error: &HandlerError,
    ) -> Result<(), OutboxError> {
        self.error_event
            .iter()
            .try_for_each(|hook| hook(message, error))
            .map_err(|source| OutboxError::Hook {
                hook: HookKind::ErrorEvent.as_str(),
                source,
            })
    }

    pub fn run_error_worker(&self, error: &OutboxError) {
        for hook in &self.error_worker {
            hook(error);
        }
    }

    pub fn run_start(&self) {
        for hook in &self.start {
            hook();
        }
    }

    pub fn run_stop(&self) {
        for hook in &self.stop {
            hook();
        }
    }
}
