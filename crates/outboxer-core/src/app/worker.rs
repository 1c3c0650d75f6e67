//! Worker - claim ラウンドを回し続けるループ
//!
//! - `finished` は `watch` チャネルで共有し、プール側が `WorkerSignal::finish` で立てる
//! - 何も処理しなかったラウンドの後は `wait_for_events_delay` だけ待つ。
//!   待機中に finish されたら即座に起きる
//! - 処理中のラウンドは中断しない（finish は次のラウンド開始前に効く）

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::Configuration;
use crate::domain::Message;
use crate::error::{HandlerError, OutboxError};
use crate::ports::OutboxStore;

use super::fetcher::{Fetcher, Processor};

/// Routes a message to every handler registered for its type.
///
/// Types without handlers are consumed silently.
pub struct Dispatcher {
    config: Arc<Configuration>,
}

impl Dispatcher {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Processor for Dispatcher {
    async fn process(&self, message: &Message) -> Result<(), HandlerError> {
        let argument = self.config.arguments_for(message)?;
        let handlers = self.config.handlers().get(&message.event_type);
        if handlers.is_empty() {
            trace!(event_type = %message.event_type, "no handler registered");
        }
        for handler in handlers {
            handler.handle(&argument).await?;
        }
        Ok(())
    }
}

/// Pool-side handle that stops one worker.
#[derive(Debug)]
pub struct WorkerSignal(watch::Sender<bool>);

impl WorkerSignal {
    pub fn finish(&self) {
        self.0.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Worker {
    label: String,
    fetcher: Fetcher,
    dispatcher: Dispatcher,
    finished: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        label: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        config: Arc<Configuration>,
    ) -> (Self, WorkerSignal) {
        let (tx, rx) = watch::channel(false);
        let worker = Self {
            label: label.into(),
            fetcher: Fetcher::new(store, Arc::clone(&config)),
            dispatcher: Dispatcher::new(config),
            finished: rx,
        };
        (worker, WorkerSignal(tx))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once finished, or when the signal has been dropped.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow() || self.finished.has_changed().is_err()
    }

    /// One iteration: a claim round, then an idle wait if it found nothing.
    pub async fn do_work(&mut self) -> Result<(), OutboxError> {
        if self.is_finished() {
            return Ok(());
        }

        let processed = self.fetcher.fetch_events(&self.dispatcher).await?;
        if self.is_finished() {
            return Ok(());
        }

        if processed == 0 {
            self.idle().await;
        } else {
            debug!(worker = %self.label, processed, "claim round finished");
        }
        Ok(())
    }

    /// Runs until finished or until a round fails.
    pub async fn work(&mut self) -> Result<(), OutboxError> {
        while !self.is_finished() {
            self.do_work().await?;
        }
        debug!(worker = %self.label, "worker finished");
        Ok(())
    }

    async fn idle(&mut self) {
        let delay = self.fetcher.config().settings().wait_for_events_delay;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.finished.wait_for(|finished| *finished) => {}
        }
    }
}
