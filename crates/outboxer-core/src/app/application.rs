//! Application - start / stop hook とプールの束ね

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::Configuration;
use crate::error::OutboxError;
use crate::ports::OutboxStore;

use super::pool::Pool;

/// Runs `on_start` / `on_stop` hooks around the worker pool.
///
/// `start` and `stop` are idempotent.
pub struct Application {
    config: Arc<Configuration>,
    pool: Pool,
    running: AtomicBool,
}

impl Application {
    pub fn new(store: Arc<dyn OutboxStore>, config: Arc<Configuration>) -> Self {
        Self {
            pool: Pool::new(store, Arc::clone(&config)),
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<(), OutboxError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.config.hooks().run_start();
        if let Err(err) = self.pool.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!(table = %self.config.settings().table, "outbox application started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.config.hooks().run_stop();
        self.pool.stop().await;
        info!("outbox application stopped");
    }
}
