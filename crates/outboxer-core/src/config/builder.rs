//! ConfigurationBuilder - 設定の構築と凍結
//!
//! # 設計原則
//! - 認識するオプションごとに型付きメソッドを 1 つ用意し、チェーンで組み立てる
//! - `build()` で検証してから凍結（`Configuration` は読み取り専用）
//! - 凍結後の変更はビルダーが消費されるため型レベルで不可能
//!
//! # 使用例
//! ```ignore
//! let config = ConfigurationBuilder::new()
//!     .table("outbox")
//!     .concurrency(8)
//!     .on("order_created", handler_fn(|arg| { ...; Ok(()) }))
//!     .error_worker(|err| eprintln!("worker died: {err}"))
//!     .plugin(&plugins, "tracing")?
//!     .build()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::hooks::LifecycleHooks;
use super::plugin::PluginRegistry;
use super::settings::{FileSettings, InboxSettings, Settings, WorkerMode};
use crate::domain::{Message, RetryPolicy};
use crate::error::{ConfigError, HandlerError, OutboxError};
use crate::typed::{Event, EventHandler, Handler, HandlerRegistry};

/// Maps a message to the argument handlers receive.
pub type ArgumentTransform = Arc<dyn Fn(&Message) -> Value + Send + Sync>;

/// Frozen runtime configuration, shared by every worker.
pub struct Configuration {
    settings: Settings,
    handlers: HandlerRegistry,
    hooks: LifecycleHooks,
    message_to_arguments: Option<ArgumentTransform>,
    plugins: Vec<&'static str>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    /// Names of the plugins applied, in load order.
    pub fn plugins(&self) -> &[&'static str] {
        &self.plugins
    }

    /// Handler argument for `message`: the transform's result if one is
    /// configured, the serialised message otherwise.
    pub fn arguments_for(&self, message: &Message) -> Result<Value, HandlerError> {
        match &self.message_to_arguments {
            Some(transform) => Ok(transform(message)),
            None => Ok(serde_json::to_value(message)?),
        }
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("settings", &self.settings)
            .field("event_types", &self.handlers.registered_types())
            .field("plugins", &self.plugins)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConfigurationBuilder {
    settings: Settings,
    handlers: HandlerRegistry,
    hooks: LifecycleHooks,
    message_to_arguments: Option<ArgumentTransform>,
    plugins: Vec<&'static str>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── scalar settings ─────────────────────────────────────────────────────

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.settings.database_url = Some(url.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.settings.table = table.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.settings.max_attempts = max_attempts;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.settings.retry = policy;
        self
    }

    pub fn backoff_base(mut self, base_delay: Duration) -> Self {
        self.settings.retry.base_delay = base_delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.settings.retry.factor = factor;
        self
    }

    pub fn max_backoff(mut self, max_delay: Duration) -> Self {
        self.settings.retry.max_delay = max_delay;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.settings.concurrency = concurrency;
        self
    }

    pub fn wait_for_events_delay(mut self, delay: Duration) -> Self {
        self.settings.wait_for_events_delay = delay;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = timeout;
        self
    }

    pub fn group_column(mut self, column: impl Into<String>) -> Self {
        self.settings.group_column = Some(column.into());
        self
    }

    pub fn inbox(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.settings.inbox = Some(InboxSettings {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.settings.worker_mode = mode;
        self
    }

    // ── handlers ────────────────────────────────────────────────────────────

    /// Adds a handler for `event_type`. Several handlers per type run in
    /// registration order.
    pub fn on(
        mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.handlers.register(event_type, Arc::new(handler));
        self
    }

    pub fn on_shared(
        mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        self.handlers.register(event_type, handler);
        self
    }

    pub fn on_typed<T: Event, H: Handler<T> + 'static>(mut self, handler: H) -> Self {
        self.handlers.register_typed::<T, H>(handler);
        self
    }

    pub fn message_to_arguments<F>(mut self, transform: F) -> Self
    where
        F: Fn(&Message) -> Value + Send + Sync + 'static,
    {
        self.message_to_arguments = Some(Arc::new(transform));
        self
    }

    // ── lifecycle hooks ─────────────────────────────────────────────────────

    pub fn before_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.before_event.push(Arc::new(hook));
        self
    }

    pub fn after_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.after_event.push(Arc::new(hook));
        self
    }

    pub fn error_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Message, &HandlerError) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.hooks.error_event.push(Arc::new(hook));
        self
    }

    pub fn error_worker<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OutboxError) + Send + Sync + 'static,
    {
        self.hooks.error_worker.push(Arc::new(hook));
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.start.push(Arc::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.stop.push(Arc::new(hook));
        self
    }

    // ── plugins and files ───────────────────────────────────────────────────

    /// Applies a plugin by name, loading its dependencies first.
    /// A plugin already applied is skipped.
    pub fn plugin(mut self, registry: &PluginRegistry, name: &str) -> Result<Self, ConfigError> {
        if self.plugins.iter().any(|loaded| *loaded == name) {
            return Ok(self);
        }
        let plugin = registry
            .get(name)
            .ok_or_else(|| ConfigError::UnknownPlugin(name.to_string()))?;

        // recorded before dependencies so cycles terminate
        self.plugins.push(plugin.name());
        for dependency in plugin.load_dependencies() {
            self = self.plugin(registry, dependency)?;
        }
        Ok(plugin.configure(self))
    }

    /// Overlays a configuration file's settings and plugins.
    ///
    /// `[handlers]` entries are left to the caller, which owns handler kinds.
    pub fn apply_file(
        mut self,
        file: &FileSettings,
        registry: &PluginRegistry,
    ) -> Result<Self, ConfigError> {
        file.apply_to(&mut self.settings)?;
        for name in &file.plugins {
            self = self.plugin(registry, name)?;
        }
        Ok(self)
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<Configuration, ConfigError> {
        self.settings.validate()?;
        Ok(Configuration {
            settings: self.settings,
            handlers: self.handlers,
            hooks: self.hooks,
            message_to_arguments: self.message_to_arguments,
            plugins: self.plugins,
        })
    }
}
