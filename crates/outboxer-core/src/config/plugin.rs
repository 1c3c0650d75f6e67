//! Plugins - 設定に hook を足す拡張
//!
//! # 初期化順
//! 1. `PluginRegistry` をプロセス起動時に一度だけ作り、plugin を明示的に登録する
//! 2. `ConfigurationBuilder::plugin(&registry, name)` が依存を先に適用する
//! 3. `build()` 後は registry を参照しない
//!
//! グローバルな可変 registry は持たない。

use std::collections::HashMap;
use std::sync::Arc;

use super::builder::ConfigurationBuilder;
use crate::error::ConfigError;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Plugins that must be applied before this one.
    fn load_dependencies(&self) -> &[&'static str] {
        &[]
    }

    fn configure(&self, builder: ConfigurationBuilder) -> ConfigurationBuilder;
}

#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the plugins shipped in this crate (`tracing`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .plugins
            .insert(TracingPlugin.name(), Arc::new(TracingPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), ConfigError> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            return Err(ConfigError::InvalidSetting {
                name: "plugins",
                reason: format!("plugin `{name}` registered twice"),
            });
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.plugins.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Logs every lifecycle hook through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPlugin;

impl Plugin for TracingPlugin {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn configure(&self, builder: ConfigurationBuilder) -> ConfigurationBuilder {
        builder
            .before_event(|msg| {
                tracing::debug!(
                    event_id = %msg.id,
                    event_type = %msg.event_type,
                    attempts = msg.attempts,
                    "outbox event started"
                );
                Ok(())
            })
            .after_event(|msg| {
                tracing::info!(
                    event_id = %msg.id,
                    event_type = %msg.event_type,
                    "outbox event processed"
                );
                Ok(())
            })
            .error_event(|msg, err| {
                tracing::warn!(
                    event_id = %msg.id,
                    event_type = %msg.event_type,
                    attempts = msg.attempts,
                    run_at = ?msg.run_at,
                    error = %err,
                    "outbox event failed"
                );
                Ok(())
            })
            .error_worker(|err| {
                tracing::error!(error = %err, "outbox worker crashed");
            })
            .on_start(|| tracing::info!("outbox started"))
            .on_stop(|| tracing::info!("outbox stopping"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::hooks::HookKind;
    use crate::domain::{EventId, Message};
    use crate::error::HandlerError;
    use chrono::Utc;
    use tracing_test::traced_test;

    #[test]
    fn builtin_registry_has_tracing() {
        let registry = PluginRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["tracing"]);
        assert!(registry.get("tracing").is_some());
        assert!(registry.get("datadog").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::with_builtin();
        assert!(registry.register(Arc::new(TracingPlugin)).is_err());
    }

    #[test]
    #[traced_test]
    fn tracing_plugin_logs_event_outcomes() {
        let config = ConfigurationBuilder::new()
            .plugin(&PluginRegistry::with_builtin(), "tracing")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.hooks().count(HookKind::ErrorEvent), 1);

        let msg = Message {
            id: EventId::new(42),
            event_type: "event_created".into(),
            before: None,
            after: None,
            at: Utc::now(),
            attempts: 1,
            metadata: None,
            run_at: None,
            last_error: None,
        };
        config.hooks().run_after_event(&msg).unwrap();
        let err: HandlerError = "handler exploded".into();
        config.hooks().run_error_event(&msg, &err).unwrap();

        assert!(logs_contain("outbox event processed"));
        assert!(logs_contain("handler exploded"));
        assert!(logs_contain("event_id=42"));
    }
}
