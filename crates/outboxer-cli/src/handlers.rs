//! Handlers selectable from the `[handlers]` table of the configuration file.

use std::collections::BTreeMap;

use async_trait::async_trait;
use outboxer_core::config::ConfigurationBuilder;
use outboxer_core::error::{ConfigError, HandlerError};
use outboxer_core::typed::EventHandler;
use serde_json::Value;
use tracing::info;

/// Logs every message it receives.
pub struct LogHandler {
    event_type: String,
}

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, argument: &Value) -> Result<(), HandlerError> {
        info!(event_type = %self.event_type, %argument, "outbox event");
        Ok(())
    }
}

/// Acknowledges messages without doing anything.
pub struct DiscardHandler;

#[async_trait]
impl EventHandler for DiscardHandler {
    async fn handle(&self, _argument: &Value) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Registers one handler per `event_type = "kind"` entry.
pub fn register(
    mut builder: ConfigurationBuilder,
    handlers: &BTreeMap<String, String>,
) -> Result<ConfigurationBuilder, ConfigError> {
    for (event_type, kind) in handlers {
        builder = match kind.as_str() {
            "log" => builder.on(
                event_type,
                LogHandler {
                    event_type: event_type.clone(),
                },
            ),
            "discard" => builder.on(event_type, DiscardHandler),
            _ => {
                return Err(ConfigError::UnknownHandlerKind {
                    event_type: event_type.clone(),
                    kind: kind.clone(),
                });
            }
        };
    }
    Ok(builder)
}
