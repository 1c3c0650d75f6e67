//! Error types - エラー型と分類
//!
//! # 分類
//! - `HandlerError`: handler / hook が返す任意のエラー（行単位で捕捉され、リトライ対象）
//! - `StoreError`: Event Store Adapter の障害（ワーカーを落とす）
//! - `ConfigError`: 設定構築時のエラー（起動時に fail-fast）
//! - `OutboxError`: ワーカー / プール境界まで伝播するエラー

use std::fmt::Write as _;

use thiserror::Error;

/// Error returned by event handlers and lifecycle hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("transaction is no longer usable: {0}")]
    Closed(String),

    #[error("event {0} not found")]
    NotFound(i64),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("invalid SQL identifier for `{name}`: {value:?}")]
    InvalidIdentifier { name: &'static str, value: String },

    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),

    #[error("unknown handler kind `{kind}` for event type `{event_type}`")]
    UnknownHandlerKind { event_type: String, kind: String },

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{hook} hook failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: String, message: String },

    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,

    #[error("failed to start worker runtime: {0}")]
    Runtime(String),

    #[error("pool is already running")]
    AlreadyRunning,
}

/// Renders an error and its `source()` chain for the `last_error` column.
///
/// The first line is always the error's own message.
pub fn error_report(err: &(dyn std::error::Error + 'static)) -> String {
    let mut report = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(report, "\ncaused by: {cause}");
        source = cause.source();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn report_starts_with_message_and_lists_causes() {
        let err = Outer {
            inner: std::io::Error::other("disk on fire"),
        };
        let report = error_report(&err);
        assert!(report.starts_with("outer failure"));
        assert!(report.contains("caused by: disk on fire"));
    }

    #[test]
    fn hook_error_keeps_source() {
        let err = OutboxError::Hook {
            hook: "after_event",
            source: "boom".into(),
        };
        assert_eq!(err.to_string(), "after_event hook failed: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
