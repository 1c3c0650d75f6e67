//! Settings - スカラー設定値と設定ファイル
//!
//! `Settings` はビルダーが検証・凍結する値の集合。
//! `FileSettings` は CLI が読む TOML 文書で、ビルダーに上書き適用される。

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryPolicy;
use crate::error::ConfigError;

/// Scheduling backend for pool workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Each worker is a task on the ambient multi-thread runtime.
    #[default]
    Threaded,
    /// All workers are multiplexed on one dedicated driving thread.
    Fiber,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Threaded => f.write_str("threaded"),
            WorkerMode::Fiber => f.write_str("fiber"),
        }
    }
}

impl FromStr for WorkerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threaded" | "thread" => Ok(WorkerMode::Threaded),
            "fiber" => Ok(WorkerMode::Fiber),
            other => Err(ConfigError::InvalidSetting {
                name: "worker",
                reason: format!("expected `threaded` or `fiber`, got `{other}`"),
            }),
        }
    }
}

/// Inbox table used for deduplication.
///
/// `column` names both the outbox column carrying the unique id and the
/// inbox table's key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxSettings {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub table: String,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub wait_for_events_delay: Duration,
    pub shutdown_timeout: Duration,
    pub group_column: Option<String>,
    pub inbox: Option<InboxSettings>,
    pub worker_mode: WorkerMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            table: "outbox".to_string(),
            max_attempts: 10,
            retry: RetryPolicy::default(),
            concurrency: 4,
            wait_for_events_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            group_column: None,
            inbox: None,
            worker_mode: WorkerMode::Threaded,
        }
    }
}

impl Settings {
    /// Checks every value. Called by `ConfigurationBuilder::build`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("table", &self.table)?;
        if let Some(column) = &self.group_column {
            validate_identifier("group_column", column)?;
        }
        if let Some(inbox) = &self.inbox {
            validate_identifier("inbox_table", &inbox.table)?;
            validate_identifier("inbox_column", &inbox.column)?;
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be positive"));
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be positive"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(invalid("shutdown_timeout", "must be positive"));
        }
        if !(self.retry.factor >= 1.0 && self.retry.factor.is_finite()) {
            return Err(invalid("backoff_factor", "must be a finite number >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("backoff_jitter", "must be within [0.0, 1.0]"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("max_backoff", "must not be smaller than the base delay"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        name,
        reason: reason.to_string(),
    }
}

/// Accepts `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = value.split('.').collect();
    let well_formed = parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            name,
            value: value.to_string(),
        })
    }
}

/// `[backoff]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffFile {
    pub base_delay_secs: Option<f64>,
    pub factor: Option<f64>,
    pub max_delay_secs: Option<f64>,
    pub jitter: Option<f64>,
}

/// `[inbox]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboxFile {
    pub table: String,
    pub column: String,
}

/// TOML configuration file.
///
/// ```toml
/// database_url = "postgres://localhost/app"
/// table = "outbox"
/// concurrency = 8
/// wait_for_events_delay_secs = 2.5
/// plugins = ["tracing"]
///
/// [backoff]
/// factor = 3.0
///
/// [handlers]
/// order_created = "log"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSettings {
    pub database_url: Option<String>,
    pub table: Option<String>,
    pub max_attempts: Option<u32>,
    pub concurrency: Option<usize>,
    pub wait_for_events_delay_secs: Option<f64>,
    pub shutdown_timeout_secs: Option<f64>,
    pub group_column: Option<String>,
    pub worker: Option<WorkerMode>,
    pub backoff: Option<BackoffFile>,
    pub inbox: Option<InboxFile>,
    #[serde(default)]
    pub plugins: Vec<String>,
    /// event type -> handler kind
    #[serde(default)]
    pub handlers: BTreeMap<String, String>,
}

impl FileSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Overlays the file's values onto `settings`.
    pub fn apply_to(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(url) = &self.database_url {
            settings.database_url = Some(url.clone());
        }
        if let Some(table) = &self.table {
            settings.table = table.clone();
        }
        if let Some(max_attempts) = self.max_attempts {
            settings.max_attempts = max_attempts;
        }
        if let Some(concurrency) = self.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(secs) = self.wait_for_events_delay_secs {
            settings.wait_for_events_delay = seconds("wait_for_events_delay_secs", secs)?;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            settings.shutdown_timeout = seconds("shutdown_timeout_secs", secs)?;
        }
        if let Some(column) = &self.group_column {
            settings.group_column = Some(column.clone());
        }
        if let Some(worker) = self.worker {
            settings.worker_mode = worker;
        }
        if let Some(inbox) = &self.inbox {
            settings.inbox = Some(InboxSettings {
                table: inbox.table.clone(),
                column: inbox.column.clone(),
            });
        }
        if let Some(backoff) = &self.backoff {
            if let Some(secs) = backoff.base_delay_secs {
                settings.retry.base_delay = seconds("backoff.base_delay_secs", secs)?;
            }
            if let Some(factor) = backoff.factor {
                settings.retry.factor = factor;
            }
            if let Some(secs) = backoff.max_delay_secs {
                settings.retry.max_delay = seconds("backoff.max_delay_secs", secs)?;
            }
            if let Some(jitter) = backoff.jitter {
                settings.retry.jitter = jitter;
            }
        }
        Ok(())
    }
}

fn seconds(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidSetting {
        name,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.table, "outbox");
        assert_eq!(settings.max_attempts, 10);
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.wait_for_events_delay, Duration::from_secs(5));
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(settings.worker_mode, WorkerMode::Threaded);
        assert!(settings.validate().is_ok());
    }

    #[rstest]
    #[case("outbox", true)]
    #[case("public.outbox", true)]
    #[case("_events2", true)]
    #[case("2events", false)]
    #[case("outbox; DROP TABLE users", false)]
    #[case("a.b.c", false)]
    #[case("", false)]
    fn identifiers(#[case] value: &str, #[case] ok: bool) {
        assert_eq!(validate_identifier("table", value).is_ok(), ok);
    }

    #[rstest]
    #[case::zero_concurrency(|s: &mut Settings| s.concurrency = 0, "concurrency")]
    #[case::zero_attempts(|s: &mut Settings| s.max_attempts = 0, "max_attempts")]
    #[case::no_timeout(|s: &mut Settings| s.shutdown_timeout = Duration::ZERO, "shutdown_timeout")]
    #[case::shrinking_factor(|s: &mut Settings| s.retry.factor = 0.5, "backoff_factor")]
    #[case::jitter_range(|s: &mut Settings| s.retry.jitter = 1.5, "backoff_jitter")]
    fn invalid_settings(#[case] mutate: fn(&mut Settings), #[case] expected: &str) {
        let mut settings = Settings::default();
        mutate(&mut settings);
        match settings.validate() {
            Err(ConfigError::InvalidSetting { name, .. }) => assert_eq!(name, expected),
            other => panic!("expected invalid {expected}, got {other:?}"),
        }
    }

    #[test]
    fn worker_mode_parses() {
        assert_eq!("fiber".parse::<WorkerMode>().unwrap(), WorkerMode::Fiber);
        assert_eq!(
            "thread".parse::<WorkerMode>().unwrap(),
            WorkerMode::Threaded
        );
        assert!("ractor".parse::<WorkerMode>().is_err());
    }

    #[test]
    fn file_settings_overlay() {
        let file = FileSettings::from_toml_str(
            r#"
            table = "events"
            concurrency = 2
            wait_for_events_delay_secs = 0.5
            worker = "fiber"
            plugins = ["tracing"]

            [backoff]
            factor = 3.0

            [inbox]
            table = "inbox"
            column = "unique_id"

            [handlers]
            order_created = "log"
            "#,
        )
        .unwrap();

        let mut settings = Settings::default();
        file.apply_to(&mut settings).unwrap();

        assert_eq!(settings.table, "events");
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.wait_for_events_delay, Duration::from_millis(500));
        assert_eq!(settings.worker_mode, WorkerMode::Fiber);
        assert_eq!(settings.retry.factor, 3.0);
        assert_eq!(
            settings.inbox,
            Some(InboxSettings {
                table: "inbox".into(),
                column: "unique_id".into()
            })
        );
        assert_eq!(file.plugins, vec!["tracing".to_string()]);
        assert_eq!(
            file.handlers.get("order_created").map(String::as_str),
            Some("log")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = FileSettings::from_toml_str("concurency = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let file = FileSettings::from_toml_str("shutdown_timeout_secs = -1.0").unwrap();
        let mut settings = Settings::default();
        assert!(file.apply_to(&mut settings).is_err());
    }
}
