//! outboxer-core
//!
//! Transactional outbox consumer: claims rows written by application code in
//! the same transaction as its business data, hands them to handlers and
//! retries failures with backoff.
//!
//! # モジュール構成
//! - **domain**: EventRecord / Message / RetryPolicy
//! - **ports**: OutboxStore / ClaimTransaction / Clock
//! - **impls**: InMemoryOutboxStore、PgOutboxStore（feature `postgres`）
//! - **typed**: EventHandler / 型付き Handler / HandlerRegistry
//! - **config**: Settings、ConfigurationBuilder、lifecycle hooks、plugins
//! - **app**: Fetcher（claim エンジン）、Worker、Pool、Application
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{Application, Fetcher, Pool, Processor};
pub use config::{Configuration, ConfigurationBuilder};
pub use domain::{EventId, Message, NewEvent};
pub use error::{HandlerError, OutboxError};
