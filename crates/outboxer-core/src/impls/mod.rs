//! Implementations - Event Store Adapter の実装
//!
//! - **InMemoryOutboxStore**: 開発・テスト用。行ロックと savepoint を再現する
//! - **PgOutboxStore**: PostgreSQL 実装（feature `postgres`）

pub mod inmem_store;
#[cfg(feature = "postgres")]
pub mod pg_store;

pub use inmem_store::{InMemoryOutboxStore, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use pg_store::{PgClaimTransaction, PgOutboxStore};
