//! Ports - 抽象化レイヤー
//!
//! claim エンジンが外部（データベース、時刻）に触れる箇所を trait として定義します。
//! - **outbox_store**: Event Store Adapter（トランザクション、savepoint、skip-locked）
//! - **clock**: 時刻

pub mod clock;
pub mod outbox_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::outbox_store::{
    Candidate, ClaimTransaction, GroupMember, OutboxStore, Reschedule, Selection,
};
