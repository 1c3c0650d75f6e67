//! Domain model (event rows, messages, retry policy).
//!
//! - **event**: outbox テーブルの 1 行（`EventRecord`）と挿入用の `NewEvent`
//! - **message**: claim 済みの行から作られるメモリ上のメッセージ
//! - **retry**: バックオフ計算

pub mod event;
pub mod message;
pub mod retry;

pub use event::{EventId, EventRecord, NewEvent, OutboxCounts};
pub use message::Message;
pub use retry::RetryPolicy;
