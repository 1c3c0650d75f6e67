//! App - claim エンジンとワーカー実行
//!
//! # 主要コンポーネント
//! - **Fetcher**: 1 ラウンド分の claim と処理（fetch_events / take_events）
//! - **Worker**: Fetcher を回し続けるループと handler への振り分け（Dispatcher）
//! - **Pool**: ワーカー集合の起動・停止・自己修復
//! - **Application**: start / stop hook とプールの束ね

pub mod application;
mod backend;
pub mod fetcher;
pub mod pool;
pub mod worker;

pub use self::application::Application;
pub use self::fetcher::{Fetcher, FnProcessor, Processor, from_fn};
pub use self::pool::{Pool, PoolState};
pub use self::worker::{Dispatcher, Worker, WorkerSignal};
