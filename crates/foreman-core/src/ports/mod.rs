//! Ports - 抽象化レイヤー
//!
//! 外部の協力者（永続化ストア・スケジューラ・ユーザーの Worker・時計）への
//! インターフェースを trait として定義し、実装の詳細を隠蔽します。

pub mod clock;
pub mod scheduler;
pub mod store;
pub mod worker;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::scheduler::Scheduler;
pub use self::store::{StoreTransaction, WorkStore};
pub use self::worker::{
    worker_fn, RuntimeExtras, WorkResult, Worker, WorkerContext, WorkerRegistry,
};
