//! foreman-core
//!
//! Persistent, constraint-aware background work scheduling.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, data, constraints, backoff, spec, request, info, policy）
//! - **ports**: 抽象化レイヤー（WorkStore, Scheduler, Worker, Clock）
//! - **impls**: 実装（InMemoryWorkStore, DependencyGraph）
//! - **tracker**: デバイス状態に対する制約の評価
//! - **processor**: 実行中の作業集合（1 ID につき高々 1 実行）
//! - **scheduling**: Scheduler 群への配送と GreedyScheduler
//! - **chain**: 依存関係と unique work の解決
//! - **manager**: 公開 API（WorkManager）
//! - **config** / **error**: 設定とエラー型

pub mod chain;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod manager;
pub mod ports;
pub mod processor;
pub mod scheduling;
pub mod tracker;

pub use chain::{EnqueueOutcome, WorkContinuation};
pub use config::{ConfigError, Configuration};
pub use domain::{
    BackoffPolicy, Constraints, Data, ExistingPeriodicWorkPolicy, ExistingWorkPolicy,
    InputMerger, NetworkType, TimeWindow, WorkId, WorkInfo, WorkRequest, WorkSpec, WorkState,
};
pub use error::{StoreError, WorkError};
pub use manager::{WorkManager, WorkManagerBuilder};
pub use ports::{worker_fn, Clock, RuntimeExtras, WorkResult, Worker, WorkerContext};
pub use processor::{ExecutionListener, ListenerId, Processor};
pub use tracker::{DeviceState, NetworkState};
