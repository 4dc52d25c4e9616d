//! WorkManagerBuilder - 構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `expect_workers()` で期待される worker 名を登録
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `WorkError::MissingWorkers` を返す
//!
//! `build()` は tokio runtime の中で呼ぶこと（実行と tick ループをそこに spawn する）。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use super::{ManagerInner, WorkManager};
use crate::config::Configuration;
use crate::error::WorkError;
use crate::impls::InMemoryWorkStore;
use crate::ports::{Clock, Scheduler, SystemClock, WorkStore, Worker, WorkerRegistry};
use crate::processor::Processor;
use crate::scheduling::{GreedyScheduler, Schedulers};
use crate::tracker::DeviceState;

/// Builds a [`WorkManager`].
///
/// # 使用例
/// ```ignore
/// let manager = WorkManager::builder(config)
///     .register("upload", worker_fn(upload))?
///     .expect_workers(&["upload"])
///     .build()?;
/// ```
pub struct WorkManagerBuilder {
    config: Configuration,
    registry: WorkerRegistry,
    expected_workers: Option<Vec<String>>,
    store: Option<Arc<dyn WorkStore>>,
    clock: Option<Arc<dyn Clock>>,
    device: DeviceState,
    schedulers: Vec<Arc<dyn Scheduler>>,
}

impl WorkManagerBuilder {
    pub(crate) fn new(config: Configuration) -> Self {
        Self {
            config,
            registry: WorkerRegistry::new(),
            expected_workers: None,
            store: None,
            clock: None,
            device: DeviceState::default(),
            schedulers: Vec::new(),
        }
    }

    /// Worker を登録
    pub fn register(
        mut self,
        name: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self, WorkError> {
        self.registry.register(name, worker)?;
        Ok(self)
    }

    /// 期待される worker 名のリストを設定
    pub fn expect_workers(mut self, names: &[&str]) -> Self {
        self.expected_workers = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Use this store instead of the one described by the configuration.
    pub fn with_store(mut self, store: Arc<dyn WorkStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Device signals at startup.
    pub fn with_device_state(mut self, device: DeviceState) -> Self {
        self.device = device;
        self
    }

    /// An extra scheduler that receives the same work as the in-process one.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    /// 構築して起動時の復旧まで行う
    pub fn build(self) -> Result<WorkManager, WorkError> {
        if let Some(expected) = &self.expected_workers {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(WorkError::MissingWorkers(missing));
            }
        }

        let config = self.config.validated()?;
        let store: Arc<dyn WorkStore> = match (self.store, &config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(InMemoryWorkStore::open(path)?),
            (None, None) => Arc::new(InMemoryWorkStore::new()),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let processor = Processor::new(
            Arc::clone(&store),
            Arc::new(self.registry),
            Arc::clone(&clock),
            config.max_concurrent_executions,
        )?;
        let greedy = GreedyScheduler::new(
            processor.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            self.device,
        );
        let mut schedulers: Vec<Arc<dyn Scheduler>> = vec![greedy.clone()];
        schedulers.extend(self.schedulers);
        let schedulers = Schedulers::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.max_scheduler_limit,
            schedulers,
        );

        tracing::info!(
            max_concurrent_executions = config.max_concurrent_executions,
            max_scheduler_limit = config.max_scheduler_limit,
            schedulers = schedulers.len(),
            "work manager starting"
        );

        let manager = WorkManager {
            inner: Arc::new(ManagerInner {
                config,
                store,
                clock,
                processor,
                greedy,
                schedulers,
                last_cancel_all: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        };
        manager.install_listener();
        manager.reschedule_eligible_work()?;
        manager.spawn_tick_loop();
        Ok(manager)
    }
}
