//! Worker port - ユーザーコードの実行単位
//!
//! # 構成
//! - [`Worker`]: 1 回の試行を実行し [`WorkResult`] を返す
//! - [`WorkerRegistry`]: worker_name -> Worker の対応表（起動時に構築し、実行時は読み取り専用）
//! - [`WorkerContext`]: 入力・試行回数・キャンセルトークン・進捗報告

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Data, WorkId};
use crate::error::WorkError;

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkResult {
    Success(Data),
    /// Permanent failure. Dependents fail as well.
    Failure(Data),
    /// Transient failure. The work is retried after its backoff.
    Retry,
}

impl WorkResult {
    pub fn success() -> Self {
        WorkResult::Success(Data::empty())
    }

    pub fn failure() -> Self {
        WorkResult::Failure(Data::empty())
    }
}

/// Extra information from whatever triggered the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeExtras {
    pub triggered_content: Vec<String>,
    pub network: Option<String>,
}

type ProgressFn = Arc<dyn Fn(&WorkId, Data) + Send + Sync>;

/// Everything a worker gets for one attempt.
#[derive(Clone)]
pub struct WorkerContext {
    pub id: WorkId,
    pub input: Data,
    pub tags: BTreeSet<String>,
    /// 1 on the first attempt.
    pub run_attempt_count: u32,
    pub extras: RuntimeExtras,
    cancel: CancellationToken,
    progress: ProgressFn,
}

impl WorkerContext {
    pub(crate) fn new(
        id: WorkId,
        input: Data,
        tags: BTreeSet<String>,
        run_attempt_count: u32,
        extras: RuntimeExtras,
        cancel: CancellationToken,
        progress: ProgressFn,
    ) -> Self {
        Self {
            id,
            input,
            tags,
            run_attempt_count,
            extras,
            cancel,
            progress,
        }
    }

    /// A context that is not attached to any processor (for unit-testing workers).
    pub fn detached(id: WorkId, input: Data) -> Self {
        Self::new(
            id,
            input,
            BTreeSet::new(),
            1,
            RuntimeExtras::default(),
            CancellationToken::new(),
            Arc::new(|_: &WorkId, _: Data| {}),
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution has been asked to stop.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Publish progress, visible through `WorkInfo::progress` while running.
    pub fn set_progress(&self, progress: Data) {
        (self.progress)(&self.id, progress)
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.id)
            .field("run_attempt_count", &self.run_attempt_count)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// User code that performs one attempt of a work item.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn do_work(&self, ctx: WorkerContext) -> WorkResult;
}

struct FnWorker<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    async fn do_work(&self, ctx: WorkerContext) -> WorkResult {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a [`Worker`].
pub fn worker_fn<F, Fut>(f: F) -> Arc<dyn Worker>
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(FnWorker { f })
}

/// Registry of workers (worker_name -> worker).
///
/// Built during initialization (mutable), shared read-only at runtime.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Registering the same name twice is an error.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Result<(), WorkError> {
        let name = name.into();
        if self.workers.contains_key(&name) {
            return Err(WorkError::DuplicateWorker(name));
        }
        self.workers.insert(name, worker);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Worker>> {
        self.workers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}
