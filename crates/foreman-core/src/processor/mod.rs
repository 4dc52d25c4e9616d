//! Processor - 実行中の作業集合の管理
//!
//! # 責務
//! - 1 つの WorkId につき同時に高々 1 つの実行（running set で直列化）
//! - 実行は tokio task として起動し、Semaphore で同時実行数を制限
//! - 実行完了時: store の確定 → running set から削除 → listener 通知 の順
//!
//! # lock
//! - running set / progress / listener 一覧は 1 つの `std::sync::Mutex` で保護
//! - listener の呼び出しは lock を解放してから行う
//! - listener の panic は記録して握りつぶす（他の listener と settle は続行）

mod execution;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::domain::{Data, WorkId, WorkState};
use crate::error::WorkError;
use crate::ports::{Clock, RuntimeExtras, WorkStore, WorkerRegistry};

/// Handle returned by `add_execution_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// `(id, needs_reschedule)`, called once per execution after its state is committed.
pub type ExecutionListener = Arc<dyn Fn(&WorkId, bool) + Send + Sync>;

struct ExecutionHandle {
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct ProcessorState {
    running: HashMap<WorkId, ExecutionHandle>,
    progress: HashMap<WorkId, Data>,
    listeners: Vec<(ListenerId, ExecutionListener)>,
    next_listener: u64,
    /// Executions removed from `running` whose listeners are still being called.
    settling: usize,
}

impl ProcessorState {
    fn busy(&self) -> usize {
        self.running.len() + self.settling
    }
}

pub(crate) struct ProcessorInner {
    store: Arc<dyn WorkStore>,
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    state: Mutex<ProcessorState>,
    /// Running plus settling executions.
    busy: watch::Sender<usize>,
}

impl ProcessorInner {
    fn lock(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_progress(&self, id: &WorkId, progress: Data) {
        let mut state = self.lock();
        if state.running.contains_key(id) {
            state.progress.insert(*id, progress);
        }
    }
}

/// Runs work items, at most one execution per id.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    /// Must be called from inside a tokio runtime; executions are spawned on it.
    pub fn new(
        store: Arc<dyn WorkStore>,
        registry: Arc<WorkerRegistry>,
        clock: Arc<dyn Clock>,
        max_concurrent_executions: usize,
    ) -> Result<Self, WorkError> {
        let runtime = Handle::try_current().map_err(|_| WorkError::NoRuntime)?;
        let (busy, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(ProcessorInner {
                store,
                registry,
                clock,
                runtime,
                permits: Arc::new(Semaphore::new(max_concurrent_executions.max(1))),
                state: Mutex::new(ProcessorState::default()),
                busy,
            }),
        })
    }

    /// Start executing `id`.
    ///
    /// Returns `false` without side effects if the row is absent, not ENQUEUED,
    /// or already executing in this processor.
    pub fn start_work(&self, id: &WorkId, extras: RuntimeExtras) -> bool {
        let spec = match self.inner.store.begin() {
            Ok(tx) => tx.get(id),
            Err(e) => {
                tracing::error!(work_id = %id, error = %e, "could not read work before start");
                return false;
            }
        };
        match spec {
            None => {
                tracing::debug!(work_id = %id, "not starting: work does not exist");
                return false;
            }
            Some(spec) if spec.state != WorkState::Enqueued => {
                tracing::debug!(work_id = %id, state = %spec.state, "not starting: work is not ENQUEUED");
                return false;
            }
            Some(_) => {}
        }

        let token = CancellationToken::new();
        {
            let mut state = self.inner.lock();
            if state.running.contains_key(id) {
                tracing::debug!(work_id = %id, "work is already enqueued in the processor");
                return false;
            }
            state.running.insert(
                *id,
                ExecutionHandle {
                    token: token.clone(),
                    started_at: self.inner.clock.now(),
                },
            );
            self.inner.busy.send_replace(state.busy());
        }

        tracing::debug!(work_id = %id, "processor starting work");
        let this = self.clone();
        let id = *id;
        self.inner.runtime.spawn(async move {
            let permit = this.inner.permits.clone().acquire_owned().await.ok();
            let needs_reschedule =
                execution::execute(Arc::clone(&this.inner), this.progress_sink(), id, extras, token)
                    .await;
            drop(permit);
            this.on_executed(id, needs_reschedule);
        });
        true
    }

    /// Ask a running execution to stop. The id stays in the running set until it settles.
    pub fn stop_work(&self, id: &WorkId) -> bool {
        let state = self.inner.lock();
        match state.running.get(id) {
            Some(handle) => {
                tracing::debug!(work_id = %id, "processor stopping work");
                handle.token.cancel();
                true
            }
            None => {
                tracing::debug!(work_id = %id, "stop requested for work that is not running");
                false
            }
        }
    }

    /// Stop every running execution.
    pub fn stop_all(&self) {
        let state = self.inner.lock();
        for handle in state.running.values() {
            handle.token.cancel();
        }
    }

    pub fn is_enqueued(&self, id: &WorkId) -> bool {
        self.inner.lock().running.contains_key(id)
    }

    pub fn has_work(&self) -> bool {
        !self.inner.lock().running.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running.len()
    }

    /// When the current execution of `id` started.
    pub fn started_at(&self, id: &WorkId) -> Option<DateTime<Utc>> {
        self.inner.lock().running.get(id).map(|h| h.started_at)
    }

    /// Last progress reported by the running execution of `id`.
    pub fn progress(&self, id: &WorkId) -> Option<Data> {
        self.inner.lock().progress.get(id).cloned()
    }

    pub fn add_execution_listener(&self, listener: ExecutionListener) -> ListenerId {
        let mut state = self.inner.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, listener));
        id
    }

    pub fn remove_execution_listener(&self, id: ListenerId) -> bool {
        let mut state = self.inner.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    /// Resolves once no execution is running or settling.
    ///
    /// Work that is merely waiting for a delay or backoff does not count.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.busy.subscribe();
        // sender は self が保持しているので閉じない
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn progress_sink(&self) -> Arc<dyn Fn(&WorkId, Data) + Send + Sync> {
        let weak: Weak<ProcessorInner> = Arc::downgrade(&self.inner);
        Arc::new(move |id: &WorkId, progress: Data| {
            if let Some(inner) = weak.upgrade() {
                inner.set_progress(id, progress);
            }
        })
    }

    fn on_executed(&self, id: WorkId, needs_reschedule: bool) {
        let listeners: Vec<ExecutionListener> = {
            let mut state = self.inner.lock();
            state.running.remove(&id);
            state.progress.remove(&id);
            state.settling += 1;
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        tracing::debug!(work_id = %id, needs_reschedule, "execution settled");
        for listener in listeners {
            let called = panic::catch_unwind(AssertUnwindSafe(|| listener(&id, needs_reschedule)));
            if called.is_err() {
                tracing::error!(work_id = %id, "execution listener panicked");
            }
        }
        let mut state = self.inner.lock();
        state.settling -= 1;
        self.inner.busy.send_replace(state.busy());
    }
}
