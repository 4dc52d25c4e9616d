//! WorkManager - 公開 API のファサード
//!
//! グローバルな singleton は持たず、`WorkManager::builder(config)` で明示的に構築します。
//! `WorkManager` は `Arc` の薄いラッパーなので clone して共有できます。
//!
//! # 責務
//! - enqueue: 1 トランザクションで行を書き、その後 Scheduler 群へ渡す
//! - cancel: 1 トランザクションで状態を変え、その後 Processor 停止と Scheduler への通知
//! - 実行完了ごとの再スケジュール（listener）
//! - 起動時の復旧（RUNNING のまま残った行を ENQUEUED に戻す）
//! - tick ループ（遅延・backoff・周期・時間窓の再評価）

mod builder;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::chain::{self, ContinuationNode, EnqueueOutcome, UniqueName, WorkContinuation};
use crate::config::Configuration;
use crate::domain::{
    ExistingPeriodicWorkPolicy, ExistingWorkPolicy, WorkId, WorkInfo, WorkRequest, WorkSpec,
    WorkState,
};
use crate::error::{StoreError, WorkError};
use crate::ports::{Clock, RuntimeExtras, StoreTransaction, WorkStore};
use crate::processor::{ExecutionListener, ListenerId, Processor};
use crate::scheduling::{GreedyScheduler, Schedulers};
use crate::tracker::DeviceState;

pub use self::builder::WorkManagerBuilder;

pub(crate) struct ManagerInner {
    config: Configuration,
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    processor: Processor,
    greedy: Arc<GreedyScheduler>,
    schedulers: Schedulers,
    last_cancel_all: Mutex<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
}

impl ManagerInner {
    fn on_executed(&self, id: &WorkId) {
        let finished = match self.store.begin() {
            Ok(tx) => tx.get(id).is_none_or(|s| s.state.is_finished()),
            Err(e) => {
                tracing::error!(work_id = %id, error = %e, "could not read executed work");
                return;
            }
        };
        if finished {
            self.schedulers.cancel(id);
        }
        // dependents that were unblocked, retries and periodic resets
        self.schedule_eligible();
    }

    fn schedule_eligible(&self) {
        if let Err(e) = self.schedulers.schedule_eligible() {
            tracing::error!(error = %e, "failed to hand eligible work to schedulers");
        }
    }

    fn tick(&self) {
        self.greedy.tick();
        self.schedule_eligible();
    }
}

/// Entry point of the library.
#[derive(Clone)]
pub struct WorkManager {
    inner: Arc<ManagerInner>,
}

impl WorkManager {
    pub fn builder(config: Configuration) -> WorkManagerBuilder {
        WorkManagerBuilder::new(config)
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn processor(&self) -> &Processor {
        &self.inner.processor
    }

    pub fn greedy_scheduler(&self) -> &Arc<GreedyScheduler> {
        &self.inner.greedy
    }

    fn install_listener(&self) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        self.inner
            .processor
            .add_execution_listener(Arc::new(move |id: &WorkId, _needs_reschedule: bool| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_executed(id);
                }
            }));
    }

    fn spawn_tick_loop(&self) {
        let Some(period) = self.inner.config.tick_interval else {
            tracing::debug!("tick loop disabled");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(tick_loop(weak, shutdown, period));
    }

    // ---- enqueue ----

    /// Enqueue one request.
    pub fn enqueue(&self, request: WorkRequest) -> Result<WorkId, WorkError> {
        let id = request.id();
        self.begin_with(vec![request]).enqueue()?;
        Ok(id)
    }

    /// Enqueue independent requests in one transaction.
    pub fn enqueue_all(&self, requests: Vec<WorkRequest>) -> Result<Vec<WorkId>, WorkError> {
        let ids = requests.iter().map(WorkRequest::id).collect();
        self.begin_with(requests).enqueue()?;
        Ok(ids)
    }

    /// Enqueue `request` to run after rows that are already in the store.
    pub fn enqueue_after(
        &self,
        request: WorkRequest,
        prerequisites: &[WorkId],
    ) -> Result<WorkId, WorkError> {
        let id = request.id();
        self.enqueue_continuation(&ContinuationNode::after(
            vec![request],
            prerequisites.to_vec(),
        ))?;
        Ok(id)
    }

    pub fn enqueue_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        requests: Vec<WorkRequest>,
    ) -> Result<EnqueueOutcome, WorkError> {
        self.begin_unique_work(name, policy, requests).enqueue()
    }

    pub fn enqueue_unique_periodic_work(
        &self,
        name: &str,
        policy: ExistingPeriodicWorkPolicy,
        request: WorkRequest,
    ) -> Result<EnqueueOutcome, WorkError> {
        if !request.is_periodic() {
            return Err(WorkError::InvalidRequest(format!(
                "work {} is not periodic",
                request.id()
            )));
        }
        self.begin_unique_work(name, policy.into(), vec![request])
            .enqueue()
    }

    pub fn begin_with(&self, requests: Vec<WorkRequest>) -> WorkContinuation {
        WorkContinuation::new(self.clone(), ContinuationNode::root(requests, None))
    }

    pub fn begin_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        requests: Vec<WorkRequest>,
    ) -> WorkContinuation {
        let unique = UniqueName {
            name: name.to_string(),
            policy,
        };
        WorkContinuation::new(self.clone(), ContinuationNode::root(requests, Some(unique)))
    }

    pub(crate) fn enqueue_continuation(
        &self,
        node: &Arc<ContinuationNode>,
    ) -> Result<EnqueueOutcome, WorkError> {
        let now = self.inner.clock.now();
        let outcome = {
            let mut tx = self.inner.store.begin()?;
            let outcome = chain::enqueue_continuation(&mut *tx, node, now)?;
            tx.commit()?;
            outcome
        };
        tracing::info!(
            inserted = outcome.inserted.len(),
            replaced = outcome.replaced.len(),
            kept = outcome.kept,
            "work enqueued"
        );
        self.stop_and_unschedule(&outcome.replaced);
        self.inner.schedule_eligible();
        Ok(outcome)
    }

    // ---- cancel ----

    /// Cancel `id` and everything that depends on it.
    pub fn cancel_work_by_id(&self, id: &WorkId) -> Result<Vec<WorkId>, WorkError> {
        self.cancel_with(|tx| {
            if tx.get(id).is_none() {
                return Err(WorkError::NotFound(*id));
            }
            Ok(chain::resolve::cancel_with_dependents(tx, *id)?)
        })
    }

    pub fn cancel_all_work_by_tag(&self, tag: &str) -> Result<Vec<WorkId>, WorkError> {
        self.cancel_with(|tx| chain::cancel_by_tag(tx, tag))
    }

    pub fn cancel_unique_work(&self, name: &str) -> Result<Vec<WorkId>, WorkError> {
        self.cancel_with(|tx| chain::cancel_by_name(tx, name))
    }

    /// Cancel every unfinished row and remember when that happened.
    pub fn cancel_all_work(&self) -> Result<Vec<WorkId>, WorkError> {
        let cancelled = self.cancel_with(chain::cancel_all)?;
        *self.last_cancel_all() = Some(self.inner.clock.now());
        Ok(cancelled)
    }

    pub fn last_cancel_all_time(&self) -> Option<DateTime<Utc>> {
        *self.last_cancel_all()
    }

    fn last_cancel_all(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.inner
            .last_cancel_all
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_with(
        &self,
        cancel: impl for<'t, 's> FnOnce(
            &'t mut (dyn StoreTransaction + 's),
        ) -> Result<Vec<WorkId>, WorkError>,
    ) -> Result<Vec<WorkId>, WorkError> {
        let cancelled = {
            let mut tx = self.inner.store.begin()?;
            let cancelled = cancel(&mut *tx)?;
            tx.commit()?;
            cancelled
        };
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "work cancelled");
        }
        self.stop_and_unschedule(&cancelled);
        Ok(cancelled)
    }

    fn stop_and_unschedule(&self, ids: &[WorkId]) {
        for id in ids {
            self.inner.processor.stop_work(id);
            self.inner.schedulers.cancel(id);
        }
    }

    /// Delete finished rows that nothing unfinished depends on.
    pub fn prune_work(&self) -> Result<Vec<WorkId>, WorkError> {
        let mut tx = self.inner.store.begin()?;
        let pruned = chain::prune(&mut *tx);
        tx.commit()?;
        Ok(pruned)
    }

    // ---- processor ----

    /// Start `id` right away, bypassing the schedulers.
    pub fn start_work(&self, id: &WorkId) -> bool {
        self.start_work_with(id, RuntimeExtras::default())
    }

    pub fn start_work_with(&self, id: &WorkId, extras: RuntimeExtras) -> bool {
        self.inner.processor.start_work(id, extras)
    }

    pub fn stop_work(&self, id: &WorkId) -> bool {
        self.inner.processor.stop_work(id)
    }

    pub fn is_enqueued(&self, id: &WorkId) -> bool {
        self.inner.processor.is_enqueued(id)
    }

    pub fn has_work(&self) -> bool {
        self.inner.processor.has_work()
    }

    pub fn add_execution_listener(&self, listener: ExecutionListener) -> ListenerId {
        self.inner.processor.add_execution_listener(listener)
    }

    pub fn remove_execution_listener(&self, id: ListenerId) -> bool {
        self.inner.processor.remove_execution_listener(id)
    }

    // ---- queries ----

    pub fn get_work_info_by_id(&self, id: &WorkId) -> Result<Option<WorkInfo>, WorkError> {
        let spec = self.inner.store.begin()?.get(id);
        Ok(spec.map(|s| self.info(&s)))
    }

    pub fn get_work_infos_by_tag(&self, tag: &str) -> Result<Vec<WorkInfo>, WorkError> {
        let specs = {
            let tx = self.inner.store.begin()?;
            let ids = tx.ids_for_tag(tag);
            ids.iter().filter_map(|id| tx.get(id)).collect::<Vec<_>>()
        };
        Ok(specs.iter().map(|s| self.info(s)).collect())
    }

    pub fn get_work_infos_for_unique_work(&self, name: &str) -> Result<Vec<WorkInfo>, WorkError> {
        let specs = {
            let tx = self.inner.store.begin()?;
            let ids = tx.ids_for_name(name);
            ids.iter().filter_map(|id| tx.get(id)).collect::<Vec<_>>()
        };
        Ok(specs.iter().map(|s| self.info(s)).collect())
    }

    fn info(&self, spec: &WorkSpec) -> WorkInfo {
        WorkInfo::from_spec(spec, self.inner.processor.progress(&spec.id))
    }

    // ---- device / time ----

    pub fn device_state(&self) -> DeviceState {
        self.inner.greedy.tracker().device_state()
    }

    /// Change device signals. Constrained work starts or stops accordingly.
    pub fn update_device_state(&self, update: impl FnOnce(&mut DeviceState)) {
        self.inner.greedy.update_device_state(update);
    }

    /// Re-evaluate delays, backoff, periods and time windows now.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Put rows left RUNNING by a previous process back to ENQUEUED, clear every
    /// schedule flag and hand eligible work to the schedulers again.
    pub fn reschedule_eligible_work(&self) -> Result<usize, WorkError> {
        let now = self.inner.clock.now();
        let recovered = {
            let mut tx = self.inner.store.begin()?;
            let recovered = recover(&mut *tx, now)?;
            tx.commit()?;
            recovered
        };
        if recovered > 0 {
            tracing::info!(recovered, "recovered work interrupted by a previous process");
        }
        Ok(self.inner.schedulers.schedule_eligible()?)
    }

    /// Resolves once nothing is executing.
    pub async fn wait_idle(&self) {
        self.inner.processor.wait_idle().await;
    }

    /// Stop the tick loop and every running execution, then wait for them to settle.
    ///
    /// Interrupted work goes back to ENQUEUED and runs again after the next start.
    pub async fn shutdown(&self) {
        tracing::info!("work manager shutting down");
        self.inner.shutdown.cancel();
        self.inner.processor.stop_all();
        self.wait_idle().await;
    }
}

fn recover(tx: &mut (dyn StoreTransaction + '_), now: DateTime<Utc>) -> Result<usize, StoreError> {
    let mut recovered = 0;
    for mut spec in tx.all() {
        if spec.state.is_finished() {
            continue;
        }
        if spec.state == WorkState::Running {
            tracing::debug!(work_id = %spec.id, "resetting interrupted work");
            spec.reset_for_retry(now);
            recovered += 1;
        }
        spec.schedule_requested_at = None;
        tx.update(spec)?;
    }
    Ok(recovered)
}

async fn tick_loop(inner: Weak<ManagerInner>, shutdown: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.tick();
            }
        }
    }
    tracing::debug!("tick loop stopped");
}

#[cfg(test)]
mod tests;
