//! GreedyScheduler - プロセス内の制約ディスパッチャ
//!
//! 渡された ENQUEUED 行を追跡し、実行可能になった瞬間に Processor で開始します。
//!
//! 実行可能 = 制約が満たされている && 初回遅延 / backoff を過ぎている && 周期の窓に入っている
//!
//! - 制約つきの行は [`WorkConstraintsTracker`] に任せ、その通知で開始 / 停止する
//! - 時間条件は `tick` で再評価する
//! - 実行が終わるたびに store から読み直し、終了していれば追跡をやめる
//! - 自身の lock を握ったまま Processor の開始 / 停止や tracker を呼ばない

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};

use crate::domain::{WorkId, WorkSpec, WorkState};
use crate::ports::{Clock, RuntimeExtras, Scheduler, WorkStore};
use crate::processor::Processor;
use crate::tracker::{ConstraintListener, DeviceState, WorkConstraintsTracker};

/// Why a tracked work item is (not) runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalWorkState {
    pub constraints_met: bool,
    pub initial_delay_met: bool,
    pub period_delay_met: bool,
}

impl InternalWorkState {
    pub fn is_runnable(&self) -> bool {
        self.constraints_met && self.initial_delay_met && self.period_delay_met
    }
}

struct TrackedWork {
    spec: WorkSpec,
    state: InternalWorkState,
}

impl TrackedWork {
    fn new(spec: WorkSpec, now: DateTime<Utc>, constraints_met: bool) -> Self {
        let mut tracked = Self {
            spec,
            state: InternalWorkState {
                constraints_met,
                initial_delay_met: false,
                period_delay_met: false,
            },
        };
        tracked.update_delays(now);
        tracked
    }

    fn update_delays(&mut self, now: DateTime<Utc>) {
        let due = self.spec.is_due(now);
        if self.spec.is_periodic() {
            self.state.initial_delay_met = true;
            self.state.period_delay_met = due;
        } else {
            self.state.initial_delay_met = due;
            self.state.period_delay_met = true;
        }
    }
}

pub struct GreedyScheduler {
    processor: Processor,
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    tracker: WorkConstraintsTracker,
    tracked: Mutex<BTreeMap<WorkId, TrackedWork>>,
}

impl GreedyScheduler {
    /// Create the scheduler and register it as an execution listener of `processor`.
    pub fn new(
        processor: Processor,
        store: Arc<dyn WorkStore>,
        clock: Arc<dyn Clock>,
        device: DeviceState,
    ) -> Arc<Self> {
        let scheduler = Arc::new_cyclic(|weak: &Weak<GreedyScheduler>| {
            let listener: Weak<dyn ConstraintListener> = weak.clone();
            Self {
                processor: processor.clone(),
                store,
                clock: Arc::clone(&clock),
                tracker: WorkConstraintsTracker::new(device, clock, listener),
                tracked: Mutex::new(BTreeMap::new()),
            }
        });

        let weak = Arc::downgrade(&scheduler);
        processor.add_execution_listener(Arc::new(move |id: &WorkId, needs_reschedule: bool| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_executed(id, needs_reschedule);
            }
        }));
        scheduler
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<WorkId, TrackedWork>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracker(&self) -> &WorkConstraintsTracker {
        &self.tracker
    }

    pub fn is_tracking(&self, id: &WorkId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    pub fn internal_state(&self, id: &WorkId) -> Option<InternalWorkState> {
        self.lock().get(id).map(|t| t.state)
    }

    /// Change device signals; work whose constraints flip is started or stopped.
    pub fn update_device_state(&self, update: impl FnOnce(&mut DeviceState)) {
        self.tracker.update_device_state(update);
    }

    /// Re-evaluate every time-based condition and start whatever became runnable.
    pub fn tick(&self) {
        self.tracker.refresh();
        let now = self.clock.now();
        let runnable: Vec<WorkId> = {
            let mut tracked = self.lock();
            tracked
                .iter_mut()
                .filter_map(|(id, work)| {
                    work.update_delays(now);
                    work.state.is_runnable().then_some(*id)
                })
                .collect()
        };
        self.start_all(&runnable);
    }

    fn start_all(&self, ids: &[WorkId]) {
        for id in ids {
            if !self.processor.is_enqueued(id) {
                self.processor.start_work(id, RuntimeExtras::default());
            }
        }
    }

    fn constrained_specs(tracked: &BTreeMap<WorkId, TrackedWork>) -> Vec<WorkSpec> {
        tracked
            .values()
            .filter(|w| w.spec.has_constraints())
            .map(|w| w.spec.clone())
            .collect()
    }

    fn on_executed(&self, id: &WorkId, needs_reschedule: bool) {
        let spec = match self.store.begin() {
            Ok(tx) => tx.get(id),
            Err(e) => {
                tracing::error!(work_id = %id, error = %e, "could not refresh executed work");
                return;
            }
        };
        let now = self.clock.now();

        let (runnable, untracked) = {
            let mut tracked = self.lock();
            match spec {
                Some(spec) if !spec.state.is_finished() => match tracked.get_mut(id) {
                    Some(work) => {
                        // Running のまま残った行は開始しても何もしないので、回し続けない
                        let restart = needs_reschedule && spec.state == WorkState::Enqueued;
                        if spec.state == WorkState::Running {
                            tracing::warn!(work_id = %id, "executed work is still RUNNING; not restarting");
                        }
                        work.spec = spec;
                        work.update_delays(now);
                        (work.state.is_runnable() && restart, false)
                    }
                    None => (false, false),
                },
                _ => (false, tracked.remove(id).is_some()),
            }
        };

        if untracked {
            tracing::debug!(work_id = %id, "stopped tracking finished work");
            let constrained = Self::constrained_specs(&self.lock());
            self.tracker.replace(&constrained);
        } else if runnable {
            self.start_all(&[*id]);
        }
    }
}

impl Scheduler for GreedyScheduler {
    fn schedule(&self, specs: &[WorkSpec]) {
        let now = self.clock.now();
        let (runnable, constrained) = {
            let mut tracked = self.lock();
            let mut runnable = Vec::new();
            for spec in specs.iter().filter(|s| s.state == WorkState::Enqueued) {
                let constraints_met = if spec.has_constraints() {
                    tracked.get(&spec.id).is_some_and(|w| w.state.constraints_met)
                } else {
                    true
                };
                let work = TrackedWork::new(spec.clone(), now, constraints_met);
                if work.state.is_runnable() {
                    runnable.push(spec.id);
                }
                tracked.insert(spec.id, work);
            }
            (runnable, Self::constrained_specs(&tracked))
        };

        tracing::debug!(
            scheduled = specs.len(),
            runnable = runnable.len(),
            constrained = constrained.len(),
            "greedy scheduler received work"
        );
        if !constrained.is_empty() {
            self.tracker.replace(&constrained);
        }
        self.start_all(&runnable);
    }

    fn cancel(&self, id: &WorkId) {
        self.processor.stop_work(id);
        let constrained = {
            let mut tracked = self.lock();
            match tracked.remove(id) {
                Some(work) if work.spec.has_constraints() => Some(Self::constrained_specs(&tracked)),
                _ => None,
            }
        };
        if let Some(constrained) = constrained {
            self.tracker.replace(&constrained);
        }
    }
}

impl ConstraintListener for GreedyScheduler {
    fn on_all_constraints_met(&self, ids: &[WorkId]) {
        let now = self.clock.now();
        let runnable: Vec<WorkId> = {
            let mut tracked = self.lock();
            ids.iter()
                .filter(|id| match tracked.get_mut(*id) {
                    Some(work) => {
                        work.state.constraints_met = true;
                        work.update_delays(now);
                        work.state.is_runnable()
                    }
                    None => {
                        tracing::debug!(work_id = %id, "constraints met for untracked work");
                        false
                    }
                })
                .copied()
                .collect()
        };
        self.start_all(&runnable);
    }

    fn on_all_constraints_not_met(&self, ids: &[WorkId]) {
        let known: Vec<WorkId> = {
            let mut tracked = self.lock();
            ids.iter()
                .filter(|id| match tracked.get_mut(*id) {
                    Some(work) => {
                        work.state.constraints_met = false;
                        true
                    }
                    None => false,
                })
                .copied()
                .collect()
        };
        for id in known {
            if self.processor.stop_work(&id) {
                tracing::info!(work_id = %id, "constraints no longer met; stopping work");
            }
        }
    }
}
