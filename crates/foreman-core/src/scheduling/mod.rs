//! Scheduling - Scheduler 群への配送
//!
//! - [`Schedulers`]: 登録済みの全 Scheduler への fan-out と、
//!   「まだ渡していない ENQUEUED 行」を上限つきで渡す `schedule_eligible`
//! - [`GreedyScheduler`]: プロセス内の制約ディスパッチャ

pub mod greedy;

use std::sync::Arc;

use crate::domain::{WorkId, WorkSpec, WorkState};
use crate::error::StoreError;
use crate::ports::{Clock, Scheduler, WorkStore};

pub use self::greedy::{GreedyScheduler, InternalWorkState};

/// Every registered scheduler, plus the bookkeeping of which rows were handed over.
pub struct Schedulers {
    store: Arc<dyn WorkStore>,
    clock: Arc<dyn Clock>,
    max_scheduler_limit: usize,
    schedulers: Vec<Arc<dyn Scheduler>>,
}

impl Schedulers {
    pub fn new(
        store: Arc<dyn WorkStore>,
        clock: Arc<dyn Clock>,
        max_scheduler_limit: usize,
        schedulers: Vec<Arc<dyn Scheduler>>,
    ) -> Self {
        Self {
            store,
            clock,
            max_scheduler_limit,
            schedulers,
        }
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    /// Hand ENQUEUED rows that no scheduler has seen yet to every scheduler.
    ///
    /// Rows already handed over and not yet finished occupy slots of
    /// `max_scheduler_limit`; only the remaining slots are filled (oldest first).
    /// The rows are marked in the store before the schedulers are called.
    pub fn schedule_eligible(&self) -> Result<usize, StoreError> {
        let eligible = {
            let mut tx = self.store.begin()?;
            let all = tx.all();
            let occupied = all
                .iter()
                .filter(|s| s.schedule_requested_at.is_some() && !s.state.is_finished())
                .count();
            let slots = self.max_scheduler_limit.saturating_sub(occupied);
            let now = self.clock.now();
            let eligible: Vec<WorkSpec> = all
                .into_iter()
                .filter(|s| s.state == WorkState::Enqueued && s.schedule_requested_at.is_none())
                .take(slots)
                .map(|mut s| {
                    s.schedule_requested_at = Some(now);
                    s
                })
                .collect();
            for spec in &eligible {
                tx.update(spec.clone())?;
            }
            tx.commit()?;
            eligible
        };

        if !eligible.is_empty() {
            tracing::debug!(count = eligible.len(), "handing work to schedulers");
            self.schedule(&eligible);
        }
        Ok(eligible.len())
    }

    pub fn schedule(&self, specs: &[WorkSpec]) {
        for scheduler in &self.schedulers {
            scheduler.schedule(specs);
        }
    }

    pub fn cancel(&self, id: &WorkId) {
        for scheduler in &self.schedulers {
            scheduler.cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::tests::{sample_spec, t0};
    use crate::impls::InMemoryWorkStore;
    use crate::ports::ManualClock;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<WorkId>>,
        cancelled: Mutex<Vec<WorkId>>,
    }

    impl Scheduler for RecordingScheduler {
        fn schedule(&self, specs: &[WorkSpec]) {
            self.scheduled
                .lock()
                .unwrap()
                .extend(specs.iter().map(|s| s.id));
        }

        fn cancel(&self, id: &WorkId) {
            self.cancelled.lock().unwrap().push(*id);
        }
    }

    fn setup(limit: usize) -> (Arc<InMemoryWorkStore>, Arc<RecordingScheduler>, Schedulers) {
        let store = Arc::new(InMemoryWorkStore::new());
        let recorder = Arc::new(RecordingScheduler::default());
        let schedulers = Schedulers::new(
            store.clone(),
            Arc::new(ManualClock::new(t0())),
            limit,
            vec![recorder.clone() as Arc<dyn Scheduler>],
        );
        (store, recorder, schedulers)
    }

    fn insert(store: &InMemoryWorkStore, state: WorkState, requested: bool) -> WorkId {
        let mut spec = sample_spec();
        spec.state = state;
        if requested {
            spec.schedule_requested_at = Some(t0());
        }
        let id = spec.id;
        let mut tx = store.begin().unwrap();
        tx.insert(spec).unwrap();
        tx.commit().unwrap();
        id
    }

    #[test]
    fn hands_over_unrequested_enqueued_rows_once() {
        let (store, recorder, schedulers) = setup(20);
        let a = insert(&store, WorkState::Enqueued, false);
        let _blocked = insert(&store, WorkState::Blocked, false);
        let _done = insert(&store, WorkState::Succeeded, false);

        assert_eq!(schedulers.schedule_eligible().unwrap(), 1);
        assert_eq!(*recorder.scheduled.lock().unwrap(), vec![a]);
        assert_eq!(
            store.begin().unwrap().get(&a).unwrap().schedule_requested_at,
            Some(t0())
        );

        // already requested: not handed over again
        assert_eq!(schedulers.schedule_eligible().unwrap(), 0);
        assert_eq!(recorder.scheduled.lock().unwrap().len(), 1);
    }

    #[test]
    fn limit_counts_rows_already_handed_over() {
        let (store, recorder, schedulers) = setup(3);
        insert(&store, WorkState::Running, true);
        insert(&store, WorkState::Succeeded, true); // finished, frees its slot
        for _ in 0..5 {
            insert(&store, WorkState::Enqueued, false);
        }

        assert_eq!(schedulers.schedule_eligible().unwrap(), 2);
        assert_eq!(recorder.scheduled.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancel_fans_out() {
        let (_store, recorder, schedulers) = setup(20);
        let id = WorkId::generate();
        schedulers.cancel(&id);
        assert_eq!(*recorder.cancelled.lock().unwrap(), vec![id]);
    }
}
