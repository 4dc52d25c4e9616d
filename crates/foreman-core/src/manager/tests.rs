use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::domain::spec::tests::t0;
use crate::domain::{Constraints, Data, InputMerger, NetworkType};
use crate::impls::InMemoryWorkStore;
use crate::ports::{worker_fn, ManualClock, WorkResult, Worker};

struct Harness {
    manager: WorkManager,
    store: Arc<InMemoryWorkStore>,
    clock: Arc<ManualClock>,
}

fn config() -> Configuration {
    Configuration {
        tick_interval: None,
        ..Configuration::default()
    }
}

fn harness_with(workers: Vec<(&str, Arc<dyn Worker>)>) -> Harness {
    let store = Arc::new(InMemoryWorkStore::new());
    harness_on(store, workers)
}

fn harness_on(store: Arc<InMemoryWorkStore>, workers: Vec<(&str, Arc<dyn Worker>)>) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let mut builder = WorkManager::builder(config())
        .with_store(store.clone())
        .with_clock(clock.clone());
    for (name, worker) in workers {
        builder = builder.register(name, worker).unwrap();
    }
    Harness {
        manager: builder.build().unwrap(),
        store,
        clock,
    }
}

fn echo() -> Arc<dyn Worker> {
    worker_fn(|ctx| async move { WorkResult::Success(ctx.input.clone()) })
}

fn blocking() -> Arc<dyn Worker> {
    worker_fn(|ctx| async move {
        ctx.stopped().await;
        WorkResult::success()
    })
}

fn state_of(h: &Harness, id: &WorkId) -> Option<WorkState> {
    h.manager
        .get_work_info_by_id(id)
        .unwrap()
        .map(|info| info.state)
}

async fn settle(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(5), h.manager.wait_idle())
        .await
        .expect("manager did not go idle");
}

async fn wait_running(h: &Harness, id: &WorkId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state_of(h, id) != Some(WorkState::Running) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("work never started");
}

#[tokio::test]
async fn enqueued_work_runs_to_success() {
    let h = harness_with(vec![("echo", echo())]);
    let request = WorkRequest::one_time("echo")
        .with_input(Data::empty().with("n", 7))
        .add_tag("demo")
        .build();

    let id = h.manager.enqueue(request).unwrap();
    settle(&h).await;

    let info = h.manager.get_work_info_by_id(&id).unwrap().unwrap();
    assert_eq!(info.state, WorkState::Succeeded);
    assert_eq!(info.output.get_i64("n"), Some(7));
    assert_eq!(info.run_attempt_count, 1);
    assert_eq!(h.manager.get_work_infos_by_tag("demo").unwrap().len(), 1);
}

#[tokio::test]
async fn chain_runs_in_order_and_merges_outputs() {
    let h = harness_with(vec![("echo", echo())]);
    let first = WorkRequest::one_time("echo")
        .with_input(Data::empty().with("a", 1))
        .build();
    let second = WorkRequest::one_time("echo")
        .with_input(Data::empty().with("b", 2))
        .build();
    let last = WorkRequest::one_time("echo")
        .with_input_merger(InputMerger::Overwriting)
        .build();
    let last_id = last.id();

    let both = WorkContinuation::combine(vec![
        h.manager.begin_with(vec![first]),
        h.manager.begin_with(vec![second]),
    ])
    .unwrap();
    both.then(vec![last]).enqueue().unwrap();
    settle(&h).await;

    let info = h.manager.get_work_info_by_id(&last_id).unwrap().unwrap();
    assert_eq!(info.state, WorkState::Succeeded);
    assert_eq!(info.output.get_i64("a"), Some(1));
    assert_eq!(info.output.get_i64("b"), Some(2));
}

#[tokio::test]
async fn failure_fails_the_rest_of_the_chain() {
    let h = harness_with(vec![
        ("echo", echo()),
        ("fail", worker_fn(|_ctx| async { WorkResult::failure() })),
    ]);
    let failing = WorkRequest::one_time("fail").build();
    let after = WorkRequest::one_time("echo").build();
    let (failing_id, after_id) = (failing.id(), after.id());

    h.manager
        .begin_with(vec![failing])
        .then(vec![after])
        .enqueue()
        .unwrap();
    settle(&h).await;

    assert_eq!(state_of(&h, &failing_id), Some(WorkState::Failed));
    assert_eq!(state_of(&h, &after_id), Some(WorkState::Failed));
}

#[tokio::test]
async fn enqueue_after_existing_work() {
    let h = harness_with(vec![("echo", echo())]);
    let first = h
        .manager
        .enqueue(WorkRequest::one_time("echo").build())
        .unwrap();
    settle(&h).await;

    let second = h
        .manager
        .enqueue_after(WorkRequest::one_time("echo").build(), &[first])
        .unwrap();
    settle(&h).await;
    assert_eq!(state_of(&h, &second), Some(WorkState::Succeeded));

    let missing = WorkId::generate();
    let err = h
        .manager
        .enqueue_after(WorkRequest::one_time("echo").build(), &[missing])
        .unwrap_err();
    assert!(matches!(err, WorkError::PrerequisiteNotFound(p) if p == missing));
}

#[tokio::test]
async fn retry_runs_again_after_backoff_tick() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let flaky = worker_fn(move |_ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                WorkResult::Retry
            } else {
                WorkResult::success()
            }
        }
    });
    let h = harness_with(vec![("flaky", flaky)]);
    let id = h
        .manager
        .enqueue(WorkRequest::one_time("flaky").build())
        .unwrap();
    settle(&h).await;
    assert_eq!(state_of(&h, &id), Some(WorkState::Enqueued));

    // default backoff: 30s exponential
    h.clock.advance(Duration::from_secs(29));
    h.manager.tick();
    settle(&h).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.clock.advance(Duration::from_secs(1));
    h.manager.tick();
    settle(&h).await;
    assert_eq!(state_of(&h, &id), Some(WorkState::Succeeded));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn constrained_work_waits_for_the_device() {
    let h = harness_with(vec![("echo", echo())]);
    h.manager.update_device_state(|d| d.network.metered = true);
    let id = h
        .manager
        .enqueue(
            WorkRequest::one_time("echo")
                .with_constraints(Constraints::none().with_network(NetworkType::Unmetered))
                .build(),
        )
        .unwrap();
    settle(&h).await;
    assert_eq!(state_of(&h, &id), Some(WorkState::Enqueued));

    h.manager.update_device_state(|d| d.network.metered = false);
    settle(&h).await;
    assert_eq!(state_of(&h, &id), Some(WorkState::Succeeded));
    assert!(!h.manager.device_state().network.metered);
}

#[tokio::test]
async fn cancel_stops_running_work_and_dependents() {
    let h = harness_with(vec![("block", blocking()), ("echo", echo())]);
    let running = WorkRequest::one_time("block").build();
    let dependent = WorkRequest::one_time("echo").build();
    let (running_id, dependent_id) = (running.id(), dependent.id());
    h.manager
        .begin_with(vec![running])
        .then(vec![dependent])
        .enqueue()
        .unwrap();
    wait_running(&h, &running_id).await;

    let cancelled = h.manager.cancel_work_by_id(&running_id).unwrap();
    assert_eq!(cancelled.len(), 2);
    settle(&h).await;

    assert_eq!(state_of(&h, &running_id), Some(WorkState::Cancelled));
    assert_eq!(state_of(&h, &dependent_id), Some(WorkState::Cancelled));
    assert!(!h.manager.has_work());

    let missing = WorkId::generate();
    assert!(matches!(
        h.manager.cancel_work_by_id(&missing),
        Err(WorkError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_all_records_the_time() {
    let h = harness_with(vec![("block", blocking())]);
    let ids = h
        .manager
        .enqueue_all(vec![
            WorkRequest::one_time("block").build(),
            WorkRequest::one_time("block").build(),
        ])
        .unwrap();
    assert!(h.manager.last_cancel_all_time().is_none());

    h.clock.advance(Duration::from_secs(3));
    let cancelled = h.manager.cancel_all_work().unwrap();
    settle(&h).await;

    assert_eq!(cancelled.len(), 2);
    assert_eq!(
        h.manager.last_cancel_all_time(),
        Some(t0() + chrono::TimeDelta::seconds(3))
    );
    for id in &ids {
        assert_eq!(state_of(&h, id), Some(WorkState::Cancelled));
    }
}

#[tokio::test]
async fn unique_keep_and_replace() {
    let h = harness_with(vec![("block", blocking())]);
    let first = WorkRequest::one_time("block").build();
    let first_id = first.id();
    h.manager
        .enqueue_unique_work("sync", ExistingWorkPolicy::Keep, vec![first])
        .unwrap();
    wait_running(&h, &first_id).await;

    let kept = h
        .manager
        .enqueue_unique_work(
            "sync",
            ExistingWorkPolicy::Keep,
            vec![WorkRequest::one_time("block").build()],
        )
        .unwrap();
    assert_eq!(kept.kept, 1);
    assert_eq!(h.manager.get_work_infos_for_unique_work("sync").unwrap().len(), 1);

    let replacement = WorkRequest::one_time("block").build();
    let replacement_id = replacement.id();
    let replaced = h
        .manager
        .enqueue_unique_work("sync", ExistingWorkPolicy::Replace, vec![replacement])
        .unwrap();
    assert_eq!(replaced.replaced, vec![first_id]);
    wait_running(&h, &replacement_id).await;

    assert!(state_of(&h, &first_id).is_none());
    let infos = h.manager.get_work_infos_for_unique_work("sync").unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, replacement_id);

    h.manager.cancel_unique_work("sync").unwrap();
    settle(&h).await;
    assert_eq!(state_of(&h, &replacement_id), Some(WorkState::Cancelled));
}

#[tokio::test]
async fn unique_periodic_work_requires_a_periodic_request() {
    let h = harness_with(vec![("echo", echo())]);
    let err = h
        .manager
        .enqueue_unique_periodic_work(
            "refresh",
            ExistingPeriodicWorkPolicy::Keep,
            WorkRequest::one_time("echo").build(),
        )
        .unwrap_err();
    assert!(matches!(err, WorkError::InvalidRequest(_)));
}

#[tokio::test]
async fn periodic_work_runs_each_interval() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let periodic = worker_fn(move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            WorkResult::success()
        }
    });
    let h = harness_with(vec![("refresh", periodic)]);
    let request = WorkRequest::periodic("refresh", Duration::from_secs(3600)).build();
    let id = request.id();
    h.manager
        .enqueue_unique_periodic_work("refresh", ExistingPeriodicWorkPolicy::Keep, request)
        .unwrap();
    settle(&h).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state_of(&h, &id), Some(WorkState::Enqueued));

    h.clock.advance(Duration::from_secs(1800));
    h.manager.tick();
    settle(&h).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.clock.advance(Duration::from_secs(1800));
    h.manager.tick();
    settle(&h).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn prune_removes_finished_work() {
    let h = harness_with(vec![("echo", echo())]);
    let id = h
        .manager
        .enqueue(WorkRequest::one_time("echo").build())
        .unwrap();
    settle(&h).await;

    assert_eq!(h.manager.prune_work().unwrap(), vec![id]);
    assert!(state_of(&h, &id).is_none());
}

#[tokio::test]
async fn startup_recovers_work_left_running() {
    let store = Arc::new(InMemoryWorkStore::new());
    let request = WorkRequest::one_time("echo").build();
    let id = request.id();
    {
        let mut spec = request.into_spec(WorkState::Running, None, t0());
        spec.run_attempt_count = 1;
        spec.schedule_requested_at = Some(t0());
        let mut tx = store.begin().unwrap();
        tx.insert(spec).unwrap();
        tx.commit().unwrap();
    }

    let h = harness_on(store, vec![("echo", echo())]);
    // back to ENQUEUED and waiting for its backoff
    assert_eq!(state_of(&h, &id), Some(WorkState::Enqueued));
    assert!(h.manager.greedy_scheduler().is_tracking(&id));

    h.clock.advance(Duration::from_secs(30));
    h.manager.tick();
    settle(&h).await;
    let info = h.manager.get_work_info_by_id(&id).unwrap().unwrap();
    assert_eq!(info.state, WorkState::Succeeded);
    assert_eq!(info.run_attempt_count, 2);
}

#[tokio::test]
async fn scheduler_limit_hands_work_over_in_batches() {
    let h = harness_with(vec![("echo", echo())]);
    h.manager.update_device_state(|d| d.charging = false);
    let constrained = || {
        WorkRequest::one_time("echo")
            .with_constraints(Constraints::none().with_charging())
            .build()
    };
    let requests: Vec<_> = (0..25).map(|_| constrained()).collect();
    h.manager.enqueue_all(requests).unwrap();
    assert_eq!(h.manager.greedy_scheduler().tracked_count(), 20);

    h.manager.update_device_state(|d| d.charging = true);
    settle(&h).await;
    h.manager.tick();
    settle(&h).await;

    let succeeded = h
        .store
        .begin()
        .unwrap()
        .all()
        .into_iter()
        .filter(|s| s.state == WorkState::Succeeded)
        .count();
    assert_eq!(succeeded, 25);
}

#[tokio::test]
async fn shutdown_interrupts_running_work() {
    let h = harness_with(vec![("block", blocking())]);
    let id = h
        .manager
        .enqueue(WorkRequest::one_time("block").build())
        .unwrap();
    wait_running(&h, &id).await;

    h.manager.shutdown().await;
    assert!(!h.manager.has_work());
    assert_eq!(state_of(&h, &id), Some(WorkState::Enqueued));
}

#[tokio::test]
async fn execution_listeners_can_be_removed() {
    let h = harness_with(vec![("echo", echo())]);
    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    let listener = h
        .manager
        .add_execution_listener(Arc::new(move |_: &WorkId, _: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

    h.manager
        .enqueue(WorkRequest::one_time("echo").build())
        .unwrap();
    settle(&h).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(h.manager.remove_execution_listener(listener));
    h.manager
        .enqueue(WorkRequest::one_time("echo").build())
        .unwrap();
    settle(&h).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
