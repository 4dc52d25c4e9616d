//! One execution of one work item.
//!
//! 流れ:
//! 1. 開始前に中断されていれば resolve
//! 2. 行を読み、Enqueued でなければ resolve（Running なら要再スケジュール）
//! 3. backoff / 遅延の窓に達していなければ実行しない
//! 4. Enqueued -> Running（試行回数 +1）、入力をマージ
//! 5. Worker を専用 task で実行（panic は Failure 扱い）
//! 6. 中断されていれば worker の終了を待ってから Running -> Enqueued に戻し、結果は捨てる
//! 7. 結果を 1 トランザクションで反映（失敗したら Running -> Enqueued）
//!
//! トランザクションは同期関数の中だけで開閉し、await をまたがない。
//! 戻り値は `needs_reschedule`。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::ProcessorInner;
use crate::chain::resolve::{fail_with_dependents, unblock_dependents};
use crate::domain::{Data, WorkId, WorkSpec, WorkState};
use crate::error::StoreError;
use crate::ports::{RuntimeExtras, WorkResult, Worker, WorkerContext};

type ProgressFn = Arc<dyn Fn(&WorkId, Data) + Send + Sync>;

enum Prepared {
    /// Nothing to run; resolve with this `needs_reschedule`.
    Resolved(bool),
    Run {
        worker: Arc<dyn Worker>,
        spec: WorkSpec,
        input: Data,
    },
}

pub(super) async fn execute(
    inner: Arc<ProcessorInner>,
    progress: ProgressFn,
    id: WorkId,
    extras: RuntimeExtras,
    token: CancellationToken,
) -> bool {
    if token.is_cancelled() {
        return resolve_interrupted(&inner, &id);
    }

    let (worker, spec, input) = match prepare(&inner, &id) {
        Ok(Prepared::Resolved(needs_reschedule)) => return needs_reschedule,
        Ok(Prepared::Run {
            worker,
            spec,
            input,
        }) => (worker, spec, input),
        Err(e) => {
            tracing::error!(work_id = %id, error = %e, "store failure before starting work");
            return true;
        }
    };

    tracing::info!(
        work_id = %id,
        worker = %spec.worker_name,
        attempt = spec.run_attempt_count,
        "starting work"
    );
    let ctx = WorkerContext::new(
        id,
        input,
        spec.tags.clone(),
        spec.run_attempt_count,
        extras,
        token.clone(),
        progress,
    );
    let mut join = inner
        .runtime
        .spawn(async move { worker.do_work(ctx).await });

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        joined = &mut join => Some(match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(work_id = %id, error = %e, "worker panicked");
                WorkResult::failure()
            }
        }),
    };

    let result = match result {
        Some(result) if !token.is_cancelled() => result,
        Some(_) => return resolve_interrupted(&inner, &id),
        None => {
            // 停止は協調的: worker が token を見て自分で終わるのを待つ
            if let Err(e) = join.await {
                tracing::warn!(work_id = %id, error = %e, "worker did not stop cleanly");
            }
            return resolve_interrupted(&inner, &id);
        }
    };

    match finish(&inner, id, result) {
        Ok(needs_reschedule) => needs_reschedule,
        Err(e) => {
            tracing::error!(work_id = %id, error = %e, "failed to commit work result");
            // 結果は失われた。Running のまま残さず、backoff つきで ENQUEUED に戻す
            requeue_interrupted(&inner, &id).unwrap_or_else(|e| {
                tracing::error!(work_id = %id, error = %e, "could not requeue work after commit failure");
                true
            })
        }
    }
}

fn prepare(inner: &ProcessorInner, id: &WorkId) -> Result<Prepared, StoreError> {
    let mut tx = inner.store.begin()?;
    let Some(spec) = tx.get(id) else {
        tracing::error!(work_id = %id, "didn't find work spec");
        return Ok(Prepared::Resolved(false));
    };

    if spec.state != WorkState::Enqueued {
        let running = spec.state == WorkState::Running;
        tracing::debug!(
            work_id = %id,
            state = %spec.state,
            "state is not ENQUEUED; not doing any work"
        );
        return Ok(Prepared::Resolved(running));
    }

    let now = inner.clock.now();
    if !spec.is_due(now) {
        tracing::debug!(
            work_id = %id,
            next_run = %spec.calculate_next_run_time(),
            "not eligible yet; delaying"
        );
        return Ok(Prepared::Resolved(true));
    }

    let Some(worker) = inner.registry.get(&spec.worker_name).cloned() else {
        tracing::error!(work_id = %id, worker = %spec.worker_name, "no worker registered");
        fail_with_dependents(&mut *tx, *id)?;
        tx.commit()?;
        return Ok(Prepared::Resolved(false));
    };

    let input = if spec.is_periodic() {
        spec.input.clone()
    } else {
        let mut inputs = vec![spec.input.clone()];
        for prerequisite in tx.prerequisites(id) {
            if let Some(p) = tx.get(&prerequisite) {
                inputs.push(p.output);
            }
        }
        spec.input_merger.merge(&inputs)
    };

    let mut running = spec;
    running.state = WorkState::Running;
    running.run_attempt_count += 1;
    tx.update(running.clone())?;
    tx.commit()?;

    Ok(Prepared::Run {
        worker,
        spec: running,
        input,
    })
}

/// Interrupted execution: put a RUNNING row back to ENQUEUED.
fn resolve_interrupted(inner: &ProcessorInner, id: &WorkId) -> bool {
    tracing::info!(work_id = %id, "work interrupted");
    requeue_interrupted(inner, id).unwrap_or_else(|e| {
        tracing::error!(work_id = %id, error = %e, "failed to resolve interrupted work");
        true
    })
}

fn requeue_interrupted(inner: &ProcessorInner, id: &WorkId) -> Result<bool, StoreError> {
    let mut tx = inner.store.begin()?;
    let Some(mut spec) = tx.get(id) else {
        // REPLACE などで行が消えている
        return Ok(false);
    };
    match spec.state {
        state if state.is_finished() => Ok(false),
        WorkState::Running => {
            spec.reset_for_retry(inner.clock.now());
            tx.update(spec)?;
            tx.commit()?;
            Ok(true)
        }
        _ => Ok(true),
    }
}

/// Commit the worker's result.
fn finish(inner: &ProcessorInner, id: WorkId, result: WorkResult) -> Result<bool, StoreError> {
    let now = inner.clock.now();
    let mut tx = inner.store.begin()?;

    let Some(mut spec) = tx.get(&id) else {
        return Ok(false);
    };
    if spec.state != WorkState::Running {
        // cancel などで先に状態が変わっている
        return Ok(!spec.state.is_finished());
    }

    let result = match result {
        WorkResult::Success(output) | WorkResult::Failure(output)
            if output.check_size().is_err() =>
        {
            tracing::warn!(work_id = %id, "worker output exceeds the size limit; failing");
            WorkResult::failure()
        }
        other => other,
    };

    let needs_reschedule = match result {
        WorkResult::Success(output) => {
            tracing::info!(work_id = %id, "worker result SUCCESS");
            if spec.is_periodic() {
                spec.reset_periodic(now);
                tx.update(spec)?;
            } else {
                spec.state = WorkState::Succeeded;
                spec.output = output;
                tx.update(spec)?;
                unblock_dependents(&mut *tx, id, now)?;
            }
            false
        }
        WorkResult::Retry if spec.retries_exhausted() => {
            tracing::warn!(
                work_id = %id,
                attempts = spec.run_attempt_count,
                "worker result RETRY but attempts are exhausted; failing"
            );
            if spec.is_periodic() {
                spec.reset_periodic(now);
                tx.update(spec)?;
            } else {
                fail_with_dependents(&mut *tx, id)?;
            }
            false
        }
        WorkResult::Retry => {
            tracing::info!(work_id = %id, attempt = spec.run_attempt_count, "worker result RETRY");
            spec.reset_for_retry(now);
            tx.update(spec)?;
            true
        }
        WorkResult::Failure(output) => {
            tracing::info!(work_id = %id, "worker result FAILURE");
            if spec.is_periodic() {
                spec.reset_periodic(now);
                tx.update(spec)?;
            } else {
                spec.output = output;
                tx.update(spec)?;
                fail_with_dependents(&mut *tx, id)?;
            }
            false
        }
    };

    tx.commit()?;
    Ok(needs_reschedule)
}
