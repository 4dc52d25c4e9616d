//! State propagation along prerequisite edges.
//!
//! すべて呼び出し側のトランザクション内で動き、commit は呼び出し側の責任です。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::domain::{WorkId, WorkState};
use crate::error::StoreError;
use crate::ports::StoreTransaction;

/// `id` itself plus every transitive dependent, parents before children.
fn with_transitive_dependents(tx: &(dyn StoreTransaction + '_), id: WorkId) -> Vec<WorkId> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        order.push(current);
        stack.extend(tx.dependents(&current));
    }
    order
}

/// Mark `id` and all its transitive dependents FAILED.
///
/// Rows that are already finished (in particular CANCELLED ones) are left alone.
pub(crate) fn fail_with_dependents(
    tx: &mut (dyn StoreTransaction + '_),
    id: WorkId,
) -> Result<Vec<WorkId>, StoreError> {
    let mut failed = Vec::new();
    for current in with_transitive_dependents(tx, id) {
        let Some(mut spec) = tx.get(&current) else {
            continue;
        };
        if spec.state.is_finished() {
            continue;
        }
        spec.state = WorkState::Failed;
        spec.schedule_requested_at = None;
        tx.update(spec)?;
        failed.push(current);
    }
    Ok(failed)
}

/// Mark `id` and all its transitive dependents CANCELLED.
///
/// Finished rows keep their state. Returns every visited id so the caller can
/// stop executions and tell the schedulers.
pub(crate) fn cancel_with_dependents(
    tx: &mut (dyn StoreTransaction + '_),
    id: WorkId,
) -> Result<Vec<WorkId>, StoreError> {
    let visited = with_transitive_dependents(tx, id);
    for current in &visited {
        let Some(mut spec) = tx.get(current) else {
            continue;
        };
        if spec.state.is_finished() {
            continue;
        }
        spec.state = WorkState::Cancelled;
        spec.schedule_requested_at = None;
        tx.update(spec)?;
    }
    Ok(visited)
}

/// Every prerequisite of `id` has SUCCEEDED (vacuously true without any).
pub(crate) fn all_prerequisites_succeeded(tx: &(dyn StoreTransaction + '_), id: &WorkId) -> bool {
    tx.prerequisites(id).iter().all(|p| {
        tx.get(p)
            .is_some_and(|spec| spec.state == WorkState::Succeeded)
    })
}

/// After `id` succeeded: move each BLOCKED dependent whose prerequisites have all
/// succeeded to ENQUEUED. Returns the unblocked ids.
pub(crate) fn unblock_dependents(
    tx: &mut (dyn StoreTransaction + '_),
    id: WorkId,
    now: DateTime<Utc>,
) -> Result<Vec<WorkId>, StoreError> {
    let mut unblocked = Vec::new();
    for dependent in tx.dependents(&id) {
        let Some(mut spec) = tx.get(&dependent) else {
            continue;
        };
        if spec.state != WorkState::Blocked || !all_prerequisites_succeeded(tx, &dependent) {
            continue;
        }
        tracing::info!(work_id = %dependent, "prerequisites done, setting state to enqueued");
        spec.state = WorkState::Enqueued;
        spec.last_enqueue_time = now;
        spec.schedule_requested_at = None;
        tx.update(spec)?;
        unblocked.push(dependent);
    }
    Ok(unblocked)
}
