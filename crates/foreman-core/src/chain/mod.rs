//! Chain / unique-work resolution.
//!
//! # 構成
//! - [`WorkContinuation`]: `begin_with` / `then` / `combine` で組み立てる依存グラフ
//! - `enqueue_continuation`: グラフ全体を 1 トランザクションで書き込む
//! - cancel / prune の補助関数（同じく呼び出し側のトランザクション内で動く）
//!
//! # 挿入時の状態
//! - 前提条件なし → ENQUEUED
//! - 前提条件のどれかが FAILED → FAILED、CANCELLED → CANCELLED
//! - 全部 SUCCEEDED → ENQUEUED、それ以外 → BLOCKED
//!
//! # unique work
//! 名前つきの継続は子にも名前を引き継ぐが、ポリシーは前提条件を持たない
//! （= 最初の）ノードにだけ適用される。

pub(crate) mod resolve;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{ExistingWorkPolicy, WorkId, WorkRequest, WorkState};
use crate::error::WorkError;
use crate::manager::WorkManager;
use crate::ports::StoreTransaction;

use self::resolve::cancel_with_dependents;

/// Unique name plus the policy to apply on collision.
#[derive(Debug, Clone)]
pub(crate) struct UniqueName {
    pub name: String,
    pub policy: ExistingWorkPolicy,
}

/// One node of a continuation graph. Empty `work` marks a combine node.
#[derive(Debug)]
pub(crate) struct ContinuationNode {
    pub unique: Option<UniqueName>,
    pub work: Vec<WorkRequest>,
    pub parents: Vec<Arc<ContinuationNode>>,
    /// Rows already in the store that this node also waits for.
    pub after: Vec<WorkId>,
}

impl ContinuationNode {
    pub(crate) fn root(work: Vec<WorkRequest>, unique: Option<UniqueName>) -> Arc<Self> {
        Arc::new(Self {
            unique,
            work,
            parents: Vec::new(),
            after: Vec::new(),
        })
    }

    pub(crate) fn after(work: Vec<WorkRequest>, prerequisites: Vec<WorkId>) -> Arc<Self> {
        Arc::new(Self {
            unique: None,
            work,
            parents: Vec::new(),
            after: prerequisites,
        })
    }
}

/// What an enqueue changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Newly written rows, parents first.
    pub inserted: Vec<WorkId>,
    /// Rows cancelled (and possibly deleted) by a REPLACE or a KEEP clean-up.
    pub replaced: Vec<WorkId>,
    /// Nodes skipped because KEEP found pending work under their name.
    pub kept: usize,
}

/// A graph of work requests that runs parents before children.
///
/// ```ignore
/// manager
///     .begin_with(vec![download])
///     .then(vec![resize, thumbnail])
///     .then(vec![upload])
///     .enqueue()?;
/// ```
#[derive(Clone)]
pub struct WorkContinuation {
    manager: WorkManager,
    node: Arc<ContinuationNode>,
}

impl WorkContinuation {
    pub(crate) fn new(manager: WorkManager, node: Arc<ContinuationNode>) -> Self {
        Self { manager, node }
    }

    /// Work that runs after every request of this continuation succeeded.
    pub fn then(&self, work: Vec<WorkRequest>) -> WorkContinuation {
        let unique = self.node.unique.as_ref().map(|u| UniqueName {
            name: u.name.clone(),
            policy: ExistingWorkPolicy::Keep,
        });
        Self::new(
            self.manager.clone(),
            Arc::new(ContinuationNode {
                unique,
                work,
                parents: vec![Arc::clone(&self.node)],
                after: Vec::new(),
            }),
        )
    }

    /// Join several continuations; whatever follows waits for all of them.
    pub fn combine(continuations: Vec<WorkContinuation>) -> Result<WorkContinuation, WorkError> {
        let Some(first) = continuations.first() else {
            return Err(WorkError::InvalidRequest(
                "combine needs at least one continuation".into(),
            ));
        };
        let manager = first.manager.clone();
        let parents = continuations.iter().map(|c| Arc::clone(&c.node)).collect();
        Ok(Self::new(
            manager,
            Arc::new(ContinuationNode {
                unique: None,
                work: Vec::new(),
                parents,
                after: Vec::new(),
            }),
        ))
    }

    /// Ids of this node's own requests.
    pub fn work_ids(&self) -> Vec<WorkId> {
        self.node.work.iter().map(WorkRequest::id).collect()
    }

    /// Write the whole graph, then hand eligible work to the schedulers.
    pub fn enqueue(&self) -> Result<EnqueueOutcome, WorkError> {
        self.manager.enqueue_continuation(&self.node)
    }
}

impl std::fmt::Debug for WorkContinuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkContinuation")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

/// Write every node reachable from `node` (parents first) into `tx`.
pub(crate) fn enqueue_continuation(
    tx: &mut (dyn StoreTransaction + '_),
    node: &Arc<ContinuationNode>,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome, WorkError> {
    let mut outcome = EnqueueOutcome::default();
    let mut visited = HashMap::new();
    enqueue_node(tx, node, now, &mut outcome, &mut visited)?;
    Ok(outcome)
}

/// Returns the ids children of `node` depend on, or `None` when the node was kept.
fn enqueue_node(
    tx: &mut (dyn StoreTransaction + '_),
    node: &Arc<ContinuationNode>,
    now: DateTime<Utc>,
    outcome: &mut EnqueueOutcome,
    visited: &mut HashMap<*const ContinuationNode, Option<Vec<WorkId>>>,
) -> Result<Option<Vec<WorkId>>, WorkError> {
    let key = Arc::as_ptr(node);
    if let Some(ids) = visited.get(&key) {
        return Ok(ids.clone());
    }

    let mut prerequisites = node.after.clone();
    let mut skipped = false;
    for parent in &node.parents {
        match enqueue_node(tx, parent, now, outcome, visited)? {
            Some(ids) => prerequisites.extend(ids),
            None => skipped = true,
        }
    }
    prerequisites.sort();
    prerequisites.dedup();

    let ids = if skipped {
        None
    } else if node.work.is_empty() {
        Some(prerequisites)
    } else if node.work.iter().all(|r| tx.get(&r.id()).is_some()) {
        // already enqueued by an earlier call
        Some(node.work.iter().map(WorkRequest::id).collect())
    } else {
        insert_work(tx, node, prerequisites, now, outcome)?
    };
    visited.insert(key, ids.clone());
    Ok(ids)
}

fn insert_work(
    tx: &mut (dyn StoreTransaction + '_),
    node: &ContinuationNode,
    mut prerequisites: Vec<WorkId>,
    now: DateTime<Utc>,
    outcome: &mut EnqueueOutcome,
) -> Result<Option<Vec<WorkId>>, WorkError> {
    for request in &node.work {
        if request.is_periodic() && !prerequisites.is_empty() {
            return Err(WorkError::InvalidRequest(format!(
                "periodic work {} cannot have prerequisites",
                request.id()
            )));
        }
    }
    if let Some(missing) = prerequisites.iter().find(|p| tx.get(p).is_none()) {
        return Err(WorkError::PrerequisiteNotFound(*missing));
    }

    let unique_name = node.unique.as_ref().map(|u| u.name.clone());
    if let Some(unique) = node.unique.as_ref().filter(|_| prerequisites.is_empty()) {
        match apply_policy(tx, unique, node, outcome)? {
            PolicyOutcome::Keep => {
                outcome.kept += 1;
                return Ok(None);
            }
            PolicyOutcome::Insert => {}
            PolicyOutcome::InsertAfter(leaves) => prerequisites = leaves,
        }
    }

    let state = initial_state(tx, &prerequisites);
    let mut ids = Vec::with_capacity(node.work.len());
    for request in &node.work {
        let id = request.id();
        let spec = request.clone().into_spec(state, unique_name.clone(), now);
        spec.input
            .check_size()
            .map_err(|source| WorkError::DataTooLarge { id, source })?;
        tx.insert(spec)?;
        for prerequisite in &prerequisites {
            tx.insert_dependency(id, *prerequisite);
        }
        tracing::debug!(work_id = %id, %state, prerequisites = prerequisites.len(), "work inserted");
        outcome.inserted.push(id);
        ids.push(id);
    }
    Ok(Some(ids))
}

enum PolicyOutcome {
    Keep,
    Insert,
    InsertAfter(Vec<WorkId>),
}

fn apply_policy(
    tx: &mut (dyn StoreTransaction + '_),
    unique: &UniqueName,
    node: &ContinuationNode,
    outcome: &mut EnqueueOutcome,
) -> Result<PolicyOutcome, WorkError> {
    let existing: Vec<_> = tx
        .ids_for_name(&unique.name)
        .into_iter()
        .filter_map(|id| tx.get(&id))
        .collect();
    if existing.is_empty() {
        return Ok(PolicyOutcome::Insert);
    }

    match unique.policy {
        ExistingWorkPolicy::Append => {
            if node.work.iter().any(WorkRequest::is_periodic) {
                return Err(WorkError::InvalidRequest(format!(
                    "APPEND is not supported for periodic unique work {}",
                    unique.name
                )));
            }
            let leaves: Vec<WorkId> = existing
                .iter()
                .filter(|s| tx.dependents(&s.id).is_empty())
                .map(|s| s.id)
                .collect();
            tracing::info!(name = %unique.name, leaves = leaves.len(), "appending to unique work");
            Ok(PolicyOutcome::InsertAfter(leaves))
        }
        ExistingWorkPolicy::Keep
            if existing.iter().any(|s| {
                matches!(
                    s.state,
                    WorkState::Enqueued | WorkState::Running | WorkState::Blocked
                )
            }) =>
        {
            tracing::info!(name = %unique.name, "unique work is pending; keeping it");
            Ok(PolicyOutcome::Keep)
        }
        ExistingWorkPolicy::Keep | ExistingWorkPolicy::Replace => {
            tracing::info!(name = %unique.name, policy = ?unique.policy, "replacing unique work");
            for spec in &existing {
                outcome.replaced.extend(cancel_with_dependents(tx, spec.id)?);
            }
            for spec in &existing {
                tx.delete(&spec.id);
            }
            outcome.replaced.sort();
            outcome.replaced.dedup();
            Ok(PolicyOutcome::Insert)
        }
    }
}

fn initial_state(tx: &(dyn StoreTransaction + '_), prerequisites: &[WorkId]) -> WorkState {
    if prerequisites.is_empty() {
        return WorkState::Enqueued;
    }
    let states: Vec<WorkState> = prerequisites
        .iter()
        .filter_map(|p| tx.get(p).map(|s| s.state))
        .collect();
    if states.contains(&WorkState::Failed) {
        WorkState::Failed
    } else if states.contains(&WorkState::Cancelled) {
        WorkState::Cancelled
    } else if states.iter().all(|s| *s == WorkState::Succeeded) {
        WorkState::Enqueued
    } else {
        WorkState::Blocked
    }
}

/// Cancel every unfinished row that carries `tag`, plus dependents.
pub(crate) fn cancel_by_tag(
    tx: &mut (dyn StoreTransaction + '_),
    tag: &str,
) -> Result<Vec<WorkId>, WorkError> {
    let ids = tx.ids_for_tag(tag);
    cancel_each(tx, ids)
}

/// Cancel every row of the unique name, plus dependents.
pub(crate) fn cancel_by_name(
    tx: &mut (dyn StoreTransaction + '_),
    name: &str,
) -> Result<Vec<WorkId>, WorkError> {
    let ids = tx.ids_for_name(name);
    cancel_each(tx, ids)
}

/// Cancel every unfinished row.
pub(crate) fn cancel_all(tx: &mut (dyn StoreTransaction + '_)) -> Result<Vec<WorkId>, WorkError> {
    let unfinished = tx
        .all()
        .into_iter()
        .filter(|s| !s.state.is_finished())
        .map(|s| s.id)
        .collect();
    cancel_each(tx, unfinished)
}

fn cancel_each(
    tx: &mut (dyn StoreTransaction + '_),
    ids: Vec<WorkId>,
) -> Result<Vec<WorkId>, WorkError> {
    let mut cancelled = Vec::new();
    for id in ids {
        cancelled.extend(cancel_with_dependents(tx, id)?);
    }
    cancelled.sort();
    cancelled.dedup();
    Ok(cancelled)
}

/// Delete finished rows none of whose dependents are still unfinished.
pub(crate) fn prune(tx: &mut (dyn StoreTransaction + '_)) -> Vec<WorkId> {
    let prunable: Vec<WorkId> = tx
        .all()
        .into_iter()
        .filter(|s| s.state.is_finished())
        .filter(|s| {
            tx.dependents(&s.id)
                .iter()
                .all(|d| tx.get(d).is_none_or(|d| d.state.is_finished()))
        })
        .map(|s| s.id)
        .collect();
    for id in &prunable {
        tx.delete(id);
    }
    if !prunable.is_empty() {
        tracing::info!(count = prunable.len(), "pruned finished work");
    }
    prunable
}
