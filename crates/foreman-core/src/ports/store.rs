//! WorkStore port - WorkSpec の正本
//!
//! # トランザクション
//! - `begin()` でトランザクションを開始
//! - `commit()` するまで変更は確定しない
//! - commit せずに drop すると rollback
//!
//! 実装は同時に 1 つのトランザクションしか許さなくてよい
//! （in-memory 実装は begin で lock を取り、commit/drop で解放します）。

use crate::domain::{WorkId, WorkSpec, WorkState};
use crate::error::StoreError;

/// Transactional record store for WorkSpecs and their prerequisite edges.
pub trait WorkStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// One open transaction. Dropping it without `commit` discards all changes.
pub trait StoreTransaction {
    fn get(&self, id: &WorkId) -> Option<WorkSpec>;

    /// Insert a new row. Fails with `DuplicateId` if the id is taken.
    fn insert(&mut self, spec: WorkSpec) -> Result<(), StoreError>;

    /// Replace an existing row. Fails with `Missing` if absent.
    fn update(&mut self, spec: WorkSpec) -> Result<(), StoreError>;

    fn set_state(&mut self, id: &WorkId, state: WorkState) -> Result<(), StoreError> {
        let mut spec = self.get(id).ok_or(StoreError::Missing(*id))?;
        spec.state = state;
        self.update(spec)
    }

    /// Remove the row and every edge touching it. Returns whether it existed.
    fn delete(&mut self, id: &WorkId) -> bool;

    /// Every row, ordered by id (oldest first).
    fn all(&self) -> Vec<WorkSpec>;

    fn ids_for_tag(&self, tag: &str) -> Vec<WorkId>;

    fn ids_for_name(&self, name: &str) -> Vec<WorkId>;

    /// `work` waits for `prerequisite`.
    fn insert_dependency(&mut self, work: WorkId, prerequisite: WorkId);

    fn prerequisites(&self, id: &WorkId) -> Vec<WorkId>;

    fn dependents(&self, id: &WorkId) -> Vec<WorkId>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
