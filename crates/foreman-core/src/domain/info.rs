//! WorkInfo - 読み取り専用の射影

use std::collections::BTreeSet;

use serde::Serialize;

use super::data::Data;
use super::ids::WorkId;
use super::spec::WorkSpec;
use super::state::WorkState;

/// Read-only view of a work item, as returned by the manager's query API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkInfo {
    pub id: WorkId,
    pub state: WorkState,
    pub output: Data,
    pub tags: BTreeSet<String>,
    pub run_attempt_count: u32,
    /// Last progress reported by a running worker (not persisted).
    pub progress: Option<Data>,
}

impl WorkInfo {
    pub fn from_spec(spec: &WorkSpec, progress: Option<Data>) -> Self {
        Self {
            id: spec.id,
            state: spec.state,
            output: spec.output.clone(),
            tags: spec.tags.clone(),
            run_attempt_count: spec.run_attempt_count,
            progress,
        }
    }
}
