//! Unique work policies.

use serde::{Deserialize, Serialize};

/// What to do when one-off work is enqueued under a name that already has work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Cancel and delete the existing chain, then insert the new one.
    Replace,
    /// Do nothing if existing work is still pending (Enqueued, Running or Blocked).
    Keep,
    /// Run the new work after the existing chain's leaves.
    Append,
}

/// Policy for periodic unique work. Append makes no sense for periodic work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingPeriodicWorkPolicy {
    Replace,
    Keep,
}

impl From<ExistingPeriodicWorkPolicy> for ExistingWorkPolicy {
    fn from(p: ExistingPeriodicWorkPolicy) -> Self {
        match p {
            ExistingPeriodicWorkPolicy::Replace => ExistingWorkPolicy::Replace,
            ExistingPeriodicWorkPolicy::Keep => ExistingWorkPolicy::Keep,
        }
    }
}
