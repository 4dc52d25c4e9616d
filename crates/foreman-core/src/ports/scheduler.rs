//! Scheduler port
//!
//! enqueue された WorkSpec の配送を引き受けるもの。
//! in-process の `GreedyScheduler` の他に、外部の仕組み（OS のジョブスケジューラなど）
//! を差し込めるようにするための境界です。

use crate::domain::{WorkId, WorkSpec};

pub trait Scheduler: Send + Sync {
    /// Arrange for these rows to run once they are eligible.
    fn schedule(&self, specs: &[WorkSpec]);

    /// Forget about the row and stop it if this scheduler started it.
    fn cancel(&self, id: &WorkId);
}
