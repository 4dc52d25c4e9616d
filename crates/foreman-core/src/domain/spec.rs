//! WorkSpec - 永続化される作業単位
//!
//! # 設計
//! - 1 つの WorkId に対して store 上の行はちょうど 1 つ
//! - 状態は終端状態（Succeeded/Failed/Cancelled）に向かって単調に進む
//!   （例外: Enqueued -> Running -> Enqueued のリトライ/周期リセット）
//! - 実行試行回数は Running に入るときに 1 回だけ加算される

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;
use super::constraints::Constraints;
use super::data::{Data, InputMerger};
use super::ids::WorkId;
use super::state::WorkState;

/// Interval and flex window of a periodic work item.
///
/// The run may happen anywhere in the last `flex` of each `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodicity {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub flex: Duration,
}

/// Persisted record of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub id: WorkId,
    pub worker_name: String,
    pub state: WorkState,
    pub constraints: Constraints,
    pub input: Data,
    pub output: Data,
    pub input_merger: InputMerger,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    pub backoff_policy: BackoffPolicy,

    #[serde(with = "humantime_serde")]
    pub backoff_delay: Duration,

    pub run_attempt_count: u32,

    /// Retry results beyond this many attempts are treated as failures.
    pub max_attempts: Option<u32>,

    pub period: Option<Periodicity>,
    pub period_start_time: Option<DateTime<Utc>>,

    /// When the row last (re-)entered Enqueued.
    pub last_enqueue_time: DateTime<Utc>,

    /// Set once the row has been handed to the schedulers.
    pub schedule_requested_at: Option<DateTime<Utc>>,

    pub tags: BTreeSet<String>,
    pub unique_name: Option<String>,
}

/// `std::time::Duration` to `chrono::TimeDelta`, saturating.
pub(crate) fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `t + d`, saturating at the maximum representable instant.
pub(crate) fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_add_signed(to_delta(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl WorkSpec {
    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    pub fn has_constraints(&self) -> bool {
        !self.constraints.is_empty()
    }

    /// Enqueued after at least one attempt (retry, or interrupted run).
    pub fn is_backed_off(&self) -> bool {
        self.state == WorkState::Enqueued && self.run_attempt_count > 0
    }

    /// Earliest instant at which the next attempt may start.
    pub fn calculate_next_run_time(&self) -> DateTime<Utc> {
        if self.is_backed_off() {
            let delay = self
                .backoff_policy
                .delay(self.backoff_delay, self.run_attempt_count);
            return add_duration(self.last_enqueue_time, delay);
        }
        if let Some(period) = self.period {
            let start = self.period_start_time.unwrap_or(self.last_enqueue_time);
            let offset = period.interval.saturating_sub(period.flex);
            return add_duration(start, offset);
        }
        add_duration(self.last_enqueue_time, self.initial_delay)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.calculate_next_run_time()
    }

    /// Has the attempt budget been used up? (a Retry result then becomes a Failure)
    pub fn retries_exhausted(&self) -> bool {
        self.max_attempts
            .is_some_and(|max| self.run_attempt_count >= max)
    }

    /// Return to Enqueued so a new attempt is scheduled after backoff.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.state = WorkState::Enqueued;
        self.last_enqueue_time = now;
        self.schedule_requested_at = None;
    }

    /// Advance to the next period and return to Enqueued.
    ///
    /// The period start advances by one interval. If the whole next period
    /// already lies in the past, it jumps to `now` instead so missed periods
    /// collapse into a single catch-up run.
    pub fn reset_periodic(&mut self, now: DateTime<Utc>) {
        if let Some(period) = self.period {
            let start = self.period_start_time.unwrap_or(self.last_enqueue_time);
            let next = add_duration(start, period.interval);
            let next = if now >= add_duration(next, period.interval) {
                now
            } else {
                next
            };
            self.period_start_time = Some(next);
        }
        self.state = WorkState::Enqueued;
        self.run_attempt_count = 0;
        self.last_enqueue_time = now;
        self.schedule_requested_at = None;
    }
}
