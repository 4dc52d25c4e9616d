//! WorkRequest - enqueue 前のリクエスト
//!
//! Builder で組み立て、enqueue 時に [`WorkSpec`] の行へ変換されます。
//! 範囲外の値（backoff 遅延・周期・flex）は build 時に丸められ、警告ログが出ます。

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::backoff::{
    clamp_backoff_delay, BackoffPolicy, DEFAULT_BACKOFF_DELAY, MIN_PERIODIC_FLEX,
    MIN_PERIODIC_INTERVAL,
};
use super::constraints::Constraints;
use super::data::{Data, InputMerger};
use super::ids::WorkId;
use super::spec::{add_duration, Periodicity, WorkSpec};
use super::state::WorkState;

/// A unit of work ready to be enqueued.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    id: WorkId,
    worker_name: String,
    constraints: Constraints,
    input: Data,
    input_merger: InputMerger,
    initial_delay: Duration,
    backoff_policy: BackoffPolicy,
    backoff_delay: Duration,
    max_attempts: Option<u32>,
    period: Option<Periodicity>,
    tags: BTreeSet<String>,
}

impl WorkRequest {
    /// Start building a one-off request for the worker registered as `worker_name`.
    pub fn one_time(worker_name: impl Into<String>) -> WorkRequestBuilder {
        WorkRequestBuilder::new(worker_name.into(), None)
    }

    /// Start building a periodic request. The flex window defaults to the whole interval.
    pub fn periodic(worker_name: impl Into<String>, interval: Duration) -> WorkRequestBuilder {
        WorkRequestBuilder::new(
            worker_name.into(),
            Some(Periodicity {
                interval,
                flex: interval,
            }),
        )
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Materialize the persisted row.
    pub(crate) fn into_spec(
        self,
        state: WorkState,
        unique_name: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkSpec {
        let period_start_time = self
            .period
            .map(|_| add_duration(now, self.initial_delay));
        WorkSpec {
            id: self.id,
            worker_name: self.worker_name,
            state,
            constraints: self.constraints,
            input: self.input,
            output: Data::empty(),
            input_merger: self.input_merger,
            initial_delay: self.initial_delay,
            backoff_policy: self.backoff_policy,
            backoff_delay: self.backoff_delay,
            run_attempt_count: 0,
            max_attempts: self.max_attempts,
            period: self.period,
            period_start_time,
            last_enqueue_time: now,
            schedule_requested_at: None,
            tags: self.tags,
            unique_name,
        }
    }
}

pub struct WorkRequestBuilder {
    request: WorkRequest,
}

impl WorkRequestBuilder {
    fn new(worker_name: String, period: Option<Periodicity>) -> Self {
        Self {
            request: WorkRequest {
                id: WorkId::generate(),
                worker_name,
                constraints: Constraints::none(),
                input: Data::empty(),
                input_merger: InputMerger::default(),
                initial_delay: Duration::ZERO,
                backoff_policy: BackoffPolicy::default(),
                backoff_delay: DEFAULT_BACKOFF_DELAY,
                max_attempts: None,
                period,
                tags: BTreeSet::new(),
            },
        }
    }

    pub fn with_id(mut self, id: WorkId) -> Self {
        self.request.id = id;
        self
    }

    pub fn with_input(mut self, input: Data) -> Self {
        self.request.input = input;
        self
    }

    pub fn with_input_merger(mut self, merger: InputMerger) -> Self {
        self.request.input_merger = merger;
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.request.constraints = constraints;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.request.initial_delay = delay;
        self
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy, delay: Duration) -> Self {
        self.request.backoff_policy = policy;
        self.request.backoff_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.request.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Only meaningful for periodic requests.
    pub fn with_flex(mut self, flex: Duration) -> Self {
        if let Some(period) = self.request.period.as_mut() {
            period.flex = flex;
        }
        self
    }

    pub fn add_tag(mut self, tag: impl Into<String>) -> Self {
        self.request.tags.insert(tag.into());
        self
    }

    pub fn build(mut self) -> WorkRequest {
        let requested = self.request.backoff_delay;
        let clamped = clamp_backoff_delay(requested);
        if clamped != requested {
            tracing::warn!(?requested, ?clamped, "backoff delay out of range, clamped");
            self.request.backoff_delay = clamped;
        }

        if let Some(period) = self.request.period.as_mut() {
            if period.interval < MIN_PERIODIC_INTERVAL {
                tracing::warn!(
                    requested = ?period.interval,
                    min = ?MIN_PERIODIC_INTERVAL,
                    "periodic interval too short, clamped"
                );
                period.interval = MIN_PERIODIC_INTERVAL;
            }
            let flex = period.flex.clamp(MIN_PERIODIC_FLEX, period.interval);
            if flex != period.flex {
                tracing::warn!(requested = ?period.flex, clamped = ?flex, "flex out of range, clamped");
                period.flex = flex;
            }
        }

        self.request
    }
}
