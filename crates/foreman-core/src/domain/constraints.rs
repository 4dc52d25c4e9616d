//! Constraints - 実行条件
//!
//! WorkSpec が実行可能になるためにデバイス側で満たされている必要のある条件。
//! 評価そのものは `tracker` モジュールが `DeviceState` に対して行います。

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Required network type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    NotRequired,
    Connected,
    Unmetered,
    NotRoaming,
    Metered,
}

/// Daily time window (UTC). `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Half-open: `start <= t < end`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let t = now.time();
        // 秒未満は比較に使わない
        let t = t.with_nanosecond(0).unwrap_or(t);
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Conditions a work item needs before it may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub required_network_type: NetworkType,
    pub requires_battery_not_low: bool,
    pub requires_charging: bool,
    pub requires_device_idle: bool,
    pub requires_storage_not_low: bool,
    pub time_window: Option<TimeWindow>,
}

impl Constraints {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_network(mut self, network: NetworkType) -> Self {
        self.required_network_type = network;
        self
    }

    pub fn with_battery_not_low(mut self) -> Self {
        self.requires_battery_not_low = true;
        self
    }

    pub fn with_charging(mut self) -> Self {
        self.requires_charging = true;
        self
    }

    pub fn with_device_idle(mut self) -> Self {
        self.requires_device_idle = true;
        self
    }

    pub fn with_storage_not_low(mut self) -> Self {
        self.requires_storage_not_low = true;
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }
}
