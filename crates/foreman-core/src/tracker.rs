//! Constraint tracking.
//!
//! `WorkConstraintsTracker` は追跡中の WorkSpec の Constraints を現在の
//! [`DeviceState`] と時計に対して評価し、満たされた / 満たされなくなった ID を
//! listener に通知します。
//!
//! - `replace`: 追跡集合を置き換え、全件の met / not-met を通知
//! - `update_device_state` / `refresh`: 状態が変わった ID だけを通知
//! - 通知は状態 lock を解放してから行う
//! - 評価から通知までを配送 lock で直列化し、通知の順序を状態変化の順序と一致させる

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};

use crate::domain::{Constraints, NetworkType, WorkId, WorkSpec};
use crate::ports::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub metered: bool,
    pub roaming: bool,
}

/// Live device signals the constraints are evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub network: NetworkState,
    pub battery_low: bool,
    pub charging: bool,
    pub storage_low: bool,
    pub device_idle: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            network: NetworkState {
                connected: true,
                metered: false,
                roaming: false,
            },
            battery_low: false,
            charging: false,
            storage_low: false,
            device_idle: false,
        }
    }
}

impl DeviceState {
    fn network_satisfies(&self, required: NetworkType) -> bool {
        let n = &self.network;
        match required {
            NetworkType::NotRequired => true,
            NetworkType::Connected => n.connected,
            NetworkType::Unmetered => n.connected && !n.metered,
            NetworkType::NotRoaming => n.connected && !n.roaming,
            NetworkType::Metered => n.connected && n.metered,
        }
    }

    /// Are all of `constraints` satisfied right now?
    pub fn satisfies(&self, constraints: &Constraints, now: DateTime<Utc>) -> bool {
        self.network_satisfies(constraints.required_network_type)
            && (!constraints.requires_battery_not_low || !self.battery_low)
            && (!constraints.requires_charging || self.charging)
            && (!constraints.requires_device_idle || self.device_idle)
            && (!constraints.requires_storage_not_low || !self.storage_low)
            && constraints.time_window.is_none_or(|w| w.contains(now))
    }
}

/// Receives constraint transitions, one call at a time, in the order they happened.
///
/// Called without the tracker's state lock held; must not call back into the tracker.
pub trait ConstraintListener: Send + Sync {
    fn on_all_constraints_met(&self, ids: &[WorkId]);
    fn on_all_constraints_not_met(&self, ids: &[WorkId]);
}

struct Tracked {
    constraints: Constraints,
    met: bool,
}

struct TrackerState {
    device: DeviceState,
    tracked: BTreeMap<WorkId, Tracked>,
}

pub struct WorkConstraintsTracker {
    state: Mutex<TrackerState>,
    delivery: Mutex<()>,
    clock: Arc<dyn Clock>,
    listener: Weak<dyn ConstraintListener>,
}

impl WorkConstraintsTracker {
    pub fn new(
        device: DeviceState,
        clock: Arc<dyn Clock>,
        listener: Weak<dyn ConstraintListener>,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                device,
                tracked: BTreeMap::new(),
            }),
            delivery: Mutex::new(()),
            clock,
            listener,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the tracked set. Every tracked id is reported as met or not met.
    pub fn replace(&self, specs: &[WorkSpec]) {
        let _delivery = self.deliver();
        let now = self.clock.now();
        let (met, not_met) = {
            let mut state = self.lock();
            let device = state.device.clone();
            state.tracked = specs
                .iter()
                .map(|s| {
                    let tracked = Tracked {
                        met: device.satisfies(&s.constraints, now),
                        constraints: s.constraints.clone(),
                    };
                    (s.id, tracked)
                })
                .collect();
            partition(&state.tracked)
        };
        tracing::debug!(met = met.len(), not_met = not_met.len(), "constraint tracking replaced");
        self.notify(&met, &not_met);
    }

    pub fn device_state(&self) -> DeviceState {
        self.lock().device.clone()
    }

    /// Change device signals and report the ids whose outcome flipped.
    pub fn update_device_state(&self, update: impl FnOnce(&mut DeviceState)) {
        let _delivery = self.deliver();
        let (met, not_met) = {
            let mut state = self.lock();
            update(&mut state.device);
            self.reevaluate(&mut state)
        };
        self.notify(&met, &not_met);
    }

    /// Re-evaluate time-dependent constraints against the clock.
    pub fn refresh(&self) {
        let _delivery = self.deliver();
        let (met, not_met) = {
            let mut state = self.lock();
            self.reevaluate(&mut state)
        };
        self.notify(&met, &not_met);
    }

    pub fn is_met(&self, id: &WorkId) -> Option<bool> {
        self.lock().tracked.get(id).map(|t| t.met)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracked.len()
    }

    fn reevaluate(&self, state: &mut TrackerState) -> (Vec<WorkId>, Vec<WorkId>) {
        let now = self.clock.now();
        let device = state.device.clone();
        let mut met = Vec::new();
        let mut not_met = Vec::new();
        for (id, tracked) in state.tracked.iter_mut() {
            let now_met = device.satisfies(&tracked.constraints, now);
            if now_met != tracked.met {
                tracked.met = now_met;
                if now_met {
                    met.push(*id);
                } else {
                    not_met.push(*id);
                }
            }
        }
        (met, not_met)
    }

    fn notify(&self, met: &[WorkId], not_met: &[WorkId]) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        if !met.is_empty() {
            listener.on_all_constraints_met(met);
        }
        if !not_met.is_empty() {
            listener.on_all_constraints_not_met(not_met);
        }
    }
}

fn partition(tracked: &BTreeMap<WorkId, Tracked>) -> (Vec<WorkId>, Vec<WorkId>) {
    let mut met = Vec::new();
    let mut not_met = Vec::new();
    for (id, t) in tracked {
        if t.met {
            met.push(*id);
        } else {
            not_met.push(*id);
        }
    }
    (met, not_met)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::tests::{sample_spec, t0};
    use crate::domain::TimeWindow;
    use crate::ports::ManualClock;
    use chrono::NaiveTime;
    use rstest::rstest;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        met: Mutex<Vec<WorkId>>,
        not_met: Mutex<Vec<WorkId>>,
    }

    impl ConstraintListener for Recorder {
        fn on_all_constraints_met(&self, ids: &[WorkId]) {
            self.met.lock().unwrap().extend_from_slice(ids);
        }
        fn on_all_constraints_not_met(&self, ids: &[WorkId]) {
            self.not_met.lock().unwrap().extend_from_slice(ids);
        }
    }

    impl Recorder {
        fn take(&self) -> (Vec<WorkId>, Vec<WorkId>) {
            (
                std::mem::take(&mut *self.met.lock().unwrap()),
                std::mem::take(&mut *self.not_met.lock().unwrap()),
            )
        }
    }

    fn setup(device: DeviceState) -> (Arc<Recorder>, Arc<ManualClock>, WorkConstraintsTracker) {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let weak: Weak<dyn ConstraintListener> = Arc::downgrade(&recorder) as Weak<Recorder>;
        let tracker = WorkConstraintsTracker::new(device, clock.clone(), weak);
        (recorder, clock, tracker)
    }

    fn spec_with(constraints: Constraints) -> WorkSpec {
        let mut spec = sample_spec();
        spec.constraints = constraints;
        spec
    }

    #[rstest]
    #[case::not_required(NetworkType::NotRequired, false, false, false, true)]
    #[case::connected_offline(NetworkType::Connected, false, false, false, false)]
    #[case::connected(NetworkType::Connected, true, true, true, true)]
    #[case::unmetered_on_metered(NetworkType::Unmetered, true, true, false, false)]
    #[case::unmetered(NetworkType::Unmetered, true, false, false, true)]
    #[case::not_roaming_while_roaming(NetworkType::NotRoaming, true, false, true, false)]
    #[case::metered(NetworkType::Metered, true, true, false, true)]
    #[case::metered_on_wifi(NetworkType::Metered, true, false, false, false)]
    fn network_rules(
        #[case] required: NetworkType,
        #[case] connected: bool,
        #[case] metered: bool,
        #[case] roaming: bool,
        #[case] expected: bool,
    ) {
        let device = DeviceState {
            network: NetworkState {
                connected,
                metered,
                roaming,
            },
            ..DeviceState::default()
        };
        let c = Constraints::none().with_network(required);
        assert_eq!(device.satisfies(&c, t0()), expected);
    }

    #[test]
    fn device_flags() {
        let c = Constraints::none()
            .with_charging()
            .with_battery_not_low()
            .with_storage_not_low()
            .with_device_idle();
        let mut device = DeviceState::default();
        assert!(!device.satisfies(&c, t0()));

        device.charging = true;
        device.device_idle = true;
        assert!(device.satisfies(&c, t0()));

        device.storage_low = true;
        assert!(!device.satisfies(&c, t0()));
    }

    #[test]
    fn replace_reports_every_tracked_id() {
        let (recorder, _clock, tracker) = setup(DeviceState::default());
        let a = spec_with(Constraints::none().with_network(NetworkType::Connected));
        let b = spec_with(Constraints::none().with_charging());

        tracker.replace(&[a.clone(), b.clone()]);

        let (met, not_met) = recorder.take();
        assert_eq!(met, vec![a.id]);
        assert_eq!(not_met, vec![b.id]);
        assert_eq!(tracker.tracked_count(), 2);
    }

    #[test]
    fn device_update_reports_only_transitions() {
        let (recorder, _clock, tracker) = setup(DeviceState::default());
        let a = spec_with(Constraints::none().with_network(NetworkType::Connected));
        let b = spec_with(Constraints::none().with_charging());
        tracker.replace(&[a.clone(), b.clone()]);
        recorder.take();

        tracker.update_device_state(|d| d.charging = true);
        assert_eq!(recorder.take(), (vec![b.id], vec![]));

        tracker.update_device_state(|d| d.network.connected = false);
        assert_eq!(recorder.take(), (vec![], vec![a.id]));

        // no change, no callback
        tracker.update_device_state(|d| d.charging = true);
        assert_eq!(recorder.take(), (vec![], vec![]));
    }

    #[test]
    fn refresh_follows_time_window() {
        let (recorder, clock, tracker) = setup(DeviceState::default());
        let window = TimeWindow::new(
            NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        );
        let a = spec_with(Constraints::none().with_time_window(window));

        // t0 is midnight
        tracker.replace(&[a.clone()]);
        assert_eq!(recorder.take(), (vec![], vec![a.id]));

        clock.advance(Duration::from_secs(3600));
        tracker.refresh();
        assert_eq!(recorder.take(), (vec![a.id], vec![]));

        clock.advance(Duration::from_secs(3600));
        tracker.refresh();
        assert_eq!(recorder.take(), (vec![], vec![a.id]));
    }

    #[test]
    fn replace_with_nothing_stops_tracking() {
        let (recorder, _clock, tracker) = setup(DeviceState::default());
        tracker.replace(&[spec_with(Constraints::none().with_charging())]);
        recorder.take();

        tracker.replace(&[]);
        assert_eq!(tracker.tracked_count(), 0);

        tracker.update_device_state(|d| d.charging = true);
        assert_eq!(recorder.take(), (vec![], vec![]));
    }

    /// Remembers only the last outcome delivered for each id.
    #[derive(Default)]
    struct LastOutcome {
        last: Mutex<BTreeMap<WorkId, bool>>,
    }

    impl ConstraintListener for LastOutcome {
        fn on_all_constraints_met(&self, ids: &[WorkId]) {
            let mut last = self.last.lock().unwrap();
            for id in ids {
                last.insert(*id, true);
            }
        }
        fn on_all_constraints_not_met(&self, ids: &[WorkId]) {
            let mut last = self.last.lock().unwrap();
            for id in ids {
                last.insert(*id, false);
            }
        }
    }

    #[test]
    fn concurrent_updates_deliver_in_order() {
        let listener = Arc::new(LastOutcome::default());
        let weak: Weak<dyn ConstraintListener> = Arc::downgrade(&listener) as Weak<LastOutcome>;
        let tracker = WorkConstraintsTracker::new(
            DeviceState::default(),
            Arc::new(ManualClock::new(t0())),
            weak,
        );
        let spec = spec_with(Constraints::none().with_charging());
        tracker.replace(std::slice::from_ref(&spec));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for round in 0..500 {
                        tracker.update_device_state(|d| d.charging = (worker + round) % 2 == 0);
                    }
                });
            }
        });

        let delivered = listener.last.lock().unwrap().get(&spec.id).copied();
        assert_eq!(delivered, tracker.is_met(&spec.id));
    }

    #[test]
    fn dropped_listener_is_ignored() {
        let (recorder, _clock, tracker) = setup(DeviceState::default());
        drop(recorder);
        tracker.replace(&[spec_with(Constraints::none().with_charging())]);
        assert_eq!(tracker.is_met(&WorkId::generate()), None);
    }
}
