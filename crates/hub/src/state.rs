use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::advisor::{GrowthPhase, Recommendation};
use crate::config::OperationMode;
use crate::fusion::FusedConditions;
use crate::physics::DerivedQuantities;
use crate::rules::{Device, Switch, TriggeredAction};
use crate::snapshot::{NutrientReadings, RawSnapshot};
use crate::watchdog::{Source, WatchdogStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Published record
// ---------------------------------------------------------------------------

/// One consistent view of the chamber.  Readers always get a whole record;
/// the pipeline replaces it wholesale on every publish.
#[derive(Debug, Clone, Serialize)]
pub struct LiveState {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub mode: OperationMode,
    pub phase: GrowthPhase,
    pub broker_connected: bool,
    /// `None` until the first climate snapshot; distinct from "all zero".
    pub snapshot: Option<RawSnapshot>,
    pub fused: Option<FusedConditions>,
    pub derived: Option<DerivedQuantities>,
    pub nutrients: Option<NutrientReadings>,
    pub nutrient_status: Option<serde_json::Value>,
    pub watchdog: BTreeMap<Source, WatchdogStatus>,
    pub triggered: Vec<TriggeredAction>,
    pub recommendations: Vec<Recommendation>,
    pub devices: BTreeMap<Device, DeviceState>,
    /// Newest first.
    pub events: Vec<SystemEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub state: Switch,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Action,
    Alert,
    Watchdog,
    Error,
    System,
}

impl LiveState {
    pub fn new(mode: OperationMode, phase: GrowthPhase, now: OffsetDateTime) -> Self {
        Self {
            started_at: now,
            updated_at: now,
            mode,
            phase,
            broker_connected: false,
            snapshot: None,
            fused: None,
            derived: None,
            nutrients: None,
            nutrient_status: None,
            watchdog: BTreeMap::new(),
            triggered: Vec::new(),
            recommendations: Vec::new(),
            devices: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (self.updated_at - self.started_at).whole_seconds()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Process-wide holder of the latest [`LiveState`].
///
/// Publishing swaps the `Arc` behind a watch channel, so a reader holding a
/// previous record keeps a consistent copy and subscribers wake on change.
#[derive(Clone)]
pub struct LiveStateStore {
    tx: Arc<watch::Sender<Arc<LiveState>>>,
}

impl LiveStateStore {
    pub fn new(initial: LiveState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, state: LiveState) {
        self.tx.send_replace(Arc::new(state));
    }

    pub fn current(&self) -> Arc<LiveState> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<LiveState>> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Timestamped cell
// ---------------------------------------------------------------------------

/// Latest value of one data kind plus the newest source timestamp seen.
///
/// Stamps are in the producer's clock (unix ms).  Unstamped values are
/// accepted but never move the high-water mark, so the hub's own clock is
/// never compared against the producer's.
#[derive(Debug, Clone)]
pub struct Timestamped<T> {
    value: Option<T>,
    at: Option<i64>,
}

impl<T> Default for Timestamped<T> {
    fn default() -> Self {
        Self {
            value: None,
            at: None,
        }
    }
}

impl<T> Timestamped<T> {
    /// How far `at` lies behind the high-water mark, if it does.
    pub fn lag(&self, at: Option<i64>) -> Option<i64> {
        match (at, self.at) {
            (Some(at), Some(prev)) if at < prev => Some(prev - at),
            _ => None,
        }
    }

    /// Accept `value` unconditionally.  A stamped value moves the high-water
    /// mark to `at`, backwards included.
    pub fn reseed(&mut self, value: T, at: Option<i64>) {
        self.value = Some(value);
        if at.is_some() {
            self.at = at;
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    #[cfg(test)]
    pub fn at(&self) -> Option<i64> {
        self.at
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EventLog {
    events: VecDeque<SystemEvent>,
}

impl EventLog {
    pub fn push(&mut self, kind: EventKind, detail: String, ts: OffsetDateTime) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent { ts, kind, detail });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn t0() -> OffsetDateTime {
        datetime!(2026-10-18 12:00 UTC)
    }

    fn state() -> LiveState {
        LiveState::new(OperationMode::Monitor, GrowthPhase::Vegetative, t0())
    }

    #[test]
    fn initial_state_has_no_data() {
        let store = LiveStateStore::new(state());
        let cur = store.current();
        assert!(cur.snapshot.is_none());
        assert!(cur.fused.is_none());
        assert!(cur.derived.is_none());
        assert_eq!(cur.uptime_secs(), 0);
    }

    #[test]
    fn publish_replaces_whole_record() {
        let store = LiveStateStore::new(state());
        let before = store.current();

        let mut next = state();
        next.broker_connected = true;
        store.publish(next);

        // Old handle is untouched; new reads see the new record.
        assert!(!before.broker_connected);
        assert!(store.current().broker_connected);
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let store = LiveStateStore::new(state());
        let mut rx = store.subscribe();

        let mut next = state();
        next.phase = GrowthPhase::Flowering;
        store.publish(next);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().phase, GrowthPhase::Flowering);
    }

    #[test]
    fn lag_measures_only_older_stamps() {
        let mut cell = Timestamped::default();
        assert_eq!(cell.lag(Some(100)), None);
        cell.reseed("a", Some(100));
        assert_eq!(cell.lag(Some(99)), Some(1));
        assert_eq!(cell.lag(Some(100)), None);
        assert_eq!(cell.lag(Some(101)), None);
        assert_eq!(cell.get(), Some(&"a"));
    }

    #[test]
    fn unstamped_values_leave_the_high_water_mark() {
        let mut cell = Timestamped::default();
        cell.reseed("hub-clock", None);
        assert_eq!(cell.at(), None);
        cell.reseed("a", Some(5_000));
        cell.reseed("b", None);
        assert_eq!(cell.get(), Some(&"b"));
        assert_eq!(cell.at(), Some(5_000));
        assert_eq!(cell.lag(None), None);
    }

    #[test]
    fn reseed_moves_the_mark_backwards() {
        let mut cell = Timestamped::default();
        cell.reseed("future", Some(10_000));
        cell.reseed("now", Some(1_000));
        assert_eq!(cell.get(), Some(&"now"));
        assert_eq!(cell.at(), Some(1_000));
        assert_eq!(cell.lag(Some(1_001)), None);
    }

    #[test]
    fn event_log_is_bounded_and_newest_first() {
        let mut log = EventLog::default();
        for i in 0..(MAX_EVENTS + 5) {
            log.push(EventKind::Reading, format!("e{i}"), t0());
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_EVENTS);
        assert_eq!(recent[0].detail, format!("e{}", MAX_EVENTS + 4));
        assert_eq!(recent.last().unwrap().detail, "e5");
    }

    #[test]
    fn live_state_serializes() {
        let json = serde_json::to_value(state()).unwrap();
        assert_eq!(json["mode"], "monitor");
        assert_eq!(json["phase"], "vegetative");
        assert!(json["fused"].is_null());
        assert_eq!(json["started_at"], "2026-10-18T12:00:00Z");
    }
}
