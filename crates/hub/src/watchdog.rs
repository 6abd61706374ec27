//! Staleness watchdog for the upstream telemetry feeds.
//!
//! ## Per-source state machine
//!
//! ```text
//! Unknown ──[snapshot]──▶ Ok ──[elapsed > warning]──▶ Warning ──[elapsed > critical]──▶ Critical
//!                          ▲                              │                                  │
//!                          └──────────[snapshot]──────────┴──────────────────────────────────┘
//! ```
//!
//! Severity only moves up on ticks; only a fresh snapshot brings a source
//! back to `Ok`.  Transport connectivity is tracked separately and never
//! folded into the freshness state.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Ordered by severity: `Ok < Warning < Critical`.  `Unknown` sorts lowest
/// and only exists before the first snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceState {
    Unknown,
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Climate feed (`sensorData`).
    Controller,
    /// Reservoir feed (`nutrientSensors`).
    Nutrient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warning: Duration,
    pub critical: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: Duration::from_secs(30),
            critical: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStatus {
    pub source_state: SourceState,
    pub transport_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_received_at: Option<OffsetDateTime>,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct Tracker {
    state: SourceState,
    last_received_at: Option<OffsetDateTime>,
    elapsed_ms: Option<u64>,
    /// Controller-reported broker link.  Assumed up until told otherwise.
    link_up: bool,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: SourceState::Unknown,
            last_received_at: None,
            elapsed_ms: None,
            link_up: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

pub struct Watchdog {
    thresholds: Thresholds,
    broker_connected: bool,
    trackers: BTreeMap<Source, Tracker>,
}

impl Watchdog {
    pub fn new(thresholds: Thresholds) -> Self {
        let trackers = [Source::Controller, Source::Nutrient]
            .into_iter()
            .map(|s| (s, Tracker::new()))
            .collect();
        Self {
            thresholds,
            broker_connected: false,
            trackers,
        }
    }

    /// Classify an elapsed time against the thresholds.
    pub fn classify(&self, elapsed_ms: u64) -> SourceState {
        let elapsed = Duration::from_millis(elapsed_ms);
        if elapsed > self.thresholds.critical {
            SourceState::Critical
        } else if elapsed > self.thresholds.warning {
            SourceState::Warning
        } else {
            SourceState::Ok
        }
    }

    /// A snapshot from `source` arrived at `now`.
    pub fn on_snapshot(&mut self, source: Source, now: OffsetDateTime) {
        let t = self.tracker_mut(source);
        let was = t.state;
        t.state = SourceState::Ok;
        t.last_received_at = Some(now);
        t.elapsed_ms = Some(0);
        if was > SourceState::Ok {
            info!(?source, from = ?was, "watchdog: feed recovered");
        }
    }

    /// Recompute elapsed time and severity for every source.  Returns the
    /// sources whose state escalated on this tick.
    pub fn on_tick(&mut self, now: OffsetDateTime) -> Vec<(Source, SourceState)> {
        let mut escalated = Vec::new();
        let sources: Vec<Source> = self.trackers.keys().copied().collect();

        for source in sources {
            let Some(last) = self.trackers[&source].last_received_at else {
                continue;
            };
            let elapsed_ms = (now - last).whole_milliseconds().max(0) as u64;
            let computed = self.classify(elapsed_ms);

            let t = self.tracker_mut(source);
            t.elapsed_ms = Some(elapsed_ms);
            let next = computed.max(t.state);
            if next > t.state {
                warn!(?source, elapsed_ms, state = ?next, "watchdog: feed stale");
                escalated.push((source, next));
            }
            t.state = next;
        }

        escalated
    }

    /// Whether `source` delivered within the warning threshold as of `now`.
    /// Computed from the clock, not the last tick, so it is exact between
    /// ticks too.
    pub fn is_fresh(&self, source: Source, now: OffsetDateTime) -> bool {
        let Some(last) = self.trackers.get(&source).and_then(|t| t.last_received_at) else {
            return false;
        };
        let elapsed_ms = (now - last).whole_milliseconds().max(0) as u64;
        self.classify(elapsed_ms) == SourceState::Ok
    }

    /// The hub's own broker connection.
    pub fn set_broker_connected(&mut self, connected: bool) {
        self.broker_connected = connected;
    }

    pub fn broker_connected(&self) -> bool {
        self.broker_connected
    }

    /// The controller's report of its own broker link.
    pub fn set_link(&mut self, source: Source, up: bool) {
        self.tracker_mut(source).link_up = up;
    }

    pub fn status(&self, source: Source) -> WatchdogStatus {
        let t = &self.trackers[&source];
        WatchdogStatus {
            source_state: t.state,
            transport_connected: self.broker_connected && t.link_up,
            last_received_at: t.last_received_at,
            elapsed_ms: t.elapsed_ms,
        }
    }

    pub fn report(&self) -> BTreeMap<Source, WatchdogStatus> {
        self.trackers
            .keys()
            .map(|&s| (s, self.status(s)))
            .collect()
    }

    fn tracker_mut(&mut self, source: Source) -> &mut Tracker {
        self.trackers.entry(source).or_insert_with(Tracker::new)
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
        datetime!(2026-10-18 12:00:00 UTC)
    }

    fn ms(n: i64) -> time::Duration {
        time::Duration::milliseconds(n)
    }

    #[test]
    fn starts_unknown() {
        let wd = Watchdog::new(Thresholds::default());
        let st = wd.status(Source::Controller);
        assert_eq!(st.source_state, SourceState::Unknown);
        assert_eq!(st.last_received_at, None);
        assert_eq!(st.elapsed_ms, None);
    }

    #[test]
    fn tick_before_any_snapshot_stays_unknown() {
        let mut wd = Watchdog::new(Thresholds::default());
        assert!(wd.on_tick(t0()).is_empty());
        assert_eq!(wd.status(Source::Controller).source_state, SourceState::Unknown);
    }

    #[test]
    fn freshness_follows_the_clock_between_ticks() {
        let mut wd = Watchdog::new(Thresholds::default());
        assert!(!wd.is_fresh(Source::Controller, t0()));

        wd.on_snapshot(Source::Controller, t0());
        assert!(wd.is_fresh(Source::Controller, t0() + ms(30_000)));
        // No tick has run, the state still reads Ok.
        assert!(!wd.is_fresh(Source::Controller, t0() + ms(30_001)));
        assert_eq!(wd.status(Source::Controller).source_state, SourceState::Ok);
        assert!(!wd.is_fresh(Source::Nutrient, t0()));
    }

    #[test]
    fn snapshot_moves_to_ok() {
        let mut wd = Watchdog::new(Thresholds::default());
        wd.on_snapshot(Source::Controller, t0());
        let st = wd.status(Source::Controller);
        assert_eq!(st.source_state, SourceState::Ok);
        assert_eq!(st.last_received_at, Some(t0()));
        assert_eq!(st.elapsed_ms, Some(0));
        // Other sources are untouched.
        assert_eq!(wd.status(Source::Nutrient).source_state, SourceState::Unknown);
    }

    #[test]
    fn escalates_ok_warning_critical() {
        let mut wd = Watchdog::new(Thresholds::default());
        wd.on_snapshot(Source::Controller, t0());

        let mut seen = Vec::new();
        for elapsed in [0, 40_000, 400_000] {
            wd.on_tick(t0() + ms(elapsed));
            let st = wd.status(Source::Controller);
            assert_eq!(st.elapsed_ms, Some(elapsed as u64));
            seen.push(st.source_state);
        }
        assert_eq!(
            seen,
            vec![SourceState::Ok, SourceState::Warning, SourceState::Critical]
        );
    }

    #[test]
    fn never_regresses_without_snapshot() {
        let mut wd = Watchdog::new(Thresholds::default());
        wd.on_snapshot(Source::Controller, t0());
        wd.on_tick(t0() + ms(400_000));
        assert_eq!(wd.status(Source::Controller).source_state, SourceState::Critical);

        // A tick that computes a smaller elapsed time (clock stepped back)
        // must not soften the state.
        wd.on_tick(t0() + ms(1_000));
        assert_eq!(wd.status(Source::Controller).source_state, SourceState::Critical);

        wd.on_snapshot(Source::Controller, t0() + ms(500_000));
        assert_eq!(wd.status(Source::Controller).source_state, SourceState::Ok);
    }

    #[test]
    fn tick_reports_only_escalations() {
        let mut wd = Watchdog::new(Thresholds::default());
        wd.on_snapshot(Source::Controller, t0());
        assert_eq!(
            wd.on_tick(t0() + ms(31_000)),
            vec![(Source::Controller, SourceState::Warning)]
        );
        assert!(wd.on_tick(t0() + ms(32_000)).is_empty());
    }

    #[test]
    fn thresholds_are_exclusive() {
        let wd = Watchdog::new(Thresholds::default());
        assert_eq!(wd.classify(30_000), SourceState::Ok);
        assert_eq!(wd.classify(30_001), SourceState::Warning);
        assert_eq!(wd.classify(300_000), SourceState::Warning);
        assert_eq!(wd.classify(300_001), SourceState::Critical);
    }

    #[test]
    fn transport_is_reported_independently_of_freshness() {
        let mut wd = Watchdog::new(Thresholds::default());
        assert!(!wd.status(Source::Controller).transport_connected);

        wd.set_broker_connected(true);
        let st = wd.status(Source::Controller);
        assert!(st.transport_connected);
        assert_eq!(st.source_state, SourceState::Unknown);

        wd.set_link(Source::Controller, false);
        assert!(!wd.status(Source::Controller).transport_connected);
        assert!(wd.status(Source::Nutrient).transport_connected);
    }

    #[test]
    fn status_serializes_uppercase_state() {
        let mut wd = Watchdog::new(Thresholds::default());
        wd.on_snapshot(Source::Controller, t0());
        let json = serde_json::to_value(wd.status(Source::Controller)).unwrap();
        assert_eq!(json["source_state"], "OK");
        assert_eq!(json["last_received_at"], "2026-10-18T12:00:00Z");
    }
}
