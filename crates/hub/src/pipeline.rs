//! The single writer of [`LiveState`].
//!
//! Every inbound event and every watchdog tick runs to completion here
//! before the next one is taken off the channel:
//!
//! ```text
//! sensorData ─▶ order check ─▶ watchdog ─▶ fuse ─▶ derive ─┐
//! nutrientSensors ─▶ order check ─▶ watchdog ──────────────┤
//! tick ─▶ watchdog ────────────────────────────────────────┤
//!                                                          ▼
//!                         evaluate rules ─▶ advise ─▶ dispatch ─▶ publish
//! ```
//!
//! Rules only see a feed while it is fresh: once the watchdog would call it
//! stale, its metrics read as missing and nothing fires on old data.
//!
//! Status events (link reports, alerts, action results) update the record
//! and publish without re-running evaluation.

use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

use crate::advisor::{self, GrowthPhase};
use crate::config::Config;
use crate::executor::{Executor, Outcome};
use crate::fusion::{self, FusedConditions, SoilCalibration};
use crate::mqtt::{ActionResult, HubEvent, Inbound};
use crate::physics;
use crate::rules::{self, Readings, SharedRules, TriggeredAction};
use crate::snapshot::{AlertMsg, NutrientReadings, RawSnapshot};
use crate::state::{DeviceState, EventKind, EventLog, LiveState, LiveStateStore, Timestamped};
use crate::watchdog::{Source, Watchdog};

/// Backward step in a producer timestamp beyond which its clock is taken to
/// have been reset rather than messages reordered.
const CLOCK_STEP_MS: i64 = 60_000;

/// What to do with a snapshot given where its stamp lies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Accept,
    /// Behind the high-water mark but the feed is stale or the step too big
    /// to be reordering: take it and restart the mark from here.
    Resync { behind_ms: i64 },
    Discard { behind_ms: i64 },
}

fn admission(lag: Option<i64>, feed_fresh: bool) -> Admission {
    match lag {
        None => Admission::Accept,
        Some(behind_ms) if !feed_fresh || behind_ms > CLOCK_STEP_MS => {
            Admission::Resync { behind_ms }
        }
        Some(behind_ms) => Admission::Discard { behind_ms },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) phase: GrowthPhase,
    pub(crate) photoperiod_hours: f64,
    pub(crate) soil: SoilCalibration,
    pub(crate) utc_offset: UtcOffset,
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Self {
            phase: cfg.hub.phase,
            photoperiod_hours: cfg.hub.photoperiod_hours,
            soil: cfg.soil,
            utc_offset: cfg.hub.utc_offset(),
        }
    }
}

pub(crate) struct Pipeline {
    settings: Settings,
    rules: SharedRules,
    store: LiveStateStore,
    executor: Executor,
    watchdog: Watchdog,
    climate: Timestamped<RawSnapshot>,
    nutrients: Timestamped<NutrientReadings>,
    /// Last fusion result; carries soil and light forward when a snapshot
    /// omits them.
    fused: FusedConditions,
    live: LiveState,
    events: EventLog,
}

impl Pipeline {
    pub(crate) fn new(
        settings: Settings,
        rules: SharedRules,
        store: LiveStateStore,
        executor: Executor,
        watchdog: Watchdog,
        now: OffsetDateTime,
    ) -> Self {
        let live = LiveState::new(executor.mode(), settings.phase, now);
        let mut pipeline = Self {
            settings,
            rules,
            store,
            executor,
            watchdog,
            climate: Timestamped::default(),
            nutrients: Timestamped::default(),
            fused: FusedConditions::default(),
            live,
            events: EventLog::default(),
        };
        pipeline.events.push(
            EventKind::System,
            format!("hub started ({:?} mode)", pipeline.live.mode).to_lowercase(),
            now,
        );
        pipeline.publish(now);
        pipeline
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    pub(crate) async fn handle(&mut self, event: HubEvent, now: OffsetDateTime) {
        match event {
            HubEvent::Inbound(inbound) => self.apply(inbound, now).await,
            HubEvent::Broker { connected } => {
                self.set_broker_connected(connected, now);
                self.publish(now);
            }
            HubEvent::Malformed { topic, error } => {
                self.events
                    .push(EventKind::Error, format!("malformed {topic}: {error}"), now);
                self.publish(now);
            }
        }
    }

    pub(crate) async fn apply(&mut self, inbound: Inbound, now: OffsetDateTime) {
        match inbound {
            Inbound::SensorData(raw) => {
                if self.accept_climate(raw, now) {
                    self.cycle(now).await;
                }
            }
            Inbound::NutrientSensors(readings) => {
                if self.accept_nutrients(readings, now) {
                    self.cycle(now).await;
                }
            }
            Inbound::NutrientStatus(status) => {
                self.live.nutrient_status = Some(status);
                self.publish(now);
            }
            Inbound::WatchdogStatus(link) => {
                self.set_controller_link(link.mqtt_connected, now);
                self.publish(now);
            }
            Inbound::Alert(alert) => {
                self.record_alert(alert, now);
                self.publish(now);
            }
            Inbound::ActionResult(result) => {
                self.record_result(result, now).await;
                self.publish(now);
            }
        }
    }

    /// Periodic watchdog tick.  Re-evaluates so that time windows open and
    /// close without waiting for the next snapshot.
    pub(crate) async fn tick(&mut self, now: OffsetDateTime) {
        for (source, state) in self.watchdog.on_tick(now) {
            let elapsed = self.watchdog.status(source).elapsed_ms.unwrap_or(0) / 1000;
            self.events.push(
                EventKind::Watchdog,
                format!("{source:?} feed {state:?}: no data for {elapsed}s").to_lowercase(),
                now,
            );
        }
        self.cycle(now).await;
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Log the admission decision for a `feed` snapshot.  Returns whether it
    /// is taken.
    fn admit(
        &mut self,
        feed: &str,
        ts: Option<i64>,
        decision: Admission,
        now: OffsetDateTime,
    ) -> bool {
        let ts = ts.unwrap_or_default();
        match decision {
            Admission::Accept => true,
            Admission::Resync { behind_ms } => {
                warn!(feed, ts, behind_ms, "producer clock stepped back; resyncing");
                self.events.push(
                    EventKind::Reading,
                    format!("{feed} clock resync: ts {ts} is {behind_ms}ms behind"),
                    now,
                );
                true
            }
            Admission::Discard { behind_ms } => {
                debug!(feed, ts, behind_ms, "discarding out-of-order snapshot");
                self.events.push(
                    EventKind::Reading,
                    format!("discarded out-of-order {feed} (ts {ts})"),
                    now,
                );
                false
            }
        }
    }

    fn accept_climate(&mut self, raw: RawSnapshot, now: OffsetDateTime) -> bool {
        let ts = raw.ts;
        let fresh = self.watchdog.is_fresh(Source::Controller, now);
        let decision = admission(self.climate.lag(ts), fresh);
        if !self.admit("sensorData", ts, decision, now) {
            return false;
        }
        let first = self.climate.get().is_none();
        self.climate.reseed(raw, ts);
        self.watchdog.on_snapshot(Source::Controller, now);

        let Some(raw) = self.climate.get() else {
            return false;
        };
        let fused = fusion::fuse(raw, &self.fused, &self.settings.soil);
        let derived = physics::derive(&fused, self.settings.photoperiod_hours);

        if first {
            self.events
                .push(EventKind::Reading, "first sensorData received".to_string(), now);
        }
        if fused.is_valid != self.fused.is_valid || first {
            let detail = if fused.is_valid {
                "climate readings valid"
            } else {
                "climate readings invalid: temperature or humidity missing"
            };
            if !fused.is_valid {
                warn!("{detail}");
            }
            self.events.push(EventKind::Reading, detail.to_string(), now);
        }

        self.live.snapshot = Some(raw.clone());
        self.live.fused = Some(fused.clone());
        self.live.derived = derived;
        self.fused = fused;
        true
    }

    fn accept_nutrients(&mut self, readings: NutrientReadings, now: OffsetDateTime) -> bool {
        let ts = readings.ts;
        let fresh = self.watchdog.is_fresh(Source::Nutrient, now);
        let decision = admission(self.nutrients.lag(ts), fresh);
        if !self.admit("nutrientSensors", ts, decision, now) {
            return false;
        }
        self.nutrients.reseed(readings, ts);
        self.watchdog.on_snapshot(Source::Nutrient, now);
        self.live.nutrients = self.nutrients.get().cloned();
        true
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    async fn cycle(&mut self, now: OffsetDateTime) {
        let local = now.to_offset(self.settings.utc_offset).time();
        let climate_fresh = self.watchdog.is_fresh(Source::Controller, now);
        let nutrients_fresh = self.watchdog.is_fresh(Source::Nutrient, now);
        let triggered: Vec<TriggeredAction> = {
            let book = self.rules.read().await;
            let readings = if climate_fresh {
                Readings {
                    fused: self.live.fused.as_ref(),
                    derived: self.live.derived.as_ref(),
                    raw: self.climate.get(),
                    nutrients: None,
                }
            } else {
                Readings::default()
            };
            let readings = Readings {
                nutrients: self.nutrients.get().filter(|_| nutrients_fresh),
                ..readings
            };
            rules::evaluate(book.rules(), &readings, local)
        };

        // No advice before the first climate snapshot.
        self.live.recommendations = match &self.live.fused {
            Some(fused) => {
                advisor::generate(fused, self.live.derived.as_ref(), self.settings.phase)
            }
            None => Vec::new(),
        };

        for (rule_id, message) in self.executor.notifications(&triggered) {
            self.events
                .push(EventKind::Alert, format!("{rule_id}: {message}"), now);
        }
        for d in self.executor.dispatch(&triggered).await {
            let c = &d.command;
            let what = format!("{}: {} {}", c.rule_id, c.device.as_str(), c.state.as_str());
            let (kind, detail) = match d.outcome {
                Outcome::Sent => (EventKind::Action, format!("{what} sent")),
                Outcome::Logged => (EventKind::Action, format!("{what} (monitor, not sent)")),
                Outcome::Failed(e) => (EventKind::Error, format!("{what} not sent: {e}")),
            };
            self.events.push(kind, detail, now);
        }

        self.live.triggered = triggered;
        self.publish(now);
    }

    // -----------------------------------------------------------------------
    // Status events
    // -----------------------------------------------------------------------

    fn set_broker_connected(&mut self, connected: bool, now: OffsetDateTime) {
        if self.watchdog.broker_connected() == connected {
            return;
        }
        self.watchdog.set_broker_connected(connected);
        self.live.broker_connected = connected;
        let detail = if connected {
            "broker connected"
        } else {
            "broker disconnected"
        };
        self.events.push(EventKind::System, detail.to_string(), now);
    }

    fn set_controller_link(&mut self, up: bool, now: OffsetDateTime) {
        let was = self.watchdog.status(Source::Controller).transport_connected;
        // Both feeds ride the controller's connection.
        self.watchdog.set_link(Source::Controller, up);
        self.watchdog.set_link(Source::Nutrient, up);
        if was != self.watchdog.status(Source::Controller).transport_connected {
            let detail = if up {
                "controller reports broker link up"
            } else {
                "controller reports broker link down"
            };
            self.events.push(EventKind::Watchdog, detail.to_string(), now);
        }
    }

    fn record_alert(&mut self, alert: AlertMsg, now: OffsetDateTime) {
        let severity = alert.severity.as_deref().unwrap_or("info");
        warn!(severity, "controller alert: {}", alert.message);
        self.events
            .push(EventKind::Alert, format!("[{severity}] {}", alert.message), now);
    }

    async fn record_result(&mut self, result: ActionResult, now: OffsetDateTime) {
        if !result.ok {
            let error = result.error.as_deref().unwrap_or("unknown error");
            warn!(rule = %result.rule_id, device = ?result.device, "action failed: {error}");
            if let Some(device) = result.device {
                self.executor.forget(device);
            }
            self.events.push(
                EventKind::Error,
                format!("{}: action failed: {error}", result.rule_id),
                now,
            );
            return;
        }

        let known = self.rules.write().await.record_execution(&result.rule_id, now);
        if !known {
            debug!(rule = %result.rule_id, "action result for unknown rule");
        }

        if let (Some(device), Some(state)) = (result.device, result.state) {
            self.executor.confirm(device, state);
            self.live.devices.insert(
                device,
                DeviceState {
                    state,
                    confirmed_at: now,
                },
            );
        }
        info!(rule = %result.rule_id, device = ?result.device, "action confirmed");
        self.events.push(
            EventKind::Action,
            format!("{}: confirmed by controller", result.rule_id),
            now,
        );
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    fn publish(&mut self, now: OffsetDateTime) {
        self.live.updated_at = now;
        self.live.watchdog = self.watchdog.report();
        self.live.events = self.events.recent();
        self.store.publish(self.live.clone());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
