//! Automation rules: typed condition → action mappings evaluated against the
//! fused and derived state on every cycle.
//!
//! Rules arrive as loosely typed [`RuleEntry`] records (config file or HTTP
//! API) and are compiled into [`AutomationRule`]s once, at load time.  An
//! entry that names an unknown metric, operator or device fails compilation
//! and never reaches the evaluator.
//!
//! Evaluation is read-only: it returns [`TriggeredAction`]s and leaves
//! `execution_count` / `last_executed` alone.  Those move only when the
//! controller reports a successful execution back through
//! [`RuleBook::record_execution`].

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};
use tokio::sync::RwLock;
use tracing::warn;

use crate::fusion::FusedConditions;
use crate::physics::DerivedQuantities;
use crate::snapshot::{NutrientReadings, RawSnapshot};

pub const MAX_PRIORITY: u8 = 100;
pub const MAX_CONDITIONS: usize = 16;
pub const MAX_ACTIONS: usize = 8;

/// Tolerance for `==` / `!=` on floating-point readings.
const EQ_EPSILON: f64 = 1e-6;

pub type SharedRules = Arc<RwLock<RuleBook>>;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    SoilMoisture,
    Light,
    Vpd,
    DewPoint,
    Dli,
    TankLevel,
    GasLevel,
    Ec,
    Ph,
    WaterTemperature,
    ReservoirLevel,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soil_moisture",
            Self::Light => "light",
            Self::Vpd => "vpd",
            Self::DewPoint => "dew_point",
            Self::Dli => "dli",
            Self::TankLevel => "tank_level",
            Self::GasLevel => "gas_level",
            Self::Ec => "ec",
            Self::Ph => "ph",
            Self::WaterTemperature => "water_temperature",
            Self::ReservoirLevel => "reservoir_level",
        }
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "temperature" | "temp" => Self::Temperature,
            "humidity" => Self::Humidity,
            "soil_moisture" | "soilMoisture" => Self::SoilMoisture,
            "light" | "lux" => Self::Light,
            "vpd" => Self::Vpd,
            "dew_point" | "dewPoint" => Self::DewPoint,
            "dli" => Self::Dli,
            "tank_level" | "tankLevel" => Self::TankLevel,
            "gas_level" | "gasLevel" => Self::GasLevel,
            "ec" => Self::Ec,
            "ph" => Self::Ph,
            "water_temperature" | "waterTemp" => Self::WaterTemperature,
            "reservoir_level" | "reservoirLevel" => Self::ReservoirLevel,
            other => bail!("unknown metric '{other}'"),
        })
    }
}

/// Everything a condition can look at during one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readings<'a> {
    pub fused: Option<&'a FusedConditions>,
    pub derived: Option<&'a DerivedQuantities>,
    pub raw: Option<&'a RawSnapshot>,
    pub nutrients: Option<&'a NutrientReadings>,
}

impl Readings<'_> {
    /// Current value of `metric`, or `None` when it is missing.
    ///
    /// Raw climate metrics stand on their own: a temperature reading counts
    /// even while the record is invalid for lack of humidity.  Physics
    /// metrics (`vpd`, `dew_point`, `dli`) only exist for a valid record.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        let v = match metric {
            Metric::Temperature => self.fused?.temperature,
            Metric::Humidity => self.fused?.humidity,
            Metric::SoilMoisture => self.fused?.mean_soil_moisture(),
            Metric::Light => self.fused?.light_lux,
            Metric::Vpd => self.derived.map(|d| d.vpd_kpa),
            Metric::DewPoint => self.derived.map(|d| d.dew_point_c),
            Metric::Dli => self.derived?.dli_mol_m2_day,
            Metric::TankLevel => self.raw?.tank_level,
            Metric::GasLevel => self.raw?.gas_level,
            Metric::Ec => self.nutrients?.ec,
            Metric::Ph => self.nutrients?.ph,
            Metric::WaterTemperature => self.nutrients?.water_temp,
            Metric::ReservoirLevel => self.nutrients?.reservoir_level_percent,
        };
        v.filter(|x| x.is_finite())
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Eq => (value - threshold).abs() < EQ_EPSILON,
            Self::Ne => (value - threshold).abs() >= EQ_EPSILON,
        }
    }
}

impl FromStr for Operator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "<" | "lt" => Self::Lt,
            "<=" | "lte" => Self::Le,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" => Self::Ge,
            "==" | "=" | "eq" => Self::Eq,
            "!=" | "ne" => Self::Ne,
            other => bail!("unknown operator '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub metric: Metric,
    pub operator: Operator,
    pub threshold: f64,
    /// How this condition combines with the next one.  Falls back to the
    /// rule's `logic`.
    pub link: Option<Logic>,
}

impl Condition {
    /// A missing metric satisfies nothing, `!=` included.
    pub fn is_met(&self, readings: &Readings<'_>) -> bool {
        readings
            .value(self.metric)
            .is_some_and(|v| self.operator.apply(v, self.threshold))
    }
}

/// Local time-of-day window.  `start > end` wraps midnight; `start == end`
/// covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    #[serde(serialize_with = "ser_hhmm")]
    pub start: Time,
    #[serde(serialize_with = "ser_hhmm")]
    pub end: Time,
}

impl TimeWindow {
    pub fn contains(&self, t: Time) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

fn ser_hhmm<S: serde::Serializer>(t: &Time, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:02}:{:02}", t.hour(), t.minute()))
}

fn parse_hhmm(s: &str) -> Result<Time> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow!("time '{s}' is not HH:MM"))?;
    let h: u8 = h.parse().with_context(|| format!("bad hour in '{s}'"))?;
    let m: u8 = m.parse().with_context(|| format!("bad minute in '{s}'"))?;
    Time::from_hms(h, m, 0).with_context(|| format!("time '{s}' out of range"))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    ExhaustFan,
    CirculationFan,
    Humidifier,
    Dehumidifier,
    Heater,
    Light,
    WaterPump,
    NutrientPump,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExhaustFan => "exhaust_fan",
            Self::CirculationFan => "circulation_fan",
            Self::Humidifier => "humidifier",
            Self::Dehumidifier => "dehumidifier",
            Self::Heater => "heater",
            Self::Light => "light",
            Self::WaterPump => "water_pump",
            Self::NutrientPump => "nutrient_pump",
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "exhaust_fan" | "exhaustFan" | "fan" => Self::ExhaustFan,
            "circulation_fan" | "circulationFan" => Self::CirculationFan,
            "humidifier" => Self::Humidifier,
            "dehumidifier" => Self::Dehumidifier,
            "heater" => Self::Heater,
            "light" | "lights" => Self::Light,
            "water_pump" | "waterPump" | "pump" => Self::WaterPump,
            "nutrient_pump" | "nutrientPump" => Self::NutrientPump,
            other => bail!("unknown device '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl FromStr for Switch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => bail!("unknown device state '{other}' (use on/off)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Device { device: Device, state: Switch },
    Notify { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredAction {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: u8,
    pub action: Action,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: u8,
    pub logic: Logic,
    pub window: Option<TimeWindow>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_executed: Option<OffsetDateTime>,
    pub execution_count: u64,
}

impl AutomationRule {
    /// Fold the conditions left to right, short-circuiting on each link.
    pub fn is_satisfied(&self, readings: &Readings<'_>) -> bool {
        let mut iter = self.conditions.iter();
        let Some(first) = iter.next() else {
            return false;
        };
        let mut acc = first.is_met(readings);
        let mut link = first.link.unwrap_or(self.logic);
        for cond in iter {
            acc = match link {
                Logic::And => acc && cond.is_met(readings),
                Logic::Or => acc || cond.is_met(readings),
            };
            link = cond.link.unwrap_or(self.logic);
        }
        acc
    }

    pub fn is_active_at(&self, local_time: Time) -> bool {
        self.window.map_or(true, |w| w.contains(local_time))
    }
}

/// Evaluate `rules` against one cycle's readings.
///
/// Disabled rules are skipped, the rest run in descending priority with
/// ties kept in list order, and each satisfied rule contributes its actions
/// in their configured order.
pub fn evaluate(
    rules: &[AutomationRule],
    readings: &Readings<'_>,
    local_time: Time,
) -> Vec<TriggeredAction> {
    let mut active: Vec<&AutomationRule> = rules.iter().filter(|r| r.enabled).collect();
    // sort_by is stable, so equal priorities keep insertion order.
    active.sort_by(|a, b| b.priority.cmp(&a.priority));

    active
        .into_iter()
        .filter(|r| r.is_active_at(local_time) && r.is_satisfied(readings))
        .flat_map(|r| {
            r.actions.iter().map(move |a| TriggeredAction {
                rule_id: r.id.clone(),
                rule_name: r.name.clone(),
                priority: r.priority,
                action: a.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Loosely typed input
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub logic: Option<String>,
    #[serde(default)]
    pub window: Option<WindowEntry>,
    #[serde(default)]
    pub conditions: Vec<ConditionEntry>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConditionEntry {
    pub metric: String,
    pub operator: String,
    pub threshold: f64,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowEntry {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn parse_logic(s: &str) -> Result<Logic> {
    match s.trim().to_ascii_lowercase().as_str() {
        "and" => Ok(Logic::And),
        "or" => Ok(Logic::Or),
        other => bail!("unknown logic '{other}' (use and/or)"),
    }
}

impl ConditionEntry {
    fn compile(&self) -> Result<Condition> {
        ensure!(self.threshold.is_finite(), "threshold must be finite");
        Ok(Condition {
            metric: self.metric.parse()?,
            operator: self.operator.parse()?,
            threshold: self.threshold,
            link: self.link.as_deref().map(parse_logic).transpose()?,
        })
    }
}

impl ActionEntry {
    fn compile(&self) -> Result<Action> {
        match self.kind.trim() {
            "device" | "device_control" => {
                let device = self
                    .device
                    .as_deref()
                    .ok_or_else(|| anyhow!("device action without 'device'"))?
                    .parse()?;
                let state = self
                    .state
                    .as_deref()
                    .ok_or_else(|| anyhow!("device action without 'state'"))?
                    .parse()?;
                Ok(Action::Device { device, state })
            }
            "notify" | "notification" => {
                let message = self
                    .message
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| anyhow!("notify action without 'message'"))?;
                Ok(Action::Notify {
                    message: message.to_string(),
                })
            }
            other => bail!("unknown action type '{other}'"),
        }
    }
}

impl RuleEntry {
    /// Compile into a typed rule.  Every failure names the offending part.
    pub fn compile(&self) -> Result<AutomationRule> {
        ensure!(!self.id.trim().is_empty(), "rule id is empty");
        ensure!(
            (0..=MAX_PRIORITY as i64).contains(&self.priority),
            "priority {} out of range [0, {MAX_PRIORITY}]",
            self.priority
        );
        ensure!(!self.conditions.is_empty(), "rule has no conditions");
        ensure!(
            self.conditions.len() <= MAX_CONDITIONS,
            "rule has {} conditions (max {MAX_CONDITIONS})",
            self.conditions.len()
        );
        ensure!(!self.actions.is_empty(), "rule has no actions");
        ensure!(
            self.actions.len() <= MAX_ACTIONS,
            "rule has {} actions (max {MAX_ACTIONS})",
            self.actions.len()
        );

        let logic = self.logic.as_deref().map(parse_logic).transpose()?.unwrap_or_default();

        let window = match &self.window {
            Some(w) => Some(TimeWindow {
                start: parse_hhmm(&w.start).context("window start")?,
                end: parse_hhmm(&w.end).context("window end")?,
            }),
            None => None,
        };

        let conditions = self
            .conditions
            .iter()
            .enumerate()
            .map(|(i, c)| c.compile().with_context(|| format!("conditions[{i}]")))
            .collect::<Result<Vec<_>>>()?;

        let actions = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| a.compile().with_context(|| format!("actions[{i}]")))
            .collect::<Result<Vec<_>>>()?;

        Ok(AutomationRule {
            id: self.id.trim().to_string(),
            name: self.name.clone(),
            enabled: self.enabled,
            priority: self.priority as u8,
            logic,
            window,
            conditions,
            actions,
            last_executed: None,
            execution_count: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Rule book
// ---------------------------------------------------------------------------

/// Ordered, in-memory rule set plus execution bookkeeping.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: Vec<AutomationRule>,
}

impl RuleBook {
    /// Compile every entry, keeping the ones that compile.  Each rejected
    /// entry is logged once here and then dropped for good.
    pub fn from_entries(entries: &[RuleEntry]) -> Self {
        let mut book = Self::default();
        for entry in entries {
            match entry.compile() {
                Ok(rule) => {
                    book.upsert(rule);
                }
                Err(e) => {
                    warn!(rule = %entry.id, "skipping malformed rule: {e:#}");
                }
            }
        }
        book
    }

    pub fn rules(&self) -> &[AutomationRule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&AutomationRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Insert a new rule at the end, or replace an existing one in place.
    /// Replacing keeps the execution history.  Returns `true` on replace.
    pub fn upsert(&mut self, mut rule: AutomationRule) -> bool {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                rule.execution_count = existing.execution_count;
                rule.last_executed = existing.last_executed;
                *existing = rule;
                true
            }
            None => {
                self.rules.push(rule);
                false
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    /// Flip `enabled`.  Returns the new value, or `None` for an unknown id.
    pub fn toggle(&mut self, id: &str) -> Option<bool> {
        let rule = self.rules.iter_mut().find(|r| r.id == id)?;
        rule.enabled = !rule.enabled;
        Some(rule.enabled)
    }

    /// Bookkeeping for a confirmed execution.
    pub fn record_execution(&mut self, id: &str, at: OffsetDateTime) -> bool {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.execution_count += 1;
                rule.last_executed = Some(at);
                true
            }
            None => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
