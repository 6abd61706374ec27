//! TOML config file loading and validation: hub settings, watchdog
//! thresholds, soil calibration and the initial automation rule set.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::advisor::GrowthPhase;
use crate::fusion::SoilCalibration;
use crate::physics::DEFAULT_PHOTOPERIOD_HOURS;
use crate::rules::RuleEntry;
use crate::watchdog::Thresholds;

/// Upper bound on configured rules; larger sets are rejected at load time.
pub const MAX_RULES: usize = 256;

const MAX_UTC_OFFSET_MIN: i32 = 14 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Dispatch triggered actions to the controller.
    Auto,
    /// Evaluate and report only.
    #[default]
    Monitor,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub soil: SoilCalibration,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub controller_id: String,
    pub mode: OperationMode,
    pub phase: GrowthPhase,
    pub photoperiod_hours: f64,
    pub utc_offset_minutes: i32,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            controller_id: "chamber-1".to_string(),
            mode: OperationMode::default(),
            phase: GrowthPhase::default(),
            photoperiod_hours: DEFAULT_PHOTOPERIOD_HOURS,
            utc_offset_minutes: 0,
        }
    }
}

impl HubSection {
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub tick_sec: u64,
    pub warning_sec: u64,
    pub critical_sec: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            tick_sec: 5,
            warning_sec: 30,
            critical_sec: 300,
        }
    }
}

impl WatchdogSection {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning: Duration::from_secs(self.warning_sec),
            critical: Duration::from_secs(self.critical_sec),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    ///
    /// Rule *contents* (metric names, operators, devices) are not checked
    /// here: a rule that fails to compile is skipped with a warning when the
    /// rule book is built, and the hub still starts.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_watchdog(&mut errors);
        self.validate_soil(&mut errors);
        self.validate_rules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;

        if h.controller_id.trim().is_empty() {
            errors.push("hub: controller_id is empty".to_string());
        } else if h.controller_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "hub: controller_id '{}' must not contain '/', '+' or '#'",
                h.controller_id
            ));
        }

        if !(h.photoperiod_hours > 0.0 && h.photoperiod_hours <= 24.0) {
            errors.push(format!(
                "hub: photoperiod_hours {} out of range (0, 24]",
                h.photoperiod_hours
            ));
        }

        if h.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MIN {
            errors.push(format!(
                "hub: utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MIN}, {MAX_UTC_OFFSET_MIN}]",
                h.utc_offset_minutes
            ));
        }
    }

    fn validate_watchdog(&self, errors: &mut Vec<String>) {
        let w = &self.watchdog;

        if w.tick_sec == 0 {
            errors.push("watchdog: tick_sec must be positive".to_string());
        }
        if w.warning_sec == 0 {
            errors.push("watchdog: warning_sec must be positive".to_string());
        }
        if w.critical_sec <= w.warning_sec {
            errors.push(format!(
                "watchdog: critical_sec ({}) must be greater than warning_sec ({})",
                w.critical_sec, w.warning_sec
            ));
        }
    }

    fn validate_soil(&self, errors: &mut Vec<String>) {
        let s = &self.soil;

        for (name, v) in [("dry", s.dry), ("wet", s.wet)] {
            if !v.is_finite() || v < 0.0 {
                errors.push(format!("soil: {name} {v} must be a non-negative number"));
            }
        }
        if s.dry == s.wet {
            errors.push(format!(
                "soil: dry and wet are both {}; calibration range is zero",
                s.dry
            ));
        }
    }

    fn validate_rules(&self, errors: &mut Vec<String>) {
        if self.rules.len() > MAX_RULES {
            errors.push(format!(
                "rules: {} rules configured (max {MAX_RULES})",
                self.rules.len()
            ));
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, r) in self.rules.iter().enumerate() {
            if r.id.trim().is_empty() {
                errors.push(format!("rules[{i}]: id is empty"));
            } else if !seen_ids.insert(r.id.trim()) {
                errors.push(format!("rule '{}': duplicate id", r.id));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
