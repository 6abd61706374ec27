//! Operator advisories derived from the fused climate and the current
//! growth phase.
//!
//! Advisories never actuate anything.  Each one carries a stable id built
//! from `(metric, direction)` so a UI can hide a dismissed advisory until
//! the condition clears and comes back.

use serde::{Deserialize, Serialize};

use crate::fusion::FusedConditions;
use crate::physics::DerivedQuantities;
use crate::rules::{Action, Device, Metric, Switch};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPhase {
    Seedling,
    #[default]
    Vegetative,
    Flowering,
}

/// Ordered so that `Critical` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Optimization,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metric: Option<Metric>,
    pub current_value: Option<f64>,
    pub target_value: Option<f64>,
    pub suggested_actions: Vec<Action>,
}

/// Optimal range for one metric.  A reading further than `critical_margin`
/// outside the range is critical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub min: f64,
    pub max: f64,
    pub critical_margin: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseTargets {
    pub temperature: Band,
    pub humidity: Band,
    pub vpd: Band,
    pub dli: Band,
}

const fn band(min: f64, max: f64, critical_margin: f64) -> Band {
    Band {
        min,
        max,
        critical_margin,
    }
}

impl GrowthPhase {
    pub fn targets(self) -> PhaseTargets {
        match self {
            Self::Seedling => PhaseTargets {
                temperature: band(20.0, 25.0, 5.0),
                humidity: band(65.0, 80.0, 15.0),
                vpd: band(0.4, 0.8, 0.4),
                dli: band(6.0, 12.0, 8.0),
            },
            Self::Vegetative => PhaseTargets {
                temperature: band(22.0, 28.0, 5.0),
                humidity: band(40.0, 70.0, 15.0),
                vpd: band(0.8, 1.2, 0.4),
                dli: band(15.0, 30.0, 10.0),
            },
            Self::Flowering => PhaseTargets {
                temperature: band(20.0, 26.0, 5.0),
                humidity: band(40.0, 50.0, 15.0),
                vpd: band(1.2, 1.6, 0.4),
                dli: band(30.0, 45.0, 12.0),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    High,
    Low,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Build the advisory list for one cycle, most severe first.
pub fn generate(
    fused: &FusedConditions,
    derived: Option<&DerivedQuantities>,
    phase: GrowthPhase,
) -> Vec<Recommendation> {
    let usable = derived.filter(|_| fused.is_valid);
    let (Some(t), Some(rh), Some(d)) = (fused.temperature, fused.humidity, usable) else {
        return vec![Recommendation {
            id: "climate-unavailable".to_string(),
            severity: Severity::Info,
            title: "Climate readings unavailable".to_string(),
            message: "Temperature or humidity is missing; VPD and climate advice are paused."
                .to_string(),
            metric: None,
            current_value: None,
            target_value: None,
            suggested_actions: vec![],
        }];
    };

    let targets = phase.targets();
    let mut out = Vec::new();

    out.extend(check(Metric::Temperature, t, &targets.temperature, Severity::Warning));
    out.extend(check(Metric::Humidity, rh, &targets.humidity, Severity::Warning));
    out.extend(check(Metric::Vpd, d.vpd_kpa, &targets.vpd, Severity::Warning));

    // Lights off reads 0 lux; a daily integral from that is meaningless.
    if let Some(dli) = d.dli_mol_m2_day.filter(|_| fused.light_lux.is_some_and(|l| l > 0.0)) {
        out.extend(check(Metric::Dli, dli, &targets.dli, Severity::Optimization));
    }

    // Stable: equal severities keep metric order.
    out.sort_by(|a, b| b.severity.cmp(&a.severity));
    out
}

fn check(metric: Metric, value: f64, band: &Band, base: Severity) -> Option<Recommendation> {
    let (direction, target) = if value > band.max {
        (Direction::High, band.max)
    } else if value < band.min {
        (Direction::Low, band.min)
    } else {
        return None;
    };

    let excess = (value - target).abs();
    let severity = if excess > band.critical_margin {
        Severity::Critical
    } else {
        base
    };

    let (label, unit) = label(metric);
    let word = direction.as_str();
    Some(Recommendation {
        id: format!("{}-{word}", metric.as_str()),
        severity,
        title: format!("{label} too {word}"),
        message: format!(
            "{label} is {value:.1}{unit}, {} the optimum of {target:.1}{unit} by {excess:.1}{unit}.",
            if direction == Direction::High { "above" } else { "below" },
        ),
        metric: Some(metric),
        current_value: Some(value),
        target_value: Some(target),
        suggested_actions: suggestions(metric, direction),
    })
}

fn label(metric: Metric) -> (&'static str, &'static str) {
    match metric {
        Metric::Temperature => ("Temperature", " °C"),
        Metric::Humidity => ("Humidity", " %"),
        Metric::Vpd => ("VPD", " kPa"),
        Metric::Dli => ("Daily light integral", " mol/m²/day"),
        _ => (metric.as_str(), ""),
    }
}

fn on(device: Device) -> Action {
    Action::Device {
        device,
        state: Switch::On,
    }
}

fn off(device: Device) -> Action {
    Action::Device {
        device,
        state: Switch::Off,
    }
}

fn suggestions(metric: Metric, direction: Direction) -> Vec<Action> {
    use Device::*;
    match (metric, direction) {
        (Metric::Temperature, Direction::High) => vec![on(ExhaustFan), off(Heater)],
        (Metric::Temperature, Direction::Low) => vec![on(Heater)],
        (Metric::Humidity, Direction::High) => vec![on(Dehumidifier), on(ExhaustFan)],
        (Metric::Humidity, Direction::Low) => vec![on(Humidifier)],
        // High VPD means the air is too dry for the leaf temperature.
        (Metric::Vpd, Direction::High) => vec![on(Humidifier)],
        (Metric::Vpd, Direction::Low) => vec![on(Dehumidifier), on(CirculationFan)],
        (Metric::Dli, Direction::Low) => vec![on(Light)],
        _ => vec![],
    }
}

// ===========================================================================
// Tests
// ===========================================================================
