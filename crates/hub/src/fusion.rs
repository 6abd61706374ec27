//! Sensor fusion: collapses the controller's redundant / positional probes
//! into one value per quantity.
//!
//! Precedence for temperature and humidity:
//!
//! 1. the controller's own `temp`/`humidity` pair, when both are `> 0`;
//! 2. otherwise the mean of the positional probes that read `> 0`;
//! 3. otherwise `None`, and the whole record is invalid.
//!
//! Temperature and humidity are never carried over from the previous cycle;
//! staleness is the watchdog's job.  Soil and light keys that a push omits
//! entirely keep their previous value.

use serde::{Deserialize, Serialize};

use crate::snapshot::RawSnapshot;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusedConditions {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture_percent: Vec<f64>,
    pub light_lux: Option<f64>,
    /// True iff both temperature and humidity are present (and so `> 0`).
    pub is_valid: bool,
}

impl FusedConditions {
    /// Mean of the calibrated soil probes.
    pub fn mean_soil_moisture(&self) -> Option<f64> {
        mean(self.soil_moisture_percent.iter().copied())
    }
}

/// Two-point calibration for capacitive soil probes, in raw ADC counts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SoilCalibration {
    pub dry: f64,
    pub wet: f64,
}

impl Default for SoilCalibration {
    fn default() -> Self {
        // 12-bit ESP32 ADC, 3.3 V capacitive probe v1.2.
        Self {
            dry: 2600.0,
            wet: 1100.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

pub fn fuse(
    raw: &RawSnapshot,
    previous: &FusedConditions,
    calibration: &SoilCalibration,
) -> FusedConditions {
    let (temperature, humidity) = match (positive(raw.temp), positive(raw.humidity)) {
        (Some(t), Some(h)) => (Some(t), Some(h)),
        _ => (
            mean(raw.temperature_probes().into_iter().filter_map(positive)),
            mean(raw.humidity_probes().into_iter().filter_map(positive)),
        ),
    };

    let soil_moisture_percent = match &raw.soil {
        Some(probes) => probes
            .iter()
            .flatten()
            .filter_map(|&r| soil_percent(r, calibration))
            .collect(),
        None => previous.soil_moisture_percent.clone(),
    };

    // Zero lux is a real reading (lights off), not an absent sensor.
    let light_lux = match raw.lux {
        Some(lux) if lux.is_finite() && lux >= 0.0 => Some(lux),
        Some(_) => None,
        None => previous.light_lux,
    };

    FusedConditions {
        is_valid: temperature.is_some() && humidity.is_some(),
        temperature,
        humidity,
        soil_moisture_percent,
        light_lux,
    }
}

/// Convert a soil probe reading to percent.
///
/// Readings already inside `[0, 100]` come from firmware that calibrates on
/// the device and pass through untouched; anything above is raw ADC and is
/// mapped with `(dry - raw) / (dry - wet) * 100`, clamped to `[0, 100]`.
pub fn soil_percent(raw: f64, calibration: &SoilCalibration) -> Option<f64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    if raw <= 100.0 {
        return Some(raw);
    }
    let range = calibration.dry - calibration.wet;
    if range == 0.0 {
        return None;
    }
    let pct = (calibration.dry - raw) / range * 100.0;
    Some(pct.clamp(0.0, 100.0))
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> SoilCalibration {
        SoilCalibration::default()
    }

    #[test]
    fn controller_pair_wins_over_probes() {
        let raw = RawSnapshot {
            temp: Some(25.0),
            humidity: Some(55.0),
            temp_bottom: Some(20.0),
            temp_top: Some(22.0),
            humidity_bottom: Some(70.0),
            ..Default::default()
        };
        let f = fuse(&raw, &FusedConditions::default(), &cal());
        assert_eq!(f.temperature, Some(25.0));
        assert_eq!(f.humidity, Some(55.0));
        assert!(f.is_valid);
    }

    #[test]
    fn zero_probe_is_treated_as_absent() {
        let raw = RawSnapshot {
            temp_bottom: Some(22.0),
            temp_middle: Some(0.0),
            temp_top: Some(24.0),
            humidity_middle: Some(60.0),
            ..Default::default()
        };
        let f = fuse(&raw, &FusedConditions::default(), &cal());
        assert_eq!(f.temperature, Some(23.0));
        assert_eq!(f.humidity, Some(60.0));
        assert!(f.is_valid);
    }

    #[test]
    fn half_pair_falls_back_to_probes() {
        let raw = RawSnapshot {
            temp: Some(25.0),
            humidity: Some(0.0),
            temp_bottom: Some(21.0),
            humidity_bottom: Some(64.0),
            ..Default::default()
        };
        let f = fuse(&raw, &FusedConditions::default(), &cal());
        assert_eq!(f.temperature, Some(21.0));
        assert_eq!(f.humidity, Some(64.0));
    }

    #[test]
    fn zero_pair_without_probes_is_invalid() {
        let raw = RawSnapshot {
            temp: Some(0.0),
            humidity: Some(0.0),
            ..Default::default()
        };
        let f = fuse(&raw, &FusedConditions::default(), &cal());
        assert_eq!(f.temperature, None);
        assert_eq!(f.humidity, None);
        assert!(!f.is_valid);
        assert_eq!(crate::physics::derive(&f, 18.0), None);
    }

    #[test]
    fn climate_is_not_carried_forward() {
        let previous = FusedConditions {
            temperature: Some(24.0),
            humidity: Some(60.0),
            is_valid: true,
            ..Default::default()
        };
        let f = fuse(&RawSnapshot::default(), &previous, &cal());
        assert_eq!(f.temperature, None);
        assert!(!f.is_valid);
    }

    #[test]
    fn omitted_soil_and_light_keep_previous_values() {
        let previous = FusedConditions {
            soil_moisture_percent: vec![40.0, 50.0],
            light_lux: Some(12_000.0),
            ..Default::default()
        };
        let f = fuse(&RawSnapshot::default(), &previous, &cal());
        assert_eq!(f.soil_moisture_percent, vec![40.0, 50.0]);
        assert_eq!(f.light_lux, Some(12_000.0));
    }

    #[test]
    fn zero_lux_is_a_reading() {
        let previous = FusedConditions {
            light_lux: Some(12_000.0),
            ..Default::default()
        };
        let raw = RawSnapshot {
            lux: Some(0.0),
            ..Default::default()
        };
        assert_eq!(fuse(&raw, &previous, &cal()).light_lux, Some(0.0));
    }

    #[test]
    fn soil_mixes_raw_and_precalibrated_probes() {
        let raw = RawSnapshot {
            soil: Some(vec![Some(1850.0), None, Some(42.0), Some(5000.0)]),
            ..Default::default()
        };
        let f = fuse(&raw, &FusedConditions::default(), &cal());
        // 1850 sits halfway between dry 2600 and wet 1100; 5000 is drier
        // than dry and clamps to 0.
        assert_eq!(f.soil_moisture_percent, vec![50.0, 42.0, 0.0]);
        assert_eq!(f.mean_soil_moisture(), Some(92.0 / 3.0));
    }

    #[test]
    fn soil_percent_bounds() {
        assert_eq!(soil_percent(0.0, &cal()), Some(0.0));
        assert_eq!(soil_percent(100.0, &cal()), Some(100.0));
        assert_eq!(soil_percent(900.0, &cal()), Some(100.0));
        assert_eq!(soil_percent(-1.0, &cal()), None);
        assert_eq!(soil_percent(f64::NAN, &cal()), None);
    }

    #[test]
    fn soil_percent_degenerate_calibration() {
        let flat = SoilCalibration {
            dry: 2000.0,
            wet: 2000.0,
        };
        assert_eq!(soil_percent(1500.0, &flat), None);
    }
}
