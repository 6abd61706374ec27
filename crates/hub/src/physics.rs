//! Psychrometric and lighting conversions: saturation vapour pressure, VPD,
//! dew point and daily light integral.
//!
//! Nothing in here rounds.  Values are formatted to a fixed precision only
//! where they leave the process (advisory messages, UI).

use serde::Serialize;

use crate::fusion::FusedConditions;

// Magnus–Tetens coefficients over water.
const SVP_BASE_KPA: f64 = 0.61078;
const MAGNUS_A: f64 = 17.27;
const MAGNUS_B: f64 = 237.3;

/// Lux to PPFD (µmol/m²/s) for broad-spectrum white LEDs.  This is a
/// lamp-dependent approximation, not a calibrated conversion.
pub const LUX_TO_PPFD: f64 = 0.015;

/// Default photoperiod used when integrating light over a day.
pub const DEFAULT_PHOTOPERIOD_HOURS: f64 = 18.0;

// ---------------------------------------------------------------------------
// Derived record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DerivedQuantities {
    pub vpd_kpa: f64,
    pub dew_point_c: f64,
    /// `None` when no light reading is available.
    pub dli_mol_m2_day: Option<f64>,
}

/// Derive VPD, dew point and DLI from a fusion cycle.  Returns `None` when
/// the climate readings are not trustworthy or the temperature sits on the
/// formula's singularity.
pub fn derive(fused: &FusedConditions, photoperiod_hours: f64) -> Option<DerivedQuantities> {
    if !fused.is_valid {
        return None;
    }
    let (t, rh) = (fused.temperature?, fused.humidity?);
    saturation_vapor_pressure(t)?;

    Some(DerivedQuantities {
        vpd_kpa: vpd(t, rh),
        dew_point_c: dew_point(t, rh),
        dli_mol_m2_day: fused.light_lux.map(|lux| dli(lux, photoperiod_hours)),
    })
}

// ---------------------------------------------------------------------------
// Formulas
// ---------------------------------------------------------------------------

/// Saturation vapour pressure in kPa.  `None` at or below -237.3 °C where
/// the Magnus denominator vanishes, and for non-finite input.
pub fn saturation_vapor_pressure(temp_c: f64) -> Option<f64> {
    if !temp_c.is_finite() || temp_c <= -MAGNUS_B {
        return None;
    }
    Some(SVP_BASE_KPA * (MAGNUS_A * temp_c / (temp_c + MAGNUS_B)).exp())
}

/// Vapour-pressure deficit in kPa.
///
/// A zero or unusable input yields `0.0` rather than an error, so callers
/// that must tell "no data" from "no deficit" check
/// [`FusedConditions::is_valid`] first.
pub fn vpd(temp_c: f64, humidity_pct: f64) -> f64 {
    if temp_c == 0.0 || humidity_pct == 0.0 || !humidity_pct.is_finite() {
        return 0.0;
    }
    let Some(svp) = saturation_vapor_pressure(temp_c) else {
        return 0.0;
    };
    let rh = humidity_pct.clamp(0.0, 100.0);
    svp * (1.0 - rh / 100.0)
}

/// Dew point in °C via the inverted Magnus formula.  Same zero-input
/// convention as [`vpd`].
pub fn dew_point(temp_c: f64, humidity_pct: f64) -> f64 {
    if temp_c == 0.0 || humidity_pct <= 0.0 || !humidity_pct.is_finite() {
        return 0.0;
    }
    if saturation_vapor_pressure(temp_c).is_none() {
        return 0.0;
    }
    let rh = humidity_pct.min(100.0);
    let alpha = (rh / 100.0).ln() + MAGNUS_A * temp_c / (MAGNUS_B + temp_c);
    MAGNUS_B * alpha / (MAGNUS_A - alpha)
}

/// Daily light integral in mol/m²/day for a constant `lux` held over
/// `hours` of light.
pub fn dli(lux: f64, hours: f64) -> f64 {
    if !lux.is_finite() || lux <= 0.0 || hours <= 0.0 {
        return 0.0;
    }
    let ppfd = lux * LUX_TO_PPFD;
    ppfd * 3600.0 * hours / 1_000_000.0
}

// ===========================================================================
// Tests
// ===========================================================================
