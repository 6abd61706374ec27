//! Payload types pushed by the grow-chamber controller.
//!
//! Every field is optional: an absent key or JSON `null` means "no reading".
//! Zero is kept as a value here; whether zero also counts as "absent" is
//! decided per quantity in [`crate::fusion`].

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Climate snapshot (`sensorData`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RawSnapshot {
    /// Controller clock, unix milliseconds.  Missing means "arrival time".
    #[serde(default)]
    pub ts: Option<i64>,

    /// Controller's own pre-averaged pair.
    #[serde(default)]
    pub temp: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,

    #[serde(default)]
    pub temp_bottom: Option<f64>,
    #[serde(default)]
    pub temp_middle: Option<f64>,
    #[serde(default)]
    pub temp_top: Option<f64>,
    #[serde(default)]
    pub humidity_bottom: Option<f64>,
    #[serde(default)]
    pub humidity_middle: Option<f64>,
    #[serde(default)]
    pub humidity_top: Option<f64>,

    #[serde(default)]
    pub lux: Option<f64>,

    /// Capacitive soil probes, either raw ADC counts or already percent.
    /// `None` means the key was omitted from this push.
    #[serde(default)]
    pub soil: Option<Vec<Option<f64>>>,
    /// Distance-based plant heights in cm.
    #[serde(default)]
    pub heights: Option<Vec<Option<f64>>>,

    #[serde(default, rename = "tankLevel")]
    pub tank_level: Option<f64>,
    #[serde(default, rename = "gasLevel")]
    pub gas_level: Option<f64>,
}

impl RawSnapshot {
    pub fn temperature_probes(&self) -> [Option<f64>; 3] {
        [self.temp_bottom, self.temp_middle, self.temp_top]
    }

    pub fn humidity_probes(&self) -> [Option<f64>; 3] {
        [self.humidity_bottom, self.humidity_middle, self.humidity_top]
    }
}

// ---------------------------------------------------------------------------
// Reservoir snapshot (`nutrientSensors`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NutrientReadings {
    #[serde(default)]
    pub ts: Option<i64>,
    /// Electrical conductivity, mS/cm.
    #[serde(default)]
    pub ec: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
    /// Solution temperature, °C.
    #[serde(default, rename = "temp")]
    pub water_temp: Option<f64>,
    #[serde(default, rename = "reservoirLevel_percent")]
    pub reservoir_level_percent: Option<f64>,
}

// ---------------------------------------------------------------------------
// Health payloads
// ---------------------------------------------------------------------------

/// `watchdogStatus`: the controller's view of its own broker link.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinkReport {
    #[serde(rename = "mqttConnected")]
    pub mqtt_connected: bool,
}

/// `alert`: free-form alert raised by the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AlertMsg {
    #[serde(default)]
    pub severity: Option<String>,
    pub message: String,
}

// ===========================================================================
// Tests
// ===========================================================================
