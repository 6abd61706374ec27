//! Stateful grow-chamber simulator for local development.
//!
//! Models the controller side of the hub's telemetry feed:
//! - Air temperature and humidity that relax toward a device-dependent
//!   target, with a random walk on top
//! - Three stacked probes (bottom/middle/top) with permanent offsets and
//!   per-reading noise
//! - Occasional probe dropouts reported as `0`, the way the firmware does
//! - Capacitive soil probes drying out between pump runs
//! - A reservoir whose EC, pH and level drift and respond to the pumps
//! - Closed-loop device response (heater, fans, humidifier, light, pumps)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Comfortable vegetative room.  Low noise, no dropouts.
    Balanced,
    /// Damp room that drifts above 70 % humidity without a dehumidifier.
    Humid,
    /// Hot room; exercises cooling rules and critical advisories.
    Hot,
    /// Noisy probes, frequent dropouts and the odd failed command.  Tests
    /// the hub's fusion fallback and retry path.
    Flaky,
}

struct Profile {
    ambient_temp: f64,
    ambient_humidity: f64,
    noise: f64,
    dropout_prob: f32,
    command_fail_prob: f32,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "humid" => Self::Humid,
            "hot" => Self::Hot,
            "flaky" => Self::Flaky,
            _ => Self::Balanced,
        }
    }

    fn profile(self) -> Profile {
        let (ambient_temp, ambient_humidity, noise, dropout_prob, command_fail_prob) = match self {
            Self::Balanced => (24.0, 55.0, 0.2, 0.0, 0.0),
            Self::Humid => (25.0, 78.0, 0.3, 0.01, 0.0),
            Self::Hot => (31.0, 50.0, 0.3, 0.01, 0.0),
            Self::Flaky => (24.0, 60.0, 0.8, 0.12, 0.1),
        };
        Profile {
            ambient_temp,
            ambient_humidity,
            noise,
            dropout_prob,
            command_fail_prob,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::Humid => write!(f, "humid"),
            Self::Hot => write!(f, "hot"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
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

// ---------------------------------------------------------------------------
// Payloads (controller field names)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SensorData {
    pub ts: i64,
    pub temp: f64,
    pub humidity: f64,
    pub temp_bottom: f64,
    pub temp_middle: f64,
    pub temp_top: f64,
    pub humidity_bottom: f64,
    pub humidity_middle: f64,
    pub humidity_top: f64,
    pub lux: f64,
    pub soil: Vec<i32>,
    pub heights: Vec<f64>,
    #[serde(rename = "tankLevel")]
    pub tank_level: f64,
    #[serde(rename = "gasLevel")]
    pub gas_level: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NutrientData {
    pub ts: i64,
    pub ec: f64,
    pub ph: f64,
    pub temp: f64,
    #[serde(rename = "reservoirLevel_percent")]
    pub reservoir_level_percent: f64,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Positional climate probe: permanent calibration error.
struct Probe {
    temp_offset: f64,
    humidity_offset: f64,
}

pub struct ChamberSim {
    profile: Profile,
    devices: BTreeMap<Device, bool>,

    // "True" chamber state.
    air_temp: f64,
    air_humidity: f64,
    soil: Vec<f64>,
    tank_level: f64,
    gas_level: f64,
    ec: f64,
    ph: f64,
    water_temp: f64,
    reservoir: f64,

    probes: [Probe; 3],

    // Soil ADC endpoints; higher reads drier.
    raw_dry: f64,
    raw_wet: f64,
}

/// Per-step relaxation toward the target climate.
const RELAX: f64 = 0.1;

impl ChamberSim {
    pub fn new(scenario: Scenario, soil_probes: usize) -> Self {
        let profile = scenario.profile();
        let (raw_dry, raw_wet) = (2600.0, 1100.0);

        let probes = [0, 1, 2].map(|i| Probe {
            // Warm air rises: top probe reads a little higher.
            temp_offset: (i as f64 - 1.0) * 0.8 + gaussian(0.0, 0.2),
            humidity_offset: gaussian(0.0, 1.5),
        });

        let soil = (0..soil_probes)
            .map(|_| gaussian((raw_dry + raw_wet) / 2.0, 80.0))
            .collect();

        let mut devices: BTreeMap<Device, bool> = [
            Device::ExhaustFan,
            Device::CirculationFan,
            Device::Humidifier,
            Device::Dehumidifier,
            Device::Heater,
            Device::Light,
            Device::WaterPump,
            Device::NutrientPump,
        ]
        .into_iter()
        .map(|d| (d, false))
        .collect();
        devices.insert(Device::Light, true);

        Self {
            air_temp: profile.ambient_temp,
            air_humidity: profile.ambient_humidity,
            water_temp: profile.ambient_temp - 3.0,
            profile,
            devices,
            soil,
            tank_level: 80.0,
            gas_level: 420.0,
            ec: 1.6,
            ph: 6.0,
            reservoir: 90.0,
            probes,
            raw_dry,
            raw_wet,
        }
    }

    pub fn set_device(&mut self, device: Device, on: bool) {
        self.devices.insert(device, on);
    }

    pub fn is_on(&self, device: Device) -> bool {
        self.devices.get(&device).copied().unwrap_or(false)
    }

    /// Whether the next command should be reported as failed.
    pub fn command_fails(&self) -> bool {
        fastrand::f32() < self.profile.command_fail_prob
    }

    /// Advance the chamber by one sampling interval.
    pub fn step(&mut self) {
        let on = |d| self.is_on(d);

        let mut temp_target = self.profile.ambient_temp;
        if on(Device::Light) {
            temp_target += 2.5;
        }
        if on(Device::Heater) {
            temp_target += 6.0;
        }
        if on(Device::ExhaustFan) {
            temp_target -= 4.0;
        }

        let mut humidity_target = self.profile.ambient_humidity;
        if on(Device::Humidifier) {
            humidity_target += 20.0;
        }
        if on(Device::Dehumidifier) {
            humidity_target -= 20.0;
        }
        if on(Device::ExhaustFan) {
            humidity_target -= 8.0;
        }

        let walk = self.profile.noise * 0.5;
        let water = on(Device::WaterPump);
        let dose = on(Device::NutrientPump);
        let vent = on(Device::ExhaustFan);

        self.air_temp += RELAX * (temp_target - self.air_temp) + gaussian(0.0, walk);
        self.air_humidity = (self.air_humidity
            + RELAX * (humidity_target - self.air_humidity)
            + gaussian(0.0, walk * 2.0))
        .clamp(5.0, 99.0);

        for s in &mut self.soil {
            let wet = if water { -60.0 } else { 0.0 };
            *s = (*s + 4.0 + wet + gaussian(0.0, 10.0))
                .clamp(self.raw_wet - 100.0, self.raw_dry + 100.0);
        }
        if water {
            self.tank_level = (self.tank_level - 0.5).max(0.0);
        }

        let gas_target = if vent { 410.0 } else { 700.0 };
        self.gas_level += 0.05 * (gas_target - self.gas_level) + gaussian(0.0, 5.0);

        self.ec = (self.ec - 0.002 + if dose { 0.05 } else { 0.0 }).max(0.0);
        self.ph = (self.ph + 0.002 + gaussian(0.0, 0.01) - if dose { 0.02 } else { 0.0 })
            .clamp(3.0, 9.0);
        self.water_temp += 0.02 * (self.air_temp - 3.0 - self.water_temp);
        self.reservoir = (self.reservoir - 0.02 - if dose { 0.1 } else { 0.0 }).max(0.0);
    }

    /// A probe reading, or `0` when the probe drops out this sample.
    fn probe(&self, truth: f64, offset: f64) -> f64 {
        if fastrand::f32() < self.profile.dropout_prob {
            0.0
        } else {
            round1(truth + offset + gaussian(0.0, self.profile.noise))
        }
    }

    pub fn sensor_data(&self, ts: i64) -> SensorData {
        let [b, m, t] = &self.probes;
        let temps = [
            self.probe(self.air_temp, b.temp_offset),
            self.probe(self.air_temp, m.temp_offset),
            self.probe(self.air_temp, t.temp_offset),
        ];
        let hums = [
            self.probe(self.air_humidity, b.humidity_offset),
            self.probe(self.air_humidity, m.humidity_offset),
            self.probe(self.air_humidity, t.humidity_offset),
        ];

        let lux = if self.is_on(Device::Light) {
            round1(gaussian(18_000.0, 600.0).max(0.0))
        } else {
            0.0
        };

        SensorData {
            ts,
            // The firmware's own average also drops out from time to time.
            temp: self.probe(self.air_temp, 0.0),
            humidity: self.probe(self.air_humidity, 0.0),
            temp_bottom: temps[0],
            temp_middle: temps[1],
            temp_top: temps[2],
            humidity_bottom: hums[0],
            humidity_middle: hums[1],
            humidity_top: hums[2],
            lux,
            soil: self
                .soil
                .iter()
                .map(|s| (s + gaussian(0.0, 15.0)).round().clamp(0.0, 4095.0) as i32)
                .collect(),
            heights: vec![round1(gaussian(42.0, 0.3)), round1(gaussian(40.0, 0.3))],
            tank_level: round1(self.tank_level),
            gas_level: round1(self.gas_level),
        }
    }

    pub fn nutrient_data(&self, ts: i64) -> NutrientData {
        NutrientData {
            ts,
            ec: (self.ec * 100.0).round() / 100.0,
            ph: (self.ph * 100.0).round() / 100.0,
            temp: round1(self.water_temp),
            reservoir_level_percent: round1(self.reservoir),
        }
    }

    pub fn devices(&self) -> &BTreeMap<Device, bool> {
        &self.devices
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(values: impl Iterator<Item = f64>) -> f64 {
        let v: Vec<f64> = values.collect();
        v.iter().sum::<f64>() / v.len() as f64
    }

    fn run(sim: &mut ChamberSim, steps: usize) {
        for _ in 0..steps {
            sim.step();
        }
    }

    #[test]
    fn readings_are_plausible() {
        let mut sim = ChamberSim::new(Scenario::Balanced, 2);
        for _ in 0..200 {
            sim.step();
            let d = sim.sensor_data(0);
            for v in [d.temp_bottom, d.temp_middle, d.temp_top] {
                assert!((10.0..45.0).contains(&v), "temperature out of range: {v}");
            }
            for v in [d.humidity_bottom, d.humidity_middle, d.humidity_top] {
                assert!((5.0..=100.0).contains(&v), "humidity out of range: {v}");
            }
            assert_eq!(d.soil.len(), 2);
            assert!(d.soil.iter().all(|s| (0..=4095).contains(s)));
        }
    }

    #[test]
    fn balanced_scenario_never_drops_out() {
        let sim = ChamberSim::new(Scenario::Balanced, 1);
        for _ in 0..200 {
            let d = sim.sensor_data(0);
            assert!(d.temp > 0.0 && d.temp_middle > 0.0 && d.humidity_top > 0.0);
        }
    }

    #[test]
    fn flaky_scenario_drops_probes_to_zero() {
        let sim = ChamberSim::new(Scenario::Flaky, 1);
        let zeros = (0..500)
            .map(|_| sim.sensor_data(0))
            .filter(|d| d.temp_bottom == 0.0 || d.humidity_middle == 0.0)
            .count();
        assert!(zeros > 0, "flaky probes should drop out");
    }

    #[test]
    fn heater_warms_the_chamber() {
        let mut sim = ChamberSim::new(Scenario::Balanced, 1);
        run(&mut sim, 50);
        let before = sim.air_temp;
        sim.set_device(Device::Heater, true);
        run(&mut sim, 60);
        assert!(
            sim.air_temp > before + 3.0,
            "heater should warm: before={before:.1} after={:.1}",
            sim.air_temp
        );
    }

    #[test]
    fn dehumidifier_dries_the_air() {
        let mut sim = ChamberSim::new(Scenario::Humid, 1);
        run(&mut sim, 30);
        let before = sim.air_humidity;
        sim.set_device(Device::Dehumidifier, true);
        run(&mut sim, 60);
        assert!(sim.air_humidity < before - 10.0);
    }

    #[test]
    fn water_pump_wets_soil_and_drains_tank() {
        let mut sim = ChamberSim::new(Scenario::Balanced, 1);
        run(&mut sim, 20);
        let before = mean((0..20).map(|_| sim.sensor_data(0).soil[0] as f64));
        let tank = sim.tank_level;

        sim.set_device(Device::WaterPump, true);
        run(&mut sim, 10);
        let after = mean((0..20).map(|_| sim.sensor_data(0).soil[0] as f64));

        assert!(after < before, "pump should wet soil: {before:.0} -> {after:.0}");
        assert!(sim.tank_level < tank);
    }

    #[test]
    fn lights_off_reads_zero_lux() {
        let mut sim = ChamberSim::new(Scenario::Balanced, 1);
        assert!(sim.sensor_data(0).lux > 0.0);
        sim.set_device(Device::Light, false);
        assert_eq!(sim.sensor_data(0).lux, 0.0);
    }

    #[test]
    fn starts_with_only_the_light_on() {
        let sim = ChamberSim::new(Scenario::Hot, 1);
        let on: Vec<Device> = sim
            .devices()
            .iter()
            .filter(|(_, on)| **on)
            .map(|(d, _)| *d)
            .collect();
        assert_eq!(on, vec![Device::Light]);
    }

    #[test]
    fn sensor_data_uses_controller_field_names() {
        let sim = ChamberSim::new(Scenario::Balanced, 3);
        let json = serde_json::to_value(sim.sensor_data(1_700_000_000_000)).unwrap();
        assert_eq!(json["ts"], 1_700_000_000_000_i64);
        assert!(json["temp_middle"].is_number());
        assert!(json["tankLevel"].is_number());
        assert!(json["gasLevel"].is_number());
        assert_eq!(json["soil"].as_array().unwrap().len(), 3);

        let n = serde_json::to_value(sim.nutrient_data(1)).unwrap();
        assert!(n["reservoirLevel_percent"].is_number());
        assert!(n["temp"].is_number());
    }

    #[test]
    fn device_names_are_snake_case() {
        let d: Device = serde_json::from_str(r#""exhaust_fan""#).unwrap();
        assert_eq!(d, Device::ExhaustFan);
        assert_eq!(
            serde_json::to_string(&Device::NutrientPump).unwrap(),
            r#""nutrient_pump""#
        );
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("balanced"), Scenario::Balanced);
        assert_eq!(Scenario::from_str_lossy("HUMID"), Scenario::Humid);
        assert_eq!(Scenario::from_str_lossy("Hot"), Scenario::Hot);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Balanced);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Balanced.to_string(), "balanced");
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let m = mean((0..n).map(|_| approx_std_normal()));
        assert!(m.abs() < 0.15, "approx_std_normal mean should be near zero: {m}");
    }
}
