//! Simulated environmental sensor driver.
//!
//! Produces realistic readings (mostly normal, occasional warning/critical
//! excursions) for development and for exercising the collector without
//! hardware. Settings:
//!
//! - `sensor`: sensor kind name (default `temperature`)
//! - `empty_rate`: probability that a read reports nothing (default 0.0)
//! - `failure_rate`: probability that a read fails (default 0.0)

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;

use super::{Device, DeviceError, Reading};

/// Sensor kinds the simulator can imitate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    Motion,
    Light,
    Vibration,
    AirQuality,
    Power,
}

impl SensorType {
    /// Get all sensor types.
    pub fn all() -> &'static [SensorType] {
        &[
            SensorType::Temperature,
            SensorType::Humidity,
            SensorType::Pressure,
            SensorType::Motion,
            SensorType::Light,
            SensorType::Vibration,
            SensorType::AirQuality,
            SensorType::Power,
        ]
    }

    /// Get the sensor type name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Pressure => "pressure",
            SensorType::Motion => "motion",
            SensorType::Light => "light",
            SensorType::Vibration => "vibration",
            SensorType::AirQuality => "air_quality",
            SensorType::Power => "power",
        }
    }

    /// Get the unit for this sensor type.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "celsius",
            SensorType::Humidity => "percent",
            SensorType::Pressure => "hpa",
            SensorType::Motion => "detected",
            SensorType::Light => "lux",
            SensorType::Vibration => "g",
            SensorType::AirQuality => "aqi",
            SensorType::Power => "watts",
        }
    }
}

/// Condition the simulated value falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Normal,
    Warning,
    Critical,
}

impl Condition {
    // Normal: 85%, Warning: 12%, Critical: 3%
    fn sample(rng: &mut impl Rng) -> Self {
        match rng.gen_range(0..100) {
            0..=84 => Condition::Normal,
            85..=96 => Condition::Warning,
            _ => Condition::Critical,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Condition::Normal => "normal",
            Condition::Warning => "warning",
            Condition::Critical => "critical",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SensorSettings {
    sensor: SensorType,
    empty_rate: f64,
    failure_rate: f64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            sensor: SensorType::Temperature,
            empty_rate: 0.0,
            failure_rate: 0.0,
        }
    }
}

/// Simulated sensor device.
#[derive(Debug)]
pub struct SimulatedSensor {
    id: String,
    sensor: SensorType,
    empty_rate: f64,
    failure_rate: f64,
    sequence: AtomicU64,
}

impl SimulatedSensor {
    /// Create an unconfigured temperature sensor.
    pub fn new() -> Self {
        Self {
            id: String::new(),
            sensor: SensorType::Temperature,
            empty_rate: 0.0,
            failure_rate: 0.0,
            sequence: AtomicU64::new(0),
        }
    }

    /// Create a sensor of the given kind.
    pub fn of_type(id: impl Into<String>, sensor: SensorType) -> Self {
        Self {
            id: id.into(),
            sensor,
            ..Self::new()
        }
    }

    /// The simulated sensor kind.
    pub fn sensor_type(&self) -> SensorType {
        self.sensor
    }

    fn sample(&self) -> Result<Option<Reading>, DeviceError> {
        let mut rng = rand::thread_rng();

        if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate) {
            return Err(DeviceError::Unavailable(format!(
                "{} sensor '{}' did not respond",
                self.sensor.name(),
                self.id
            )));
        }
        if self.empty_rate > 0.0 && rng.gen_bool(self.empty_rate) {
            return Ok(None);
        }

        let condition = Condition::sample(&mut rng);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let mut reading = Reading::new(&self.id)
            .with_value("sensor_type", self.sensor.name().into())
            .with_value("unit", self.sensor.unit().into())
            .with_value("status", condition.as_str().into())
            .with_value("sequence", sequence.into());

        reading = match self.sensor {
            SensorType::Temperature => {
                reading.with_value("reading", generate_temperature(&mut rng, condition).into())
            }
            SensorType::Humidity => {
                reading.with_value("reading", generate_humidity(&mut rng, condition).into())
            }
            SensorType::Pressure => {
                reading.with_value("reading", generate_pressure(&mut rng, condition).into())
            }
            SensorType::Motion => {
                // 30% motion detection rate
                let detected = rng.gen_bool(0.3);
                let confidence: u32 = match condition {
                    Condition::Normal => rng.gen_range(70..=100),
                    _ => rng.gen_range(20..70),
                };
                reading
                    .with_value("reading", u8::from(detected).into())
                    .with_value("confidence", confidence.into())
            }
            SensorType::Light => {
                reading.with_value("reading", generate_light(&mut rng, condition).into())
            }
            SensorType::Vibration => reading
                .with_value("reading", generate_vibration(&mut rng, condition).into())
                .with_value("frequency_hz", rng.gen_range(10.0_f64..500.0).into()),
            SensorType::AirQuality => reading
                .with_value("reading", generate_air_quality(&mut rng, condition).into())
                .with_value("pm25", rng.gen_range(0.0_f64..100.0).into()),
            SensorType::Power => reading
                .with_value("reading", generate_power(&mut rng, condition).into())
                .with_value("voltage", rng.gen_range(118.0_f64..122.0).into()),
        };

        Ok(Some(reading))
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimulatedSensor {
    fn configure(&mut self, id: &str, settings: &serde_json::Value) -> Result<(), DeviceError> {
        let settings: SensorSettings = if settings.is_null() {
            SensorSettings::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| DeviceError::InvalidSettings(e.to_string()))?
        };

        for (name, rate) in [
            ("empty_rate", settings.empty_rate),
            ("failure_rate", settings.failure_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DeviceError::InvalidSettings(format!(
                    "{} {} is outside 0.0..=1.0",
                    name, rate
                )));
            }
        }

        self.id = id.to_string();
        self.sensor = settings.sensor;
        self.empty_rate = settings.empty_rate;
        self.failure_rate = settings.failure_rate;
        Ok(())
    }

    async fn read_data(&self) -> Result<Option<Reading>, DeviceError> {
        self.sample()
    }
}

// Temperature (normal: 18-26C, warning: 26-35C or 10-18C, critical: >35C or <10C)
fn generate_temperature(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => {
            if rng.gen_bool(0.5) {
                rng.gen_range(35.0..50.0)
            } else {
                rng.gen_range(-10.0..10.0)
            }
        }
        Condition::Warning => {
            if rng.gen_bool(0.5) {
                rng.gen_range(26.0..35.0)
            } else {
                rng.gen_range(10.0..18.0)
            }
        }
        Condition::Normal => rng.gen_range(18.0..26.0),
    }
}

// Humidity (normal: 30-70%, warning: 70-85% or 15-30%, critical: >85% or <15%)
fn generate_humidity(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => {
            if rng.gen_bool(0.5) {
                rng.gen_range(85.0..100.0)
            } else {
                rng.gen_range(0.0..15.0)
            }
        }
        Condition::Warning => {
            if rng.gen_bool(0.5) {
                rng.gen_range(70.0..85.0)
            } else {
                rng.gen_range(15.0..30.0)
            }
        }
        Condition::Normal => rng.gen_range(30.0..70.0),
    }
}

// Pressure (normal: 1000-1025 hPa)
fn generate_pressure(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => {
            if rng.gen_bool(0.5) {
                rng.gen_range(1040.0..1060.0)
            } else {
                rng.gen_range(950.0..980.0)
            }
        }
        Condition::Warning => {
            if rng.gen_bool(0.5) {
                rng.gen_range(1025.0..1040.0)
            } else {
                rng.gen_range(980.0..1000.0)
            }
        }
        Condition::Normal => rng.gen_range(1000.0..1025.0),
    }
}

// Light (normal: 300-700 lux)
fn generate_light(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => rng.gen_range(0.0..10.0),
        Condition::Warning => {
            if rng.gen_bool(0.5) {
                rng.gen_range(10.0..100.0)
            } else {
                rng.gen_range(1000.0..2000.0)
            }
        }
        Condition::Normal => rng.gen_range(300.0..700.0),
    }
}

// Vibration (normal: 0.0-0.5g)
fn generate_vibration(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => rng.gen_range(2.0..5.0),
        Condition::Warning => rng.gen_range(0.5..2.0),
        Condition::Normal => rng.gen_range(0.0..0.5),
    }
}

// Air quality index (normal: 0-50)
fn generate_air_quality(rng: &mut impl Rng, condition: Condition) -> u32 {
    match condition {
        Condition::Critical => rng.gen_range(200..500),
        Condition::Warning => rng.gen_range(100..200),
        Condition::Normal => rng.gen_range(0..50),
    }
}

// Power consumption (normal: 50-500W)
fn generate_power(rng: &mut impl Rng, condition: Condition) -> f64 {
    match condition {
        Condition::Critical => rng.gen_range(1000.0..2000.0),
        Condition::Warning => rng.gen_range(500.0..1000.0),
        Condition::Normal => rng.gen_range(50.0..500.0),
    }
}
