//! Normalized sensor reading model

use std::time::Instant;

/// Where a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSource {
    ControllerSensor,
    DriveProbe,
}

/// Validity reported alongside a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    Ok,
    Critical,
    NoReading,
}

/// Temperature in Celsius or fan speed in RPM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Fan,
}

/// One immutable observation of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub kind: SensorKind,
    /// Celsius for temperatures, RPM for fans; None when no reading
    pub value: Option<f64>,
    pub source: SensorSource,
    pub state: SensorState,
    /// Correlation token of the request this answered
    pub token: u64,
    pub captured_at: Instant,
}

impl SensorReading {
    /// Whether the reading may feed control statistics
    pub fn is_valid(&self) -> bool {
        self.state != SensorState::NoReading && self.value.is_some()
    }
}
