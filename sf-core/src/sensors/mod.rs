//! Sensor aggregation
//!
//! - `parser` - controller sensor table and drive health log parsing
//! - `pattern` - glob patterns grouping sensors into zones
//! - `aggregator` - token-checked snapshots, history and statistics

mod aggregator;
mod parser;
mod pattern;
mod reading;

pub use aggregator::{SensorAggregator, SensorStats};
pub use parser::{
    drive_sensor_name, parse_nvme_devices, parse_sdr, parse_smart_log_temperature,
    parse_state, parse_temperature, ParsedReading,
};
pub use pattern::{compile_patterns, matches_any, SensorPattern};
pub use reading::{SensorKind, SensorReading, SensorSource, SensorState};
