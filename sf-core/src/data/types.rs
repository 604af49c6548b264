//! Shared data types for zones, policies and learned speed tables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Physical fan group addressed by the management controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanZone {
    Chassis,
    Cpu,
}

impl FanZone {
    pub const ALL: [FanZone; 2] = [FanZone::Chassis, FanZone::Cpu];

    /// Zone index used in controller commands (chassis=0, cpu=1)
    pub fn index(self) -> u8 {
        match self {
            FanZone::Chassis => 0,
            FanZone::Cpu => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FanZone::Chassis => "chassis",
            FanZone::Cpu => "cpu",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chassis" | "0" => Some(FanZone::Chassis),
            "cpu" | "1" => Some(FanZone::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for FanZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a zone's temperature is derived from its matched sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperaturePolicy {
    #[default]
    Max,
    Average,
}

impl TemperaturePolicy {
    pub fn combine(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            TemperaturePolicy::Max => values.iter().copied().reduce(f64::max),
            TemperaturePolicy::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
        }
    }
}

/// Curve shape selected in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    #[default]
    Linear,
    Step,
}

/// Observed RPM range of one fan at a learned speed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RpmRange {
    pub min: f64,
    pub max: f64,
}

/// One stable speed found by the learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedSpeedStep {
    /// Speed in percent
    pub threshold: u8,
    /// Byte sent to the controller for this speed
    pub raw: u8,
    #[serde(default)]
    pub fans: BTreeMap<String, RpmRange>,
}

/// Lowest stable speed in a learned table
pub fn learned_floor(steps: &[LearnedSpeedStep]) -> Option<u8> {
    steps.iter().map(|s| s.threshold).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_index_and_parse() {
        assert_eq!(FanZone::Chassis.index(), 0);
        assert_eq!(FanZone::Cpu.index(), 1);
        assert_eq!(FanZone::parse("CPU"), Some(FanZone::Cpu));
        assert_eq!(FanZone::parse("0"), Some(FanZone::Chassis));
        assert_eq!(FanZone::parse("gpu"), None);
    }

    #[test]
    fn test_zone_serde_lowercase() {
        let json = serde_json::to_string(&FanZone::Cpu).unwrap();
        assert_eq!(json, "\"cpu\"");
        let zone: FanZone = serde_json::from_str("\"chassis\"").unwrap();
        assert_eq!(zone, FanZone::Chassis);
    }

    #[test]
    fn test_temperature_policy() {
        let values = [40.0, 52.0, 46.0];
        assert_eq!(TemperaturePolicy::Max.combine(&values), Some(52.0));
        let avg = TemperaturePolicy::Average.combine(&values).unwrap();
        assert!((avg - 46.0).abs() < 1e-9);
        assert_eq!(TemperaturePolicy::Max.combine(&[]), None);
    }

    #[test]
    fn test_learned_floor() {
        let steps = vec![
            LearnedSpeedStep { threshold: 30, raw: 76, fans: BTreeMap::new() },
            LearnedSpeedStep { threshold: 14, raw: 35, fans: BTreeMap::new() },
        ];
        assert_eq!(learned_floor(&steps), Some(14));
        assert_eq!(learned_floor(&[]), None);
    }
}
