//! Data types, configuration, and validation modules
//!
//! Contains the configuration document and the types shared across the crate.

mod config;
mod types;
mod validation;

pub use config::{
    default_zones, load_config, load_or_create_config, save_config, secs, Config,
    FanSettings, IpmiSettings, LearnerSettings, SafetySettings, ZoneConfig,
};
pub use types::{
    learned_floor, CurveKind, FanZone, LearnedSpeedStep, RpmRange, TemperaturePolicy,
};
pub use validation::{validate_config, validate_curve_points, validate_percentage};
