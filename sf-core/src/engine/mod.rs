//! Fan control engine modules
//!
//! Contains the fan curve engine.

mod curve;

pub use curve::{evaluate, CurvePoint, FanCurve, HysteresisState, SpeedLimits};
