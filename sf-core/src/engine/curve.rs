//! Fan curve engine: temperature delta to fan speed
//!
//! # How It Works
//!
//! 1. **Linear**: interpolates between the two points bracketing the delta.
//!    Below the first point the first speed applies, above the last point the last.
//!
//! 2. **Step**: uses the speed of the last point whose threshold is at or below
//!    the delta, or the first point's speed when the delta is below every threshold.
//!
//! 3. **Hysteresis**: wraps another curve and only re-evaluates it once the
//!    delta moved at least `min_delta_change` away from the last accepted delta.
//!    The last accepted delta is owned by the caller (see [`HysteresisState`]).
//!
//! Every result is rounded to a whole percent and clamped to [`SpeedLimits`].

use crate::data::validate_curve_points;
use sf_error::{Result, SuperfanError};

/// A single curve point: degrees above target and the speed to run at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub temp_delta: f64,
    pub speed: f64,
}

/// Fan curve definition
#[derive(Debug, Clone, PartialEq)]
pub enum FanCurve {
    Linear(Vec<CurvePoint>),
    Step(Vec<CurvePoint>),
    Hysteresis {
        inner: Box<FanCurve>,
        min_delta_change: f64,
    },
}

/// Last delta the hysteresis wrapper accepted; one per zone
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HysteresisState {
    last_accepted: Option<f64>,
}

impl HysteresisState {
    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    /// Forget the accepted delta so the next evaluation runs the inner curve
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

/// Output bounds in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedLimits {
    pub min: u8,
    pub max: u8,
}

impl SpeedLimits {
    pub fn new(min: u8, max: u8) -> Self {
        // A floor above the ceiling wins; running too fast is the safe side.
        Self { min, max: max.max(min) }
    }

    pub fn clamp(&self, speed: f64) -> u8 {
        let rounded = if speed.is_finite() { speed.round() } else { self.max as f64 };
        rounded.clamp(self.min as f64, self.max as f64) as u8
    }
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self { min: 0, max: 100 }
    }
}

fn to_points(points: &[(f64, f64)]) -> Result<Vec<CurvePoint>> {
    Ok(validate_curve_points(points)?
        .into_iter()
        .map(|(temp_delta, speed)| CurvePoint { temp_delta, speed })
        .collect())
}

impl FanCurve {
    /// Linear curve from `(temp_delta, speed)` pairs; input order does not matter
    pub fn linear(points: &[(f64, f64)]) -> Result<Self> {
        Ok(FanCurve::Linear(to_points(points)?))
    }

    /// Step curve from `(threshold, speed)` pairs
    pub fn step(points: &[(f64, f64)]) -> Result<Self> {
        Ok(FanCurve::Step(to_points(points)?))
    }

    /// Wrap this curve in hysteresis. Wrapping twice replaces the threshold.
    pub fn with_hysteresis(self, min_delta_change: f64) -> Result<Self> {
        if !min_delta_change.is_finite() || min_delta_change < 0.0 {
            return Err(SuperfanError::InvalidCurve(format!(
                "hysteresis {} must be a non-negative number",
                min_delta_change
            )));
        }
        let inner = match self {
            FanCurve::Hysteresis { inner, .. } => inner,
            other => Box::new(other),
        };
        Ok(FanCurve::Hysteresis { inner, min_delta_change })
    }

    /// Points of the underlying linear or step curve
    pub fn points(&self) -> &[CurvePoint] {
        match self {
            FanCurve::Linear(points) | FanCurve::Step(points) => points,
            FanCurve::Hysteresis { inner, .. } => inner.points(),
        }
    }

    /// Unclamped speed for a delta, ignoring hysteresis
    fn raw_speed(&self, temp_delta: f64) -> f64 {
        match self {
            FanCurve::Linear(points) => interpolate(points, temp_delta),
            FanCurve::Step(points) => step_lookup(points, temp_delta),
            FanCurve::Hysteresis { inner, .. } => inner.raw_speed(temp_delta),
        }
    }
}

fn interpolate(points: &[CurvePoint], temp_delta: f64) -> f64 {
    let (first, last) = match (points.first(), points.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 100.0,
    };

    if temp_delta <= first.temp_delta {
        return first.speed;
    }
    if temp_delta >= last.temp_delta {
        return last.speed;
    }

    for window in points.windows(2) {
        let (p0, p1) = (window[0], window[1]);
        if temp_delta >= p0.temp_delta && temp_delta <= p1.temp_delta {
            let span = p1.temp_delta - p0.temp_delta;
            let ratio = (temp_delta - p0.temp_delta) / span;
            return p0.speed + ratio * (p1.speed - p0.speed);
        }
    }

    last.speed
}

fn step_lookup(points: &[CurvePoint], temp_delta: f64) -> f64 {
    match points.first() {
        Some(first) => points
            .iter()
            .take_while(|p| p.temp_delta <= temp_delta)
            .last()
            .unwrap_or(first)
            .speed,
        None => 100.0,
    }
}

/// Evaluate a curve for a temperature delta.
///
/// `previous_speed` is returned (clamped) when a hysteresis wrapper holds.
pub fn evaluate(
    curve: &FanCurve,
    temp_delta: f64,
    previous_speed: u8,
    state: &mut HysteresisState,
    limits: SpeedLimits,
) -> u8 {
    let temp_delta = if temp_delta.is_finite() { temp_delta.max(0.0) } else { f64::MAX };

    if let FanCurve::Hysteresis { inner, min_delta_change } = curve {
        if let Some(last) = state.last_accepted {
            if (temp_delta - last).abs() < *min_delta_change {
                return limits.clamp(previous_speed as f64);
            }
        }
        state.last_accepted = Some(temp_delta);
        return limits.clamp(inner.raw_speed(temp_delta));
    }

    limits.clamp(curve.raw_speed(temp_delta))
}
