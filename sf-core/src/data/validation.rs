//! Input validation for configuration values and curve points
//!
//! Every check returns `InvalidConfig`/`InvalidCurve`/`InvalidPercentage`
//! naming the offending field; none of them are retried.

use crate::constants::speed;
use crate::data::config::Config;
use crate::sensors::SensorPattern;
use sf_error::{Result, SuperfanError};

/// Validates that a percentage is within the valid range (0-100)
pub fn validate_percentage(value: f64) -> Result<u8> {
    if !value.is_finite() || !(0.0..=speed::MAX_PERCENT as f64).contains(&value) {
        return Err(SuperfanError::InvalidPercentage { value });
    }
    Ok(value.round() as u8)
}

/// Validates curve points and returns them sorted by temperature delta
pub fn validate_curve_points(points: &[(f64, f64)]) -> Result<Vec<(f64, f64)>> {
    if points.is_empty() {
        return Err(SuperfanError::InvalidCurve("curve has no points".into()));
    }

    for &(delta, fan_speed) in points {
        if !delta.is_finite() || delta < 0.0 {
            return Err(SuperfanError::InvalidCurve(format!(
                "temperature delta {} must be a non-negative number",
                delta
            )));
        }
        if !fan_speed.is_finite() || !(0.0..=100.0).contains(&fan_speed) {
            return Err(SuperfanError::InvalidCurve(format!(
                "speed {} must be between 0 and 100",
                fan_speed
            )));
        }
    }

    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    if sorted.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(SuperfanError::InvalidCurve("duplicate temperature delta".into()));
    }

    Ok(sorted)
}

fn positive(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(SuperfanError::invalid_config(field, "must be greater than zero"));
    }
    Ok(())
}

fn non_negative(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(SuperfanError::invalid_config(field, "must not be negative"));
    }
    Ok(())
}

/// Validates a whole configuration document
pub fn validate_config(config: &Config) -> Result<()> {
    let fans = &config.fans;
    positive("fans.polling_interval", fans.polling_interval)?;
    positive("fans.monitor_interval", fans.monitor_interval)?;
    non_negative("fans.hysteresis", fans.hysteresis)?;
    non_negative("fans.min_command_interval", fans.min_command_interval)?;

    if fans.max_speed > speed::MAX_PERCENT {
        return Err(SuperfanError::invalid_config("fans.max_speed", "must be at most 100"));
    }
    if fans.min_speed > fans.max_speed {
        return Err(SuperfanError::invalid_config(
            "fans.min_speed",
            format!("{} exceeds max_speed {}", fans.min_speed, fans.max_speed),
        ));
    }
    if fans.ramp_step == 0 {
        return Err(SuperfanError::invalid_config("fans.ramp_step", "must be at least 1"));
    }

    let safety = &config.safety;
    positive("safety.watchdog_timeout", safety.watchdog_timeout)?;
    non_negative("safety.emergency_timeout", safety.emergency_timeout)?;
    non_negative("safety.sensor_grace_period", safety.sensor_grace_period)?;
    if safety.min_temp_readings == 0 {
        return Err(SuperfanError::invalid_config("safety.min_temp_readings", "must be at least 1"));
    }

    if config.zones.values().all(|z| !z.enabled) {
        return Err(SuperfanError::invalid_config("zones", "no zone is enabled"));
    }

    for (zone, zone_cfg) in &config.zones {
        let field = |name: &str| format!("zones.{}.{}", zone, name);

        if !(zone_cfg.target < zone_cfg.warning_max && zone_cfg.warning_max < zone_cfg.critical_max) {
            return Err(SuperfanError::invalid_config(
                field("thresholds"),
                "expected target < warning_max < critical_max",
            ));
        }
        non_negative(&field("curve_hysteresis"), zone_cfg.curve_hysteresis)?;
        validate_curve_points(&zone_cfg.curve)?;

        if zone_cfg.enabled && zone_cfg.sensors.is_empty() {
            return Err(SuperfanError::invalid_config(field("sensors"), "no sensor patterns"));
        }
        for pattern in zone_cfg.sensors.iter().chain(&zone_cfg.fan_sensors) {
            SensorPattern::new(pattern)
                .map_err(|e| SuperfanError::invalid_config(field("sensors"), e.to_string()))?;
        }
    }

    let learner = &config.learner;
    if learner.decrement == 0 {
        return Err(SuperfanError::invalid_config("learner.decrement", "must be at least 1"));
    }
    if !(0.0..1.0).contains(&learner.rpm_tolerance) {
        return Err(SuperfanError::invalid_config("learner.rpm_tolerance", "must be within [0, 1)"));
    }
    non_negative("learner.settle_time", learner.settle_time)?;
    non_negative("learner.stability_window", learner.stability_window)?;
    non_negative("learner.sample_interval", learner.sample_interval)?;

    Ok(())
}
