//! JSON configuration for the controller
//!
//! Every field has a default so partial files load. `load_config` validates
//! before returning; `save_config` writes atomically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::{ipmi as ipmi_const, learner as learner_const, safety as safety_const};
use crate::constants::{speed, thermal, timing};
use crate::data::types::{CurveKind, FanZone, LearnedSpeedStep, TemperaturePolicy};
use crate::data::validation::validate_config;
use crate::engine::FanCurve;
use sf_error::{Result, SuperfanError};

/// Convert a seconds value from the config into a Duration
pub fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Top-level configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ipmi: IpmiSettings,
    #[serde(default)]
    pub fans: FanSettings,
    #[serde(default = "default_zones")]
    pub zones: BTreeMap<FanZone, ZoneConfig>,
    #[serde(default)]
    pub safety: SafetySettings,
    #[serde(default)]
    pub learner: LearnerSettings,
    /// Speed tables written back by the learner
    #[serde(default)]
    pub learned: BTreeMap<FanZone, Vec<LearnedSpeedStep>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipmi: IpmiSettings::default(),
            fans: FanSettings::default(),
            zones: default_zones(),
            safety: SafetySettings::default(),
            learner: LearnerSettings::default(),
            learned: BTreeMap::new(),
        }
    }
}

/// Management controller connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpmiSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Allowed difference in percent between requested and read-back speed
    #[serde(default = "default_verify_tolerance")]
    pub verify_tolerance: u8,
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
}

impl IpmiSettings {
    pub fn is_local(&self) -> bool {
        self.host.is_empty() || self.host == ipmi_const::LOCAL_HOST
    }
}

impl Default for IpmiSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            username: String::new(),
            password: String::new(),
            interface: default_interface(),
            command_timeout_ms: default_command_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            verify_tolerance: default_verify_tolerance(),
            verify_retries: default_verify_retries(),
        }
    }
}

/// Loop cadence and speed limits shared by all zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSettings {
    /// Seconds between cycles in steady state
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,
    /// Seconds between cycles while a monitor is attached
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: f64,
    #[serde(default = "default_min_speed")]
    pub min_speed: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed: u8,
    /// Largest change in percent per command
    #[serde(default = "default_ramp_step")]
    pub ramp_step: u8,
    /// Degrees below warning_max required to leave Warning
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f64,
    #[serde(default = "default_min_command_interval")]
    pub min_command_interval: f64,
    #[serde(default)]
    pub temperature_policy: TemperaturePolicy,
}

impl Default for FanSettings {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            monitor_interval: default_monitor_interval(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            ramp_step: default_ramp_step(),
            hysteresis: default_hysteresis(),
            min_command_interval: default_min_command_interval(),
            temperature_policy: TemperaturePolicy::default(),
        }
    }
}

/// Per-zone thresholds, sensor membership and curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub target: f64,
    pub warning_max: f64,
    pub critical_max: f64,
    /// Glob patterns selecting temperature sensors
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Glob patterns selecting fan tachometers in this zone
    #[serde(default)]
    pub fan_sensors: Vec<String>,
    /// `[temp_delta, speed]` pairs
    pub curve: Vec<(f64, f64)>,
    #[serde(default)]
    pub curve_type: CurveKind,
    /// Minimum delta change before the curve is re-evaluated; 0 disables
    #[serde(default = "default_curve_hysteresis")]
    pub curve_hysteresis: f64,
}

impl ZoneConfig {
    /// Build the curve this zone evaluates each cycle
    pub fn build_curve(&self) -> Result<FanCurve> {
        let inner = match self.curve_type {
            CurveKind::Linear => FanCurve::linear(&self.curve)?,
            CurveKind::Step => FanCurve::step(&self.curve)?,
        };
        if self.curve_hysteresis > 0.0 {
            inner.with_hysteresis(self.curve_hysteresis)
        } else {
            Ok(inner)
        }
    }
}

/// Safety supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Seconds without a successful cycle before emergency; also the history window
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: f64,
    #[serde(default = "default_min_temp_readings")]
    pub min_temp_readings: usize,
    #[serde(default = "default_true")]
    pub restore_on_exit: bool,
    /// Seconds temperatures must stay below warning before leaving emergency
    #[serde(default = "default_emergency_timeout")]
    pub emergency_timeout: f64,
    #[serde(default = "default_min_working_fans")]
    pub min_working_fans: usize,
    #[serde(default = "default_sensor_grace_period")]
    pub sensor_grace_period: f64,
    #[serde(default = "default_recovery_verified_commands")]
    pub recovery_verified_commands: usize,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            watchdog_timeout: default_watchdog_timeout(),
            min_temp_readings: default_min_temp_readings(),
            restore_on_exit: true,
            emergency_timeout: default_emergency_timeout(),
            min_working_fans: default_min_working_fans(),
            sensor_grace_period: default_sensor_grace_period(),
            recovery_verified_commands: default_recovery_verified_commands(),
        }
    }
}

/// Minimum-speed learner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSettings {
    /// Speed the search starts from when above `fans.min_speed`
    #[serde(default = "default_learner_start")]
    pub start_speed: u8,
    #[serde(default = "default_decrement")]
    pub decrement: u8,
    #[serde(default = "default_settle_time")]
    pub settle_time: f64,
    #[serde(default = "default_stability_window")]
    pub stability_window: f64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Relative deviation from the running average still considered stable
    #[serde(default = "default_rpm_tolerance")]
    pub rpm_tolerance: f64,
    #[serde(default = "default_stall_rpm")]
    pub stall_rpm: f64,
    #[serde(default = "default_absolute_floor")]
    pub absolute_floor: u8,
}

impl LearnerSettings {
    /// Number of samples taken at each candidate speed
    pub fn sample_count(&self) -> usize {
        let by_window = if self.sample_interval > 0.0 {
            (self.stability_window / self.sample_interval).ceil() as usize
        } else {
            0
        };
        by_window.max(self.min_samples).max(1)
    }
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            start_speed: default_learner_start(),
            decrement: default_decrement(),
            settle_time: default_settle_time(),
            stability_window: default_stability_window(),
            sample_interval: default_sample_interval(),
            min_samples: default_min_samples(),
            rpm_tolerance: default_rpm_tolerance(),
            stall_rpm: default_stall_rpm(),
            absolute_floor: default_absolute_floor(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    ipmi_const::LOCAL_HOST.to_string()
}

fn default_interface() -> String {
    ipmi_const::DEFAULT_INTERFACE.to_string()
}

fn default_command_timeout_ms() -> u64 {
    timing::DEFAULT_COMMAND_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    ipmi_const::DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    ipmi_const::DEFAULT_RETRY_DELAY_MS
}

fn default_verify_tolerance() -> u8 {
    ipmi_const::DEFAULT_VERIFY_TOLERANCE
}

fn default_verify_retries() -> u32 {
    ipmi_const::DEFAULT_VERIFY_RETRIES
}

fn default_polling_interval() -> f64 {
    timing::DEFAULT_POLLING_INTERVAL
}

fn default_monitor_interval() -> f64 {
    timing::DEFAULT_MONITOR_INTERVAL
}

fn default_min_speed() -> u8 {
    speed::DEFAULT_MIN_SPEED
}

fn default_max_speed() -> u8 {
    speed::DEFAULT_MAX_SPEED
}

fn default_ramp_step() -> u8 {
    speed::DEFAULT_RAMP_STEP
}

fn default_hysteresis() -> f64 {
    thermal::DEFAULT_HYSTERESIS
}

fn default_curve_hysteresis() -> f64 {
    2.0
}

fn default_min_command_interval() -> f64 {
    timing::DEFAULT_MIN_COMMAND_INTERVAL
}

fn default_watchdog_timeout() -> f64 {
    safety_const::DEFAULT_WATCHDOG_TIMEOUT
}

fn default_min_temp_readings() -> usize {
    safety_const::DEFAULT_MIN_TEMP_READINGS
}

fn default_emergency_timeout() -> f64 {
    safety_const::DEFAULT_EMERGENCY_TIMEOUT
}

fn default_min_working_fans() -> usize {
    safety_const::DEFAULT_MIN_WORKING_FANS
}

fn default_sensor_grace_period() -> f64 {
    safety_const::DEFAULT_SENSOR_GRACE_PERIOD
}

fn default_recovery_verified_commands() -> usize {
    safety_const::DEFAULT_RECOVERY_VERIFIED_COMMANDS
}

fn default_learner_start() -> u8 {
    30
}

fn default_decrement() -> u8 {
    learner_const::DEFAULT_DECREMENT
}

fn default_settle_time() -> f64 {
    learner_const::DEFAULT_SETTLE_TIME
}

fn default_stability_window() -> f64 {
    learner_const::DEFAULT_STABILITY_WINDOW
}

fn default_sample_interval() -> f64 {
    learner_const::DEFAULT_SAMPLE_INTERVAL
}

fn default_min_samples() -> usize {
    3
}

fn default_rpm_tolerance() -> f64 {
    learner_const::DEFAULT_RPM_TOLERANCE
}

fn default_stall_rpm() -> f64 {
    learner_const::DEFAULT_STALL_RPM
}

fn default_absolute_floor() -> u8 {
    learner_const::DEFAULT_ABSOLUTE_FLOOR
}

/// Default zones: chassis tracks system and peripheral sensors, cpu tracks CPU sensors
pub fn default_zones() -> BTreeMap<FanZone, ZoneConfig> {
    let mut zones = BTreeMap::new();
    zones.insert(
        FanZone::Chassis,
        ZoneConfig {
            enabled: true,
            target: thermal::CHASSIS_TARGET,
            warning_max: thermal::CHASSIS_WARNING_MAX,
            critical_max: thermal::CHASSIS_CRITICAL_MAX,
            sensors: vec![
                "System Temp".to_string(),
                "Peripheral Temp".to_string(),
                "NVMe_*".to_string(),
            ],
            fan_sensors: vec!["FAN[0-9]*".to_string()],
            curve: vec![(0.0, 15.0), (5.0, 25.0), (10.0, 40.0), (15.0, 60.0), (20.0, 100.0)],
            curve_type: CurveKind::Linear,
            curve_hysteresis: default_curve_hysteresis(),
        },
    );
    zones.insert(
        FanZone::Cpu,
        ZoneConfig {
            enabled: true,
            target: thermal::CPU_TARGET,
            warning_max: thermal::CPU_WARNING_MAX,
            critical_max: thermal::CPU_CRITICAL_MAX,
            sensors: vec!["CPU* Temp".to_string()],
            fan_sensors: vec!["FANA*".to_string()],
            curve: vec![(0.0, 20.0), (10.0, 30.0), (20.0, 50.0), (25.0, 75.0), (30.0, 100.0)],
            curve_type: CurveKind::Linear,
            curve_hysteresis: default_curve_hysteresis(),
        },
    );
    zones
}

/// Load and validate a configuration file
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).map_err(|e| SuperfanError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents)?;
    validate_config(&config)?;

    info!(
        "Loaded configuration from {:?} ({} zones, {} learned tables)",
        path,
        config.zones.len(),
        config.learned.len()
    );
    Ok(config)
}

/// Load a configuration file, writing the defaults there if it does not exist
pub fn load_or_create_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!("No configuration at {:?}, writing defaults", path);
        let config = Config::default();
        save_config(&config, path)?;
        return Ok(config);
    }
    load_config(path)
}

/// Save a configuration atomically (temp file + rename)
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    let mut file = fs::File::create(&temp_path).map_err(|e| SuperfanError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    file.write_all(json.as_bytes())
        .map_err(|e| SuperfanError::FileWrite { path: temp_path.clone(), source: e })?;
    file.sync_all()
        .map_err(|e| SuperfanError::FileWrite { path: temp_path.clone(), source: e })?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o644))?;
    }

    fs::rename(&temp_path, path).map_err(|e| SuperfanError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Saved configuration to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "fans": { "polling_interval": 10 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.fans.polling_interval, 10.0);
        assert_eq!(config.fans.ramp_step, speed::DEFAULT_RAMP_STEP);
        assert_eq!(config.zones.len(), 2);
        assert!(config.safety.restore_on_exit);
        assert!(config.learned.is_empty());
    }

    #[test]
    fn test_zone_curve_pairs_parse() {
        let json = r#"{
            "zones": {
                "cpu": {
                    "target": 65, "warning_max": 75, "critical_max": 85,
                    "sensors": ["CPU1 Temp"],
                    "curve": [[0, 20], [10, 30], [20, 50]],
                    "curve_type": "step"
                }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let cpu = &config.zones[&FanZone::Cpu];
        assert_eq!(cpu.curve, vec![(0.0, 20.0), (10.0, 30.0), (20.0, 50.0)]);
        assert_eq!(cpu.curve_type, CurveKind::Step);
        assert!(cpu.enabled);
        assert!(!config.zones.contains_key(&FanZone::Chassis));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("superfan").join("config.json");

        let mut config = Config::default();
        config.fans.min_speed = 12;
        config.learned.insert(
            FanZone::Cpu,
            vec![LearnedSpeedStep { threshold: 14, raw: 35, fans: BTreeMap::new() }],
        );
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = load_or_create_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "fans": { "min_speed": 80, "max_speed": 40 } }"#).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, SuperfanError::InvalidConfig { .. }));
    }

    #[test]
    fn test_sample_count() {
        let mut settings = LearnerSettings::default();
        assert_eq!(settings.sample_count(), 10);
        settings.stability_window = 0.0;
        settings.sample_interval = 0.0;
        assert_eq!(settings.sample_count(), 3);
    }
}
