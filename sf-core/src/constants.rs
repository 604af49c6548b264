//! Constants and configuration defaults for Superfan
//!
//! Centralizes magic numbers, paths and configuration defaults.
//! Command byte sequences live in the dialect table in `ipmi::profile`.

/// System paths
pub mod paths {
    /// Configuration directory
    pub const CONFIG_DIR: &str = "/etc/superfan";

    /// Default configuration file
    pub const CONFIG_FILE: &str = "/etc/superfan/config.json";

    /// Presence of this socket means journald is available
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";
}

/// External tool names
pub mod tools {
    pub const IPMITOOL: &str = "ipmitool";
    pub const DMIDECODE: &str = "dmidecode";
    pub const NVME: &str = "nvme";
}

/// Fan speed bounds and defaults (percent)
pub mod speed {
    pub const MIN_PERCENT: u8 = 0;
    pub const MAX_PERCENT: u8 = 100;

    /// Speed commanded on every zone during an emergency
    pub const EMERGENCY_PERCENT: u8 = 100;

    pub const DEFAULT_MIN_SPEED: u8 = 5;
    pub const DEFAULT_MAX_SPEED: u8 = 100;
    pub const DEFAULT_RAMP_STEP: u8 = 5;
}

/// Control loop timing defaults (seconds)
pub mod timing {
    pub const DEFAULT_POLLING_INTERVAL: f64 = 30.0;
    pub const DEFAULT_MONITOR_INTERVAL: f64 = 5.0;
    pub const DEFAULT_MIN_COMMAND_INTERVAL: f64 = 5.0;

    /// Maximum wall time for one external tool invocation
    pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

    /// Poll granularity while waiting for a child process
    pub const CHILD_POLL_MS: u64 = 20;

    /// How long to wait for a child's output pipes to close after it exits
    pub const PIPE_DRAIN_MS: u64 = 500;
}

/// Temperature thresholds (Celsius)
pub mod thermal {
    pub const DEFAULT_HYSTERESIS: f64 = 3.0;

    pub const CHASSIS_TARGET: f64 = 40.0;
    pub const CHASSIS_WARNING_MAX: f64 = 60.0;
    pub const CHASSIS_CRITICAL_MAX: f64 = 70.0;

    pub const CPU_TARGET: f64 = 55.0;
    pub const CPU_WARNING_MAX: f64 = 75.0;
    pub const CPU_CRITICAL_MAX: f64 = 85.0;

    /// Offset between Kelvin and Celsius
    pub const KELVIN_OFFSET: f64 = 273.15;
}

/// Safety supervisor defaults
pub mod safety {
    pub const DEFAULT_WATCHDOG_TIMEOUT: f64 = 90.0;
    pub const DEFAULT_MIN_TEMP_READINGS: usize = 2;
    pub const DEFAULT_EMERGENCY_TIMEOUT: f64 = 15.0;
    pub const DEFAULT_SENSOR_GRACE_PERIOD: f64 = 60.0;
    pub const DEFAULT_RECOVERY_VERIFIED_COMMANDS: usize = 2;
    pub const DEFAULT_MIN_WORKING_FANS: usize = 2;

    /// RPM at or below which a fan counts as stopped
    pub const FAN_STOPPED_RPM: f64 = 100.0;

    /// Upper bound on readings kept per sensor
    pub const MAX_HISTORY_PER_SENSOR: usize = 512;
}

/// Management controller transport defaults
pub mod ipmi {
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_VERIFY_TOLERANCE: u8 = 2;
    pub const DEFAULT_VERIFY_RETRIES: u32 = 2;
    pub const DEFAULT_INTERFACE: &str = "lanplus";
    pub const LOCAL_HOST: &str = "localhost";
}

/// Minimum-speed learner defaults
pub mod learner {
    pub const DEFAULT_DECREMENT: u8 = 2;
    pub const DEFAULT_SETTLE_TIME: f64 = 5.0;
    pub const DEFAULT_STABILITY_WINDOW: f64 = 10.0;
    pub const DEFAULT_SAMPLE_INTERVAL: f64 = 1.0;

    /// Granularity of learner sleeps while watching for cancellation
    pub const CANCEL_POLL_MS: u64 = 100;

    /// Allowed relative deviation from the running RPM average
    pub const DEFAULT_RPM_TOLERANCE: f64 = 0.15;

    /// RPM below which a fan is considered stalled
    pub const DEFAULT_STALL_RPM: f64 = 100.0;

    /// Never probe below this speed
    pub const DEFAULT_ABSOLUTE_FLOOR: u8 = 8;
}
