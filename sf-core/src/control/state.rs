//! Safety state machine states

use std::fmt;
use std::time::Instant;

use crate::data::FanZone;

/// Why the controller entered emergency
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyCause {
    CriticalTemperature { zone: FanZone, temperature: f64 },
    VerificationFailed { zone: FanZone },
    CommandFailed { zone: FanZone, reason: String },
    SensorDataLost { zone: FanZone },
    WatchdogExpired,
    FanFailure { working: usize, required: usize },
}

impl fmt::Display for EmergencyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyCause::CriticalTemperature { zone, temperature } => {
                write!(f, "{} zone at {:.1}°C reached critical", zone, temperature)
            }
            EmergencyCause::VerificationFailed { zone } => {
                write!(f, "{} zone speed change could not be verified", zone)
            }
            EmergencyCause::CommandFailed { zone, reason } => {
                write!(f, "{} zone command failed: {}", zone, reason)
            }
            EmergencyCause::SensorDataLost { zone } => {
                write!(f, "{} zone has had no valid temperature past the grace period", zone)
            }
            EmergencyCause::WatchdogExpired => f.write_str("no successful control cycle within watchdog timeout"),
            EmergencyCause::FanFailure { working, required } => {
                write!(f, "only {} fans spinning, {} required", working, required)
            }
        }
    }
}

/// Controller state
#[derive(Debug, Clone, PartialEq)]
pub enum ControlState {
    Normal,
    Warning,
    Emergency {
        cause: EmergencyCause,
        since: Instant,
        /// Full speed could not be commanded; automatic control was restored instead
        fatal: bool,
    },
    ManualOverride {
        speed: u8,
    },
    Learning {
        zone: FanZone,
    },
    /// Unsupported board; sensors are read, nothing is commanded
    PassiveMonitor,
}

impl ControlState {
    pub fn name(&self) -> &'static str {
        match self {
            ControlState::Normal => "normal",
            ControlState::Warning => "warning",
            ControlState::Emergency { .. } => "emergency",
            ControlState::ManualOverride { .. } => "manual-override",
            ControlState::Learning { .. } => "learning",
            ControlState::PassiveMonitor => "passive-monitor",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, ControlState::Emergency { .. })
    }

    /// Normal or Warning, where curves drive the fans
    pub fn is_curve_driven(&self) -> bool {
        matches!(self, ControlState::Normal | ControlState::Warning)
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlState::Emergency { cause, fatal, .. } => {
                write!(f, "emergency ({}{})", cause, if *fatal { ", fatal" } else { "" })
            }
            ControlState::ManualOverride { speed } => write!(f, "manual-override ({}%)", speed),
            ControlState::Learning { zone } => write!(f, "learning ({})", zone),
            other => f.write_str(other.name()),
        }
    }
}
