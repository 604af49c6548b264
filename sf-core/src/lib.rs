//! Superfan Core Library
//!
//! Closed-loop thermal control for Supermicro servers over IPMI.
//!
//! # Features
//!
//! - **Board Profiles**: Per-generation command dialects, speed floors and blacklists as data
//! - **Verified Commands**: Bounded retries for transient failures, read-back verification
//! - **Sensor Aggregation**: Token-correlated snapshots from the controller and NVMe drives
//! - **Fan Curves**: Linear, step and hysteresis curves over temperature above target
//! - **Safety**: Warning/emergency state machine, watchdog, automatic-control restore
//! - **Learning**: Discovery of the lowest stable speed per zone
//!
//! # Module Structure
//!
//! - `ipmi/` - Board dialects, the commander, and a simulated controller
//! - `sensors/` - Sensor table parsing, zone patterns, aggregation
//! - `data/` - Configuration, shared types, validation
//! - `engine/` - Fan curve engine
//! - `control/` - Control manager and safety state machine
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sf_core::{BoardCommander, Config, ControlManager, DmiDecode, IpmitoolTransport};
//!
//! let config = Config::default();
//! let transport = IpmitoolTransport::new(&config.ipmi);
//! let identity = DmiDecode::new(std::time::Duration::from_secs(10));
//! let commander = Arc::new(
//!     BoardCommander::new(Box::new(transport), Box::new(identity)).with_settings(&config.ipmi),
//! );
//! let mut manager = ControlManager::new(config, commander, None).unwrap();
//! let state = manager.run_cycle();
//! ```

// Grouped modules
pub mod control;
pub mod data;
pub mod engine;
pub mod ipmi;
pub mod sensors;

// Standalone modules
pub mod constants;
pub mod learner;
pub mod system;

pub use sf_error::{Result, SuperfanError};

// Re-export configuration
pub use data::{
    default_zones, load_config, load_or_create_config, save_config, validate_config, Config,
    FanSettings, IpmiSettings, LearnerSettings, SafetySettings, ZoneConfig,
};

// Re-export shared types
pub use data::{CurveKind, FanZone, LearnedSpeedStep, RpmRange, TemperaturePolicy};

// Re-export engine types
pub use engine::{evaluate, CurvePoint, FanCurve, HysteresisState, SpeedLimits};

// Re-export controller access
pub use ipmi::{
    BoardCommander, BoardGeneration, BoardIdentitySource, BoardProfile, DriveProbe, FanMode,
    IpmiTransport, ManualControlGuard,
};

// Re-export sensors
pub use sensors::{SensorAggregator, SensorKind, SensorPattern, SensorReading, SensorStats};

// Re-export control
pub use control::{ControlManager, ControlState, ControlStatus, EmergencyCause, StatusHandle};
pub use learner::SpeedLearner;

// Re-export tool-backed implementations
pub use system::{DmiDecode, IpmitoolTransport, NvmeCli};
