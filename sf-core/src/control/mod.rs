//! Closed-loop control
//!
//! - `state` - safety state machine states and emergency causes
//! - `manager` - the per-cycle evaluate-decide-act loop
//! - `status` - snapshots published for readers

mod manager;
mod state;
mod status;

pub use manager::ControlManager;
pub use state::{ControlState, EmergencyCause};
pub use status::{ControlStatus, StatusHandle, ZoneStatus};
