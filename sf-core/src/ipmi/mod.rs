//! Management controller access
//!
//! - `profile` - board generations and their command dialects (data, not branches)
//! - `commander` - detection, command construction, validation, retries, verification
//! - `sim` - in-memory controller used by tests and dry runs
//!
//! The traits below are the seams to the outside world; `crate::system`
//! implements them on top of `ipmitool`, `dmidecode` and `nvme`.

mod commander;
mod profile;
pub mod sim;

pub use commander::{
    generation_from_text, BoardCommander, ManualControlGuard, RetryPolicy, VerifyPolicy,
};
pub use profile::{AutoMode, BoardGeneration, BoardProfile, Dialect, FanMode, DIALECTS, GLOBAL_BLACKLIST};

use sf_error::Result;

/// Raw byte-level access to the management controller
pub trait IpmiTransport: Send {
    /// Send a raw request (netfn, command, data...) and return the response bytes
    fn raw(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Full sensor table dump in `name | value | state` form
    fn sdr_list(&mut self) -> Result<String>;

    /// Controller self-reported identity
    fn mc_info(&mut self) -> Result<String>;
}

/// Board identification text (baseboard DMI dump)
pub trait BoardIdentitySource: Send + Sync {
    fn baseboard_text(&self) -> Result<String>;
}

/// Drive-level temperature probes
pub trait DriveProbe: Send {
    /// Device paths such as `/dev/nvme0n1`
    fn list_devices(&self) -> Result<Vec<String>>;

    /// Health log text for one device
    fn smart_log(&self, device: &str) -> Result<String>;
}

/// Format a request as `0x30 0x45 0x00` for logs and errors
pub fn format_request(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("0x{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
