//! Board commander: the only path by which bytes reach the management controller
//!
//! # Guarantees
//! - **One in flight**: the transport sits behind a mutex; every request holds it
//! - **Blacklist first**: blacklisted requests fail with `Rejected` and are never sent
//! - **Unknown boards untouched**: no mode or duty command is built without a dialect
//! - **Transient-only retries**: busy/timeout/transport errors back off and retry,
//!   format and validation errors surface immediately
//! - **Verified writes**: every duty change is read back and compared

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::profile::{AutoMode, BoardGeneration, BoardProfile, FanMode, DIALECTS};
use super::{format_request, BoardIdentitySource, IpmiTransport};
use crate::data::{FanZone, IpmiSettings};
use sf_error::{Result, SuperfanError};

/// Retry schedule for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure; doubles each retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::ipmi::DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(crate::constants::ipmi::DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Read-back verification for duty changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    /// Allowed difference in percent
    pub tolerance: u8,
    /// Extra set-and-read rounds after the first mismatch
    pub retries: u32,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            tolerance: crate::constants::ipmi::DEFAULT_VERIFY_TOLERANCE,
            retries: crate::constants::ipmi::DEFAULT_VERIFY_RETRIES,
        }
    }
}

/// Identify the board family from free-form identification text.
///
/// Prefers `Product Name` lines when present. A marker matches the start of
/// an alphanumeric word and must not be followed by a digit, so `X11SPL-F`
/// matches `x11` while `X110` does not.
pub fn generation_from_text(text: &str) -> Option<BoardGeneration> {
    let product_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.to_ascii_lowercase().contains("product name"))
        .filter_map(|l| l.split_once(':').map(|(_, v)| v))
        .collect();

    if let Some(found) = match_markers(&product_lines.join(" ")) {
        return Some(found);
    }
    match_markers(text)
}

fn match_markers(text: &str) -> Option<BoardGeneration> {
    let lower = text.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    DIALECTS.iter().find_map(|dialect| {
        let hit = dialect.markers.iter().any(|marker| {
            words.iter().any(|word| {
                word.starts_with(marker)
                    && !word[marker.len()..].starts_with(|c: char| c.is_ascii_digit())
            })
        });
        hit.then_some(dialect.generation)
    })
}

/// Serialized access to one management controller
pub struct BoardCommander {
    transport: Mutex<Box<dyn IpmiTransport>>,
    identity: Box<dyn BoardIdentitySource>,
    profile: RwLock<BoardProfile>,
    retry: RetryPolicy,
    verify: VerifyPolicy,
}

impl BoardCommander {
    pub fn new(transport: Box<dyn IpmiTransport>, identity: Box<dyn BoardIdentitySource>) -> Self {
        Self {
            transport: Mutex::new(transport),
            identity,
            profile: RwLock::new(BoardProfile::unknown()),
            retry: RetryPolicy::default(),
            verify: VerifyPolicy::default(),
        }
    }

    /// Apply retry and verification settings from configuration
    pub fn with_settings(self, settings: &IpmiSettings) -> Self {
        self.with_retry(RetryPolicy {
            max_attempts: settings.retry_attempts.max(1),
            base_delay: Duration::from_millis(settings.retry_delay_ms),
        })
        .with_verify(VerifyPolicy {
            tolerance: settings.verify_tolerance,
            retries: settings.verify_retries,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify(mut self, verify: VerifyPolicy) -> Self {
        self.verify = verify;
        self
    }

    /// Current board profile (Unknown until `detect` succeeds)
    pub fn profile(&self) -> BoardProfile {
        *self.profile.read()
    }

    /// Detect the board generation. Calling again re-runs detection.
    ///
    /// Precedence: baseboard identification text, then the controller's
    /// self-reported identity, then Unknown.
    pub fn detect(&self) -> BoardProfile {
        let from_dmi = match self.identity.baseboard_text() {
            Ok(text) => generation_from_text(&text),
            Err(e) => {
                debug!("DETECT: Baseboard identification unavailable: {}", e);
                None
            }
        };

        let generation = from_dmi
            .map(|g| {
                info!(generation = %g, "DETECT: Board identified from baseboard text");
                g
            })
            .or_else(|| match self.with_transport("mc info", |t| t.mc_info()) {
                Ok(text) => generation_from_text(&text).map(|g| {
                    info!(generation = %g, "DETECT: Board identified from controller identity");
                    g
                }),
                Err(e) => {
                    warn!("DETECT: Controller identity unavailable: {}", e);
                    None
                }
            });

        let profile = match generation {
            Some(g) => BoardProfile::for_generation(g),
            None => {
                warn!("DETECT: Board generation unknown; manual fan commands disabled");
                BoardProfile::unknown()
            }
        };

        *self.profile.write() = profile;
        profile
    }

    /// Run one transport operation under the lock with transient retries
    fn with_transport<T>(
        &self,
        label: &str,
        mut op: impl FnMut(&mut dyn IpmiTransport) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = {
                let mut transport = self.transport.lock();
                op(transport.as_mut())
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        command = label,
                        attempt,
                        max_attempts = attempts,
                        "IPMI: Transient failure ({}), retrying in {:?}",
                        e,
                        delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a raw request after blacklist screening
    pub fn send(&self, request: &[u8]) -> Result<Vec<u8>> {
        let label = format_request(request);
        if self.profile().is_blacklisted(request) {
            error!(command = %label, "IPMI: Refusing blacklisted command");
            return Err(SuperfanError::rejected(format!("blacklisted command {}", label)));
        }
        debug!(command = %label, "IPMI: raw");
        self.with_transport(&label, |t| t.raw(request))
    }

    /// Sensor table dump, retried like any other request
    pub fn sensor_dump(&self) -> Result<String> {
        self.with_transport("sdr list", |t| t.sdr_list())
    }

    fn supported_profile(&self, action: &str) -> Result<BoardProfile> {
        let profile = self.profile();
        if !profile.is_supported() {
            return Err(SuperfanError::rejected(format!(
                "{} refused: board generation unknown",
                action
            )));
        }
        Ok(profile)
    }

    /// Read the controller's current fan mode byte
    pub fn get_mode(&self) -> Result<u8> {
        let profile = self.supported_profile("mode read")?;
        let request = profile
            .mode_get_command()
            .ok_or_else(|| SuperfanError::rejected("mode read refused"))?;
        let response = self.send(&request)?;
        match response.as_slice() {
            [mode] if profile.allows_mode(*mode) => Ok(*mode),
            other => Err(SuperfanError::malformed(
                format_request(&request),
                format!("expected one known mode byte, got {:02x?}", other),
            )),
        }
    }

    /// Switch fan mode and confirm it with a mode read
    pub fn set_mode(&self, mode: FanMode) -> Result<()> {
        let profile = self.supported_profile("mode change")?;
        let request = profile
            .mode_set_command(mode)
            .ok_or_else(|| SuperfanError::rejected("mode change refused"))?;
        if !profile.allows_mode(mode.byte()) {
            return Err(SuperfanError::rejected(format!(
                "mode 0x{:02x} not allowed on {}",
                mode.byte(),
                profile.generation
            )));
        }

        self.send(&request)?;
        let observed = self.get_mode()?;
        if observed != mode.byte() {
            return Err(SuperfanError::ModeVerificationFailed {
                requested: mode.byte(),
                observed,
            });
        }
        info!(mode = ?mode, "ACTION: Fan mode set");
        Ok(())
    }

    /// Read a zone's duty as a percentage
    pub fn get_zone_speed(&self, zone: FanZone) -> Result<u8> {
        let profile = self.supported_profile("duty read")?;
        let request = profile
            .duty_get_command(zone)
            .ok_or_else(|| SuperfanError::rejected("duty read refused"))?;
        let response = self.send(&request)?;
        match response.as_slice() {
            [raw] if *raw <= profile.duty_max() => Ok(profile.from_raw(*raw)),
            other => Err(SuperfanError::malformed(
                format_request(&request),
                format!("expected one duty byte <= 0x{:02x}, got {:02x?}", profile.duty_max(), other),
            )),
        }
    }

    /// Set a zone's speed and verify it by reading it back.
    ///
    /// The request is raised to the family floor first; the applied
    /// percentage is returned.
    pub fn set_zone_speed(&self, zone: FanZone, percent: u8) -> Result<u8> {
        if percent > 100 {
            return Err(SuperfanError::InvalidPercentage { value: percent as f64 });
        }
        let profile = self.supported_profile("duty change")?;
        let applied = percent.max(profile.min_speed());
        let request = profile
            .duty_set_command(zone, applied)
            .ok_or_else(|| SuperfanError::rejected("duty change refused"))?;

        let mut observed = applied;
        for round in 0..=self.verify.retries {
            self.send(&request)?;
            observed = self.get_zone_speed(zone)?;
            if observed.abs_diff(applied) <= self.verify.tolerance {
                debug!(zone = %zone, speed = applied, raw = profile.to_raw(applied), "ACTION: Zone speed verified");
                return Ok(applied);
            }
            warn!(
                zone = %zone,
                requested = applied,
                observed,
                round,
                "ACTION: Speed read-back mismatch"
            );
        }

        Err(SuperfanError::VerificationFailed {
            zone: zone.to_string(),
            requested: applied,
            observed,
        })
    }

    /// Return the board to automatic control. Safe to call any number of times.
    ///
    /// A board that was never identified was never taken out of automatic
    /// control, so this is a no-op for it.
    pub fn restore_auto(&self) -> Result<()> {
        if !self.profile().is_supported() {
            debug!("ACTION: Board unknown, automatic control never left");
            return Ok(());
        }
        self.set_mode(FanMode::Auto(AutoMode::Standard))?;
        info!("ACTION: Automatic fan control restored");
        Ok(())
    }

    /// Enter manual mode and return a guard that restores automatic control on drop
    pub fn acquire_manual(self: &Arc<Self>, restore_on_drop: bool) -> Result<ManualControlGuard> {
        if let Err(e) = self.set_mode(FanMode::Manual) {
            if let Err(restore_err) = self.restore_auto() {
                error!("ACTION: Restore after failed manual entry also failed: {}", restore_err);
            }
            return Err(e);
        }
        Ok(ManualControlGuard {
            commander: Arc::clone(self),
            restore_on_drop,
            released: false,
        })
    }
}

/// Scoped manual control; automatic control returns when this is dropped
pub struct ManualControlGuard {
    commander: Arc<BoardCommander>,
    restore_on_drop: bool,
    released: bool,
}

impl ManualControlGuard {
    pub fn commander(&self) -> &Arc<BoardCommander> {
        &self.commander
    }

    /// Restore automatic control now and report the outcome
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.commander.restore_auto()
    }
}

impl Drop for ManualControlGuard {
    fn drop(&mut self) {
        if self.released || !self.restore_on_drop {
            return;
        }
        if let Err(e) = self.commander.restore_auto() {
            error!("SHUTDOWN: Failed to restore automatic fan control: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipmi::sim::{SimFault, SimulatedBmc, StaticIdentity};

    fn commander_for(generation: BoardGeneration) -> (Arc<BoardCommander>, crate::ipmi::sim::SimHandle) {
        let (bmc, handle) = SimulatedBmc::new(generation);
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()))
            .with_retry(RetryPolicy { max_attempts: 3, base_delay: Duration::ZERO });
        *commander.profile.write() = BoardProfile::for_generation(generation);
        (Arc::new(commander), handle)
    }

    #[test]
    fn test_marker_matching() {
        assert_eq!(generation_from_text("Product Name: X11SPL-F"), Some(BoardGeneration::X11));
        assert_eq!(generation_from_text("Product Name: H12SSL-i"), Some(BoardGeneration::H12));
        assert_eq!(generation_from_text("Product Name: X13SAE"), Some(BoardGeneration::X13));
        assert_eq!(generation_from_text("Product Name: X9DRi-LN4+"), Some(BoardGeneration::X9));
        assert_eq!(generation_from_text("Product Name: X10DRW-iT"), Some(BoardGeneration::X10));
        assert_eq!(generation_from_text("Product Name: X99-PRO"), None);
        assert_eq!(generation_from_text("Firmware Revision : 3.88"), None);
    }

    #[test]
    fn test_product_name_line_preferred() {
        let text = "Manufacturer: Supermicro\nProduct Name: X11DPH-T\nVersion: X10 compatible";
        assert_eq!(generation_from_text(text), Some(BoardGeneration::X11));
    }

    #[test]
    fn test_detect_prefers_baseboard_text() {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        handle.set_mc_info("Product Name : X10DRi");
        let commander = BoardCommander::new(
            Box::new(bmc),
            Box::new(StaticIdentity::new("Product Name: X11SCL-F")),
        );
        assert_eq!(commander.detect().generation, BoardGeneration::X11);
        assert_eq!(handle.call_count(), 0);
    }

    #[test]
    fn test_detect_falls_back_to_controller_identity() {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::H12);
        handle.set_mc_info("Device ID : 32\nProduct Name : H12SSL-NT");
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()));
        assert_eq!(commander.detect().generation, BoardGeneration::H12);
    }

    #[test]
    fn test_detect_unknown() {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        handle.set_mc_info("Firmware Revision : 1.71");
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()));
        let profile = commander.detect();
        assert!(!profile.is_supported());
    }

    #[test]
    fn test_blacklisted_command_never_sent() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        let err = commander.send(&[0x06, 0x01]).unwrap_err();
        assert!(matches!(err, SuperfanError::Rejected(_)));
        assert_eq!(handle.call_count(), 0);
    }

    #[test]
    fn test_set_zone_speed_sends_expected_bytes() {
        let (commander, handle) = commander_for(BoardGeneration::X13);
        assert_eq!(commander.set_zone_speed(FanZone::Cpu, 50).unwrap(), 50);
        assert!(handle.sent().contains(&vec![0x30, 0x70, 0x66, 0x01, 0x01, 0x7f]));
        assert_eq!(handle.duty(FanZone::Cpu), 0x7f);
    }

    #[test]
    fn test_set_zone_speed_applies_floor() {
        let (commander, handle) = commander_for(BoardGeneration::H12);
        assert_eq!(commander.set_zone_speed(FanZone::Chassis, 5).unwrap(), 20);
        assert_eq!(handle.duty(FanZone::Chassis), 0x14);
    }

    #[test]
    fn test_busy_is_retried() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        handle.inject(SimFault::Busy);
        handle.inject(SimFault::Busy);
        assert_eq!(commander.get_mode().unwrap(), 0x00);
        assert_eq!(handle.call_count(), 3);
    }

    #[test]
    fn test_retries_exhausted() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        for _ in 0..3 {
            handle.inject(SimFault::Timeout);
        }
        let err = commander.get_mode().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(handle.call_count(), 3);
    }

    #[test]
    fn test_malformed_response_not_retried() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        handle.inject(SimFault::Garbage);
        let err = commander.get_mode().unwrap_err();
        assert!(matches!(err, SuperfanError::MalformedResponse { .. }));
        assert_eq!(handle.call_count(), 1);
    }

    #[test]
    fn test_verification_failure() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        handle.pin_duty(FanZone::Cpu, 0x33);
        let err = commander.set_zone_speed(FanZone::Cpu, 60).unwrap_err();
        match err {
            SuperfanError::VerificationFailed { requested, observed, .. } => {
                assert_eq!(requested, 60);
                assert_eq!(observed, 20);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_board_rejects_without_transport() {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()));
        assert!(matches!(
            commander.set_zone_speed(FanZone::Cpu, 50),
            Err(SuperfanError::Rejected(_))
        ));
        assert!(matches!(commander.set_mode(FanMode::Manual), Err(SuperfanError::Rejected(_))));
        assert!(commander.restore_auto().is_ok());
        assert_eq!(handle.call_count(), 0);
    }

    #[test]
    fn test_restore_auto_idempotent() {
        let (commander, handle) = commander_for(BoardGeneration::X10);
        commander.set_mode(FanMode::Manual).unwrap();
        commander.restore_auto().unwrap();
        commander.restore_auto().unwrap();
        assert_eq!(handle.mode(), 0x00);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        {
            let _guard = commander.acquire_manual(true).unwrap();
            assert_eq!(handle.mode(), 0x01);
        }
        assert_eq!(handle.mode(), 0x00);
    }

    #[test]
    fn test_guard_without_restore_leaves_manual() {
        let (commander, handle) = commander_for(BoardGeneration::X11);
        drop(commander.acquire_manual(false).unwrap());
        assert_eq!(handle.mode(), 0x01);
    }
}
