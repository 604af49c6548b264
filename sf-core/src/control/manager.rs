//! Control manager: the evaluate-decide-act loop and its safety supervisor
//!
//! # Per cycle
//! 1. **Watchdog**: no successful cycle within `watchdog_timeout` means emergency
//! 2. **Poll**: one sensor snapshot, zone temperatures from matched sensors
//! 3. **Triggers**: critical temperature, sensor loss past grace, stopped fans
//! 4. **Act**: emergency full speed, pinned manual speed, or curve + floor + ramp
//! 5. **Publish**: an immutable status snapshot for readers
//!
//! All mutable control state lives here; nothing is global.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::state::{ControlState, EmergencyCause};
use super::status::{ControlStatus, StatusHandle, ZoneStatus};
use crate::constants::{safety as safety_const, speed};
use crate::data::{learned_floor, secs, validate_config, Config, FanZone, LearnedSpeedStep, ZoneConfig};
use crate::engine::{evaluate, FanCurve, HysteresisState, SpeedLimits};
use crate::ipmi::{BoardCommander, DriveProbe, ManualControlGuard};
use crate::sensors::{compile_patterns, SensorAggregator, SensorPattern, SensorReading};
use sf_error::{Result, SuperfanError};

/// Outcomes kept for the recovery check
const OUTCOME_HISTORY: usize = 32;

/// Runtime state of one zone
struct ZoneRuntime {
    config: ZoneConfig,
    curve: FanCurve,
    sensors: Vec<SensorPattern>,
    fan_sensors: Vec<SensorPattern>,
    hysteresis: HysteresisState,
    /// Last curve output; ramping moves the commanded speed toward it
    target: Option<u8>,
    commanded: Option<u8>,
    last_change: Option<Instant>,
    pending: Option<u8>,
    temperature: Option<f64>,
    unavailable_since: Option<Instant>,
    learned_floor: Option<u8>,
}

impl ZoneRuntime {
    fn new(config: &ZoneConfig, learned: Option<&Vec<LearnedSpeedStep>>) -> Result<Self> {
        Ok(Self {
            curve: config.build_curve()?,
            sensors: compile_patterns(&config.sensors)?,
            fan_sensors: compile_patterns(&config.fan_sensors)?,
            config: config.clone(),
            hysteresis: HysteresisState::default(),
            target: None,
            commanded: None,
            last_change: None,
            pending: None,
            temperature: None,
            unavailable_since: None,
            learned_floor: learned.and_then(|steps| learned_floor(steps)),
        })
    }

    fn reset_curve(&mut self) {
        self.hysteresis.reset();
        self.target = None;
        self.pending = None;
    }
}

/// Move `current` toward `target` by at most `step`
fn ramp_toward(current: u8, target: u8, step: u8) -> u8 {
    if target > current {
        current.saturating_add(step).min(target)
    } else {
        current.saturating_sub(step).max(target)
    }
}

pub struct ControlManager {
    config: Config,
    commander: Arc<BoardCommander>,
    aggregator: SensorAggregator,
    zones: BTreeMap<FanZone, ZoneRuntime>,
    state: ControlState,
    guard: Option<ManualControlGuard>,
    started_at: Instant,
    last_good_cycle: Option<Instant>,
    /// Recent speed command outcomes, true when verified
    outcomes: VecDeque<bool>,
    calm_since: Option<Instant>,
    status: StatusHandle,
    cycles: u64,
}

impl ControlManager {
    /// Validate configuration, detect the board and prepare zones.
    ///
    /// An unidentified board selects `PassiveMonitor` for the life of the manager.
    pub fn new(
        config: Config,
        commander: Arc<BoardCommander>,
        drives: Option<Box<dyn DriveProbe>>,
    ) -> Result<Self> {
        validate_config(&config)?;

        let mut zones = BTreeMap::new();
        for (zone, zone_cfg) in config.zones.iter().filter(|(_, z)| z.enabled) {
            zones.insert(*zone, ZoneRuntime::new(zone_cfg, config.learned.get(zone))?);
        }

        let profile = commander.detect();
        let state = if profile.is_supported() {
            info!(
                board = %profile.generation,
                floor = profile.min_speed(),
                zones = zones.len(),
                "STARTUP: Control manager ready"
            );
            ControlState::Normal
        } else {
            error!("STARTUP: Unsupported board; entering passive monitoring, fans stay under automatic control");
            ControlState::PassiveMonitor
        };

        let aggregator = SensorAggregator::new(Arc::clone(&commander), drives, &config.safety);
        let status = StatusHandle::new(ControlStatus::initial(state.clone(), profile.generation));

        Ok(Self {
            config,
            commander,
            aggregator,
            zones,
            state,
            guard: None,
            started_at: Instant::now(),
            last_good_cycle: None,
            outcomes: VecDeque::new(),
            calm_since: None,
            status,
            cycles: 0,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn commander(&self) -> &Arc<BoardCommander> {
        &self.commander
    }

    pub fn aggregator(&self) -> &SensorAggregator {
        &self.aggregator
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn zone_speed(&self, zone: FanZone) -> Option<u8> {
        self.zones.get(&zone).and_then(|z| z.commanded)
    }

    pub fn zone_temperature(&self, zone: FanZone) -> Option<f64> {
        self.zones.get(&zone).and_then(|z| z.temperature)
    }

    pub fn zone_config(&self, zone: FanZone) -> Option<&ZoneConfig> {
        self.zones.get(&zone).map(|z| &z.config)
    }

    pub fn zone_fan_patterns(&self, zone: FanZone) -> Option<&[SensorPattern]> {
        self.zones.get(&zone).map(|z| z.fan_sensors.as_slice())
    }

    /// Lowest speed this zone may run at: configured minimum, board floor, learned floor
    pub fn zone_floor(&self, zone: FanZone) -> u8 {
        let learned = self.zones.get(&zone).and_then(|z| z.learned_floor).unwrap_or(0);
        self.config
            .fans
            .min_speed
            .max(self.commander.profile().min_speed())
            .max(learned)
    }

    /// Delay between cycles; the faster cadence applies while a monitor is attached
    pub fn poll_interval(&self, monitoring: bool) -> Duration {
        if monitoring {
            secs(self.config.fans.monitor_interval)
        } else {
            secs(self.config.fans.polling_interval)
        }
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    pub fn run_cycle(&mut self) -> Result<ControlState> {
        self.run_cycle_at(Instant::now())
    }

    /// Run one cycle as of `now`.
    ///
    /// Returns the state after the cycle, or the sensor poll error when no
    /// fresh data could be read (safety handling has already run).
    pub fn run_cycle_at(&mut self, now: Instant) -> Result<ControlState> {
        self.cycles += 1;

        if self.state == ControlState::PassiveMonitor {
            let poll = self.poll_sensors_at(now).map(|_| ());
            if poll.is_ok() {
                self.last_good_cycle = Some(now);
            }
            self.publish(now);
            return poll.map(|_| self.state.clone());
        }

        let learning = matches!(self.state, ControlState::Learning { .. });
        let watchdog = secs(self.config.safety.watchdog_timeout);
        let last_good = self.last_good_cycle.unwrap_or(self.started_at);
        if !learning && !self.state.is_emergency() && now.saturating_duration_since(last_good) > watchdog {
            self.enter_emergency(EmergencyCause::WatchdogExpired, now);
        }

        let poll = self.poll_sensors_at(now);
        if let Err(e) = &poll {
            warn!("CONTROL: Sensor poll failed: {}", e);
        }

        if !learning {
            self.check_triggers(now);
            match self.state.clone() {
                ControlState::Emergency { .. } => self.run_emergency(now),
                ControlState::ManualOverride { speed } => self.apply_manual(speed, now),
                ControlState::Normal | ControlState::Warning => {
                    self.update_warning();
                    self.drive_zones(now);
                }
                ControlState::Learning { .. } | ControlState::PassiveMonitor => {}
            }
        }

        if poll.is_ok() {
            self.last_good_cycle = Some(now);
        }
        self.publish(now);
        poll.map(|_| self.state.clone())
    }

    /// Take a sensor snapshot and refresh zone temperatures
    pub(crate) fn poll_sensors_at(&mut self, now: Instant) -> Result<BTreeMap<String, SensorReading>> {
        let snapshot = self.aggregator.snapshot_at(now);

        let policy = self.config.fans.temperature_policy;
        for (zone, rt) in self.zones.iter_mut() {
            let values: Vec<f64> = self
                .aggregator
                .matched_temperatures(&rt.sensors, now)
                .into_iter()
                .map(|(_, t)| t)
                .collect();
            rt.temperature = policy.combine(&values);
            match rt.temperature {
                Some(_) => rt.unavailable_since = None,
                None => {
                    if rt.unavailable_since.is_none() {
                        warn!(zone = %zone, "READ: No valid temperature for zone");
                        rt.unavailable_since = Some(now);
                    }
                }
            }
        }

        snapshot
    }

    fn check_triggers(&mut self, now: Instant) {
        if self.state.is_emergency() || matches!(self.state, ControlState::Learning { .. }) {
            return;
        }

        let critical = self.zones.iter().find_map(|(zone, rt)| {
            rt.temperature
                .filter(|t| *t >= rt.config.critical_max)
                .map(|temperature| EmergencyCause::CriticalTemperature { zone: *zone, temperature })
        });
        if let Some(cause) = critical {
            self.enter_emergency(cause, now);
            return;
        }

        let grace = secs(self.config.safety.sensor_grace_period);
        let lost = self.zones.iter().find_map(|(zone, rt)| {
            rt.unavailable_since
                .filter(|since| now.saturating_duration_since(*since) > grace)
                .map(|_| EmergencyCause::SensorDataLost { zone: *zone })
        });
        if let Some(cause) = lost {
            self.enter_emergency(cause, now);
            return;
        }

        if let Some(cause) = self.fan_failure() {
            self.enter_emergency(cause, now);
        }
    }

    /// Fewer spinning fans than required, when the controller reports fans at all
    fn fan_failure(&self) -> Option<EmergencyCause> {
        let fans = self.aggregator.fan_readings(None);
        if fans.is_empty() {
            return None;
        }
        let working = fans
            .iter()
            .filter(|r| r.value.is_some_and(|rpm| rpm > safety_const::FAN_STOPPED_RPM))
            .count();
        let required = self.config.safety.min_working_fans.min(fans.len());
        (working < required).then_some(EmergencyCause::FanFailure { working, required })
    }

    fn update_warning(&mut self) {
        match self.state {
            ControlState::Normal => {
                let hot = self.zones.iter().find(|(_, rt)| {
                    rt.temperature.is_some_and(|t| t >= rt.config.warning_max)
                });
                if let Some((zone, rt)) = hot {
                    warn!(
                        zone = %zone,
                        temperature = rt.temperature.unwrap_or_default(),
                        warning_max = rt.config.warning_max,
                        "CONTROL: Entering warning"
                    );
                    self.state = ControlState::Warning;
                }
            }
            ControlState::Warning => {
                let margin = self.config.fans.hysteresis;
                let cooled = self.zones.values().all(|rt| {
                    rt.temperature.is_some_and(|t| t < rt.config.warning_max - margin)
                });
                if cooled {
                    info!("CONTROL: All zones below warning threshold, back to normal");
                    self.state = ControlState::Normal;
                }
            }
            _ => {}
        }
    }

    fn drive_zones(&mut self, now: Instant) {
        let zones: Vec<FanZone> = self.zones.keys().copied().collect();
        for zone in zones {
            if let Err(e) = self.drive_zone(zone, now) {
                self.on_command_failure(zone, e, now);
                return;
            }
        }
    }

    fn drive_zone(&mut self, zone: FanZone, now: Instant) -> Result<()> {
        let floor = self.zone_floor(zone);
        let max = self.config.fans.max_speed;
        let ramp = self.config.fans.ramp_step;
        let interval = secs(self.config.fans.min_command_interval);

        let Some(rt) = self.zones.get_mut(&zone) else {
            return Ok(());
        };
        let Some(temperature) = rt.temperature else {
            return Ok(());
        };

        let delta = (temperature - rt.config.target).max(0.0);
        let previous = rt.target.unwrap_or(floor);
        let target = evaluate(&rt.curve, delta, previous, &mut rt.hysteresis, SpeedLimits::new(floor, max));
        rt.target = Some(target);

        let next = match rt.commanded {
            Some(current) => ramp_toward(current, target, ramp).max(floor),
            None => target,
        };

        if rt.commanded == Some(next) {
            rt.pending = None;
            return Ok(());
        }

        if let Some(last) = rt.last_change {
            if now.saturating_duration_since(last) < interval {
                if rt.pending != Some(next) {
                    debug!(zone = %zone, speed = next, "CONTROL: Change deferred by minimum command interval");
                }
                rt.pending = Some(next);
                return Ok(());
            }
        }

        debug!(zone = %zone, temperature, delta, target, speed = next, "CONTROL: Curve decision");
        self.command_zone(zone, next, now)
    }

    /// Enter manual mode if needed, send one verified speed change and record it
    fn command_zone(&mut self, zone: FanZone, percent: u8, now: Instant) -> Result<()> {
        self.ensure_manual()?;

        let result = self.commander.set_zone_speed(zone, percent);
        self.outcomes.push_back(result.is_ok());
        while self.outcomes.len() > OUTCOME_HISTORY {
            self.outcomes.pop_front();
        }
        let applied = result?;

        if let Some(rt) = self.zones.get_mut(&zone) {
            if rt.commanded != Some(applied) {
                info!(zone = %zone, speed = applied, "ACTION: Zone speed set");
            }
            rt.commanded = Some(applied);
            rt.last_change = Some(now);
            rt.pending = None;
        }
        Ok(())
    }

    fn ensure_manual(&mut self) -> Result<()> {
        if self.guard.is_none() {
            let guard = self
                .commander
                .acquire_manual(self.config.safety.restore_on_exit)?;
            info!("ACTION: Manual fan control acquired");
            self.guard = Some(guard);
        }
        Ok(())
    }

    fn on_command_failure(&mut self, zone: FanZone, err: SuperfanError, now: Instant) {
        error!(zone = %zone, "ACTION: Speed change failed: {}", err);
        let cause = match err {
            SuperfanError::VerificationFailed { .. } => EmergencyCause::VerificationFailed { zone },
            other => EmergencyCause::CommandFailed { zone, reason: other.to_string() },
        };
        if !self.state.is_emergency() {
            self.enter_emergency(cause, now);
            self.run_emergency(now);
        }
    }

    // ========================================================================
    // Emergency
    // ========================================================================

    fn enter_emergency(&mut self, cause: EmergencyCause, now: Instant) {
        if self.state.is_emergency() {
            return;
        }
        error!(previous = %self.state, "EMERGENCY: {}", cause);
        self.state = ControlState::Emergency { cause, since: now, fatal: false };
        self.calm_since = None;
        for rt in self.zones.values_mut() {
            rt.reset_curve();
        }
    }

    /// Full speed on every zone without ramping; on failure hand the board back
    /// to automatic control and mark the emergency fatal
    fn run_emergency(&mut self, now: Instant) {
        if !matches!(self.state, ControlState::Emergency { fatal: false, .. }) {
            return;
        }

        let zones: Vec<FanZone> = self.zones.keys().copied().collect();
        for zone in zones {
            if let Err(e) = self.command_zone(zone, speed::EMERGENCY_PERCENT, now) {
                error!(zone = %zone, "EMERGENCY: Full speed could not be commanded: {}", e);
                if let Err(restore_err) = self.restore_automatic() {
                    error!("EMERGENCY: Restoring automatic control failed too: {}", restore_err);
                }
                if let ControlState::Emergency { fatal, .. } = &mut self.state {
                    *fatal = true;
                }
                return;
            }
        }

        self.check_recovery(now);
    }

    fn check_recovery(&mut self, now: Instant) {
        let calm = !self.zones.is_empty()
            && self
                .zones
                .values()
                .all(|rt| rt.temperature.is_some_and(|t| t < rt.config.warning_max))
            && self.fan_failure().is_none();

        if !calm {
            self.calm_since = None;
            return;
        }

        let since = *self.calm_since.get_or_insert(now);
        let dwell = secs(self.config.safety.emergency_timeout);
        if now.saturating_duration_since(since) < dwell {
            return;
        }

        let needed = self.config.safety.recovery_verified_commands;
        let verified = self.outcomes.len() >= needed && self.outcomes.iter().rev().take(needed).all(|ok| *ok);
        if !verified {
            debug!("EMERGENCY: Waiting for {} verified commands before recovery", needed);
            return;
        }

        info!("RECOVERY: Temperatures below warning for {:?}; resuming normal control", dwell);
        self.state = ControlState::Normal;
        self.calm_since = None;
        for rt in self.zones.values_mut() {
            rt.reset_curve();
        }
    }

    fn restore_automatic(&mut self) -> Result<()> {
        let result = match self.guard.take() {
            Some(guard) => guard.release(),
            None => self.commander.restore_auto(),
        };
        for rt in self.zones.values_mut() {
            rt.commanded = None;
            rt.last_change = None;
            rt.reset_curve();
        }
        result
    }

    // ========================================================================
    // Manual override and learning
    // ========================================================================

    fn apply_manual(&mut self, requested: u8, now: Instant) {
        let zones: Vec<FanZone> = self.zones.keys().copied().collect();
        for zone in zones {
            let pinned = requested.max(self.zone_floor(zone)).min(speed::MAX_PERCENT);
            if self.zone_speed(zone) == Some(pinned) {
                continue;
            }
            if let Err(e) = self.command_zone(zone, pinned, now) {
                self.on_command_failure(zone, e, now);
                return;
            }
        }
    }

    /// Pin every zone to `speed` (raised to each zone's floor) until released
    pub fn request_manual_override(&mut self, speed: u8) -> Result<()> {
        if speed > speed::MAX_PERCENT {
            return Err(SuperfanError::InvalidPercentage { value: speed as f64 });
        }
        match self.state {
            ControlState::Normal | ControlState::Warning | ControlState::ManualOverride { .. } => {
                info!(speed, "CONTROL: Manual override engaged");
                self.state = ControlState::ManualOverride { speed };
                Ok(())
            }
            ref other => Err(SuperfanError::rejected(format!(
                "manual override not available while {}",
                other
            ))),
        }
    }

    pub fn release_manual_override(&mut self) {
        if let ControlState::ManualOverride { .. } = self.state {
            info!("CONTROL: Manual override released");
            self.state = ControlState::Normal;
            for rt in self.zones.values_mut() {
                rt.reset_curve();
            }
        }
    }

    /// Hand a zone to the speed learner
    pub fn begin_learning(&mut self, zone: FanZone) -> Result<()> {
        if !self.state.is_curve_driven() {
            return Err(SuperfanError::rejected(format!(
                "learning not available while {}",
                self.state
            )));
        }
        if !self.zones.contains_key(&zone) {
            return Err(SuperfanError::invalid_config(
                format!("zones.{}", zone),
                "zone is not configured or disabled",
            ));
        }
        self.ensure_manual()?;
        info!(zone = %zone, "CONTROL: Learning started");
        self.state = ControlState::Learning { zone };
        Ok(())
    }

    /// Restore automatic control and return to normal after learning
    pub fn end_learning(&mut self) -> Result<()> {
        if !matches!(self.state, ControlState::Learning { .. }) {
            return Ok(());
        }
        let result = self.restore_automatic();
        self.state = ControlState::Normal;
        info!("CONTROL: Learning finished");
        result
    }

    /// Store a learned speed table and raise the zone's floor accordingly
    pub fn apply_learned(&mut self, zone: FanZone, steps: Vec<LearnedSpeedStep>) {
        if let Some(rt) = self.zones.get_mut(&zone) {
            rt.learned_floor = learned_floor(&steps);
        }
        self.config.learned.insert(zone, steps);
    }

    /// Release manual control, restoring automatic control when configured
    pub fn shutdown(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(guard) if self.config.safety.restore_on_exit => {
                info!("SHUTDOWN: Restoring automatic fan control");
                guard.release()
            }
            Some(guard) => {
                warn!("SHUTDOWN: restore_on_exit disabled; leaving fans under manual control");
                drop(guard);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn publish(&self, now: Instant) {
        let zones = self
            .zones
            .iter()
            .map(|(zone, rt)| {
                (
                    *zone,
                    ZoneStatus {
                        temperature: rt.temperature,
                        commanded: rt.commanded,
                        pending: rt.pending,
                        floor: self.zone_floor(*zone),
                    },
                )
            })
            .collect();

        self.status.publish(ControlStatus {
            state: self.state.clone(),
            board: self.commander.profile().generation,
            zones,
            readings: self.aggregator.latest().values().cloned().collect(),
            cycle_at: Some(now),
            cycles: self.cycles,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_toward() {
        assert_eq!(ramp_toward(30, 70, 5), 35);
        assert_eq!(ramp_toward(30, 32, 5), 32);
        assert_eq!(ramp_toward(30, 10, 5), 25);
        assert_eq!(ramp_toward(3, 0, 5), 0);
        assert_eq!(ramp_toward(250, 255, 10), 255);
    }
}
