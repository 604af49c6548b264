//! Minimum stable speed learner
//!
//! Steps a zone down from its start speed, lets fans settle at each
//! candidate and samples their RPM. A speed is stable when every fan keeps
//! spinning above the stall threshold, stays within tolerance of its running
//! average, and the zone stays below its warning threshold. The first
//! unstable speed reverts to the last stable one and ends the search.
//!
//! Automatic control is restored when learning ends, successfully or not,
//! including when the caller raises the cancel flag.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::constants::learner::CANCEL_POLL_MS;
use crate::control::ControlManager;
use crate::data::{save_config, secs, FanZone, LearnedSpeedStep, LearnerSettings, RpmRange};
use crate::sensors::SensorPattern;
use sf_error::{Result, SuperfanError};

/// Why a candidate speed was rejected
#[derive(Debug, Clone, PartialEq)]
enum Instability {
    Stalled { fan: String, rpm: f64 },
    Drifting { fan: String, rpm: f64, average: f64 },
    FanMissing(String),
    Overheating(f64),
    ReadFailed(String),
}

/// Outcome of sampling one candidate speed
type SampleResult = std::result::Result<BTreeMap<String, RpmRange>, Instability>;

pub struct SpeedLearner<'a> {
    manager: &'a mut ControlManager,
    save_path: Option<PathBuf>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> SpeedLearner<'a> {
    pub fn new(manager: &'a mut ControlManager) -> Self {
        Self { manager, save_path: None, cancel: None }
    }

    /// Persist learned tables into the configuration file at `path`
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Abort the search once `flag` is raised
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                Err(SuperfanError::Cancelled("learning interrupted".into()))
            }
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early when cancelled
    fn pause(&self, duration: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            self.check_cancel()?;
            let left = duration.saturating_sub(started.elapsed());
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(left.min(Duration::from_millis(CANCEL_POLL_MS)));
        }
    }

    /// Learn the speed table of one zone, lowest stable speed last.
    ///
    /// An empty table means not even the start speed was stable.
    pub fn learn(&mut self, zone: FanZone) -> Result<Vec<LearnedSpeedStep>> {
        let settings = self.manager.config().learner.clone();
        let patterns = self
            .manager
            .zone_fan_patterns(zone)
            .map(<[SensorPattern]>::to_vec)
            .unwrap_or_default();
        if patterns.is_empty() {
            return Err(SuperfanError::invalid_config(
                format!("zones.{}.fan_sensors", zone),
                "fan sensors are required for learning",
            ));
        }

        let expected = self.discover_fans(&patterns)?;
        info!(zone = %zone, fans = ?expected, "LEARN: Starting minimum speed search");

        self.manager.begin_learning(zone)?;

        let mut steps = Vec::new();
        let outcome = self.search(zone, &settings, &patterns, &expected, &mut steps);
        let restored = self.manager.end_learning();

        if let Err(source) = outcome {
            if let Err(e) = &restored {
                error!("LEARN: Restoring automatic control failed: {}", e);
            }
            let last_stable = steps.last().map(|s| s.threshold).unwrap_or_else(|| self.start_speed(&settings));
            error!(
                zone = %zone,
                last_stable,
                "LEARN: Aborted, automatic control restored: {}",
                source
            );
            return Err(SuperfanError::LearningAborted { last_stable, source: Box::new(source) });
        }
        restored?;

        if steps.is_empty() {
            warn!(zone = %zone, "LEARN: No stable speed found; nothing stored");
            return Ok(steps);
        }

        if let Some(floor) = steps.last().map(|s| s.threshold) {
            info!(zone = %zone, floor, steps = steps.len(), "LEARN: Minimum stable speed found");
        }
        self.manager.apply_learned(zone, steps.clone());
        if let Some(path) = &self.save_path {
            save_config(self.manager.config(), path)?;
        }
        Ok(steps)
    }

    fn start_speed(&self, settings: &LearnerSettings) -> u8 {
        self.manager
            .config()
            .fans
            .min_speed
            .max(settings.start_speed)
            .max(self.floor(settings))
            .min(100)
    }

    fn floor(&self, settings: &LearnerSettings) -> u8 {
        self.manager
            .commander()
            .profile()
            .min_speed()
            .max(settings.absolute_floor)
    }

    /// Fans the zone currently reports; learning needs at least one
    fn discover_fans(&mut self, patterns: &[SensorPattern]) -> Result<Vec<String>> {
        self.manager.poll_sensors_at(Instant::now())?;
        let names: Vec<String> = self
            .manager
            .aggregator()
            .fan_readings(Some(patterns))
            .into_iter()
            .map(|r| r.name.clone())
            .collect();
        if names.is_empty() {
            return Err(SuperfanError::SensorInvalid(
                "no fan sensors match the zone's fan patterns".into(),
            ));
        }
        Ok(names)
    }

    fn search(
        &mut self,
        zone: FanZone,
        settings: &LearnerSettings,
        patterns: &[SensorPattern],
        expected: &[String],
        steps: &mut Vec<LearnedSpeedStep>,
    ) -> Result<()> {
        let commander = self.manager.commander().clone();
        let profile = commander.profile();
        let floor = self.floor(settings);
        let mut speed = self.start_speed(settings);

        loop {
            self.check_cancel()?;
            let applied = commander.set_zone_speed(zone, speed)?;
            info!(zone = %zone, speed = applied, "LEARN: Testing speed");
            self.pause(secs(settings.settle_time))?;

            match self.sample(zone, settings, patterns, expected)? {
                Ok(fans) => steps.push(LearnedSpeedStep {
                    threshold: applied,
                    raw: profile.to_raw(applied),
                    fans,
                }),
                Err(reason) => {
                    warn!(zone = %zone, speed = applied, reason = ?reason, "LEARN: Speed unstable");
                    if let Some(last) = steps.last() {
                        info!(zone = %zone, speed = last.threshold, "LEARN: Reverting to last stable speed");
                        commander.set_zone_speed(zone, last.threshold)?;
                    }
                    return Ok(());
                }
            }

            let next = applied.saturating_sub(settings.decrement).max(floor);
            if next >= applied {
                return Ok(());
            }
            speed = next;
        }
    }

    fn sample(
        &mut self,
        zone: FanZone,
        settings: &LearnerSettings,
        patterns: &[SensorPattern],
        expected: &[String],
    ) -> Result<SampleResult> {
        let warning_max = self
            .manager
            .zone_config(zone)
            .map(|z| z.warning_max)
            .unwrap_or(f64::INFINITY);
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for i in 0..settings.sample_count() {
            if i > 0 {
                self.pause(secs(settings.sample_interval))?;
            }
            if let Err(e) = self.manager.poll_sensors_at(Instant::now()) {
                return Ok(Err(Instability::ReadFailed(e.to_string())));
            }
            if let Some(t) = self.manager.zone_temperature(zone) {
                if t >= warning_max {
                    return Ok(Err(Instability::Overheating(t)));
                }
            }

            let current: BTreeMap<String, f64> = self
                .manager
                .aggregator()
                .fan_readings(Some(patterns))
                .into_iter()
                .filter_map(|r| r.value.map(|v| (r.name.clone(), v)))
                .collect();

            for fan in expected {
                let Some(&rpm) = current.get(fan) else {
                    return Ok(Err(Instability::FanMissing(fan.clone())));
                };
                if rpm <= settings.stall_rpm {
                    return Ok(Err(Instability::Stalled { fan: fan.clone(), rpm }));
                }
                let history = samples.entry(fan.clone()).or_default();
                if !history.is_empty() {
                    let average = history.iter().sum::<f64>() / history.len() as f64;
                    if (rpm - average).abs() > settings.rpm_tolerance * average {
                        return Ok(Err(Instability::Drifting { fan: fan.clone(), rpm, average }));
                    }
                }
                history.push(rpm);
            }
        }

        Ok(Ok(samples
            .into_iter()
            .map(|(fan, values)| {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (fan, RpmRange { min, max })
            })
            .collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Config;
    use crate::ipmi::sim::{SimHandle, SimulatedBmc, StaticIdentity};
    use crate::ipmi::{BoardCommander, BoardGeneration, RetryPolicy};
    use std::sync::Arc;

    fn learning_config() -> Config {
        let mut config = Config::default();
        config.safety.min_temp_readings = 1;
        config.learner.settle_time = 0.0;
        config.learner.sample_interval = 0.0;
        config.learner.stability_window = 0.0;
        config.learner.min_samples = 2;
        config.learner.start_speed = 30;
        config.learner.decrement = 2;
        config
    }

    fn manager(config: Config) -> (ControlManager, SimHandle) {
        let (bmc, sim) = SimulatedBmc::new(BoardGeneration::X11);
        sim.set_temperature("CPU Temp", 45.0);
        sim.set_temperature("System Temp", 35.0);
        let commander = Arc::new(
            BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::new("Product Name: X11SPL-F")))
                .with_retry(RetryPolicy::none()),
        );
        let manager = ControlManager::new(config, commander, None).unwrap();
        (manager, sim)
    }

    #[test]
    fn test_learns_down_to_stall_and_reverts() {
        let (mut manager, sim) = manager(learning_config());
        sim.model_fans(FanZone::Cpu, &["FANA"], 20, 40.0);

        let steps = SpeedLearner::new(&mut manager).learn(FanZone::Cpu).unwrap();

        let thresholds: Vec<u8> = steps.iter().map(|s| s.threshold).collect();
        assert_eq!(thresholds, vec![30, 28, 26, 24, 22, 20]);
        assert_eq!(steps.last().unwrap().fans["FANA"], RpmRange { min: 800.0, max: 800.0 });
        assert_eq!(manager.zone_floor(FanZone::Cpu), 20);
        assert_eq!(manager.config().learned[&FanZone::Cpu].len(), 6);
        // automatic control restored afterwards
        assert_eq!(sim.mode(), 0x00);
        assert_eq!(*manager.state(), crate::control::ControlState::Normal);
    }

    #[test]
    fn test_stops_at_absolute_floor() {
        let (mut manager, sim) = manager(learning_config());
        sim.model_fans(FanZone::Cpu, &["FANA"], 0, 40.0);

        let steps = SpeedLearner::new(&mut manager).learn(FanZone::Cpu).unwrap();
        // X11 floor 10 dominates the absolute floor of 8
        assert_eq!(steps.last().unwrap().threshold, 10);
    }

    #[test]
    fn test_no_matching_fans_rejected() {
        let (mut manager, _sim) = manager(learning_config());
        let err = SpeedLearner::new(&mut manager).learn(FanZone::Cpu).unwrap_err();
        assert!(matches!(err, SuperfanError::SensorInvalid(_)));
        assert_eq!(*manager.state(), crate::control::ControlState::Normal);
    }

    #[test]
    fn test_hot_zone_stops_immediately() {
        let (mut manager, sim) = manager(learning_config());
        sim.model_fans(FanZone::Cpu, &["FANA"], 0, 40.0);
        sim.set_temperature("CPU Temp", 80.0);

        let steps = SpeedLearner::new(&mut manager).learn(FanZone::Cpu).unwrap();
        assert!(steps.is_empty());
        assert!(manager.config().learned.is_empty());
    }

    #[test]
    fn test_unverified_command_aborts_and_restores() {
        let (mut manager, sim) = manager(learning_config());
        sim.model_fans(FanZone::Cpu, &["FANA"], 0, 40.0);
        sim.pin_duty(FanZone::Cpu, 0x63);

        let err = SpeedLearner::new(&mut manager).learn(FanZone::Cpu).unwrap_err();
        match err {
            SuperfanError::LearningAborted { last_stable, source } => {
                assert_eq!(last_stable, 30);
                assert!(matches!(*source, SuperfanError::VerificationFailed { .. }));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(sim.mode(), 0x00);
        assert!(manager.config().learned.is_empty());
    }

    #[test]
    fn test_cancel_restores_automatic_control() {
        let mut config = learning_config();
        config.learner.settle_time = 30.0;
        let (mut manager, sim) = manager(config);
        sim.model_fans(FanZone::Cpu, &["FANA"], 0, 40.0);
        let cancel = Arc::new(AtomicBool::new(false));

        let raiser = {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                cancel.store(true, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        let err = SpeedLearner::new(&mut manager)
            .with_cancel(Arc::clone(&cancel))
            .learn(FanZone::Cpu)
            .unwrap_err();
        raiser.join().unwrap();

        // woke from the 30 s settle instead of sleeping it out
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            SuperfanError::LearningAborted { last_stable, source } => {
                assert_eq!(last_stable, 30);
                assert!(matches!(*source, SuperfanError::Cancelled(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(sim.mode(), 0x00);
        assert!(manager.config().learned.is_empty());
        assert_eq!(*manager.state(), crate::control::ControlState::Normal);
    }

    #[test]
    fn test_saves_learned_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let (mut manager, sim) = manager(learning_config());
        sim.model_fans(FanZone::Cpu, &["FANA"], 26, 40.0);

        SpeedLearner::new(&mut manager)
            .with_save_path(&path)
            .learn(FanZone::Cpu)
            .unwrap();

        let saved = crate::data::load_config(&path).unwrap();
        assert_eq!(crate::data::learned_floor(&saved.learned[&FanZone::Cpu]), Some(26));
    }
}
