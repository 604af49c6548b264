//! Sensor aggregation: one snapshot per control cycle
//!
//! Each snapshot issues a fresh correlation token. A reading is accepted only
//! when its token equals the last token issued for that sensor; anything else
//! is a stale or cross-wired response and is dropped with a warning.
//! Accepted valid readings go into a per-sensor history used for statistics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::parser::{
    drive_sensor_name, parse_nvme_devices, parse_sdr, parse_smart_log_temperature,
};
use super::pattern::{matches_any, SensorPattern};
use super::reading::{SensorKind, SensorReading, SensorSource, SensorState};
use crate::constants::safety::MAX_HISTORY_PER_SENSOR;
use crate::data::{secs, SafetySettings};
use crate::ipmi::{BoardCommander, DriveProbe};
use sf_error::Result;

/// Statistics over the valid readings of one sensor within a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorStats {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Sample standard deviation; 0 for a single reading
    pub stdev: f64,
    pub count: usize,
}

impl SensorStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        let current = *values.last()?;
        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / count as f64;
        let stdev = if count > 1 {
            let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };
        Some(Self { current, min, max, avg, stdev, count })
    }
}

pub struct SensorAggregator {
    commander: Arc<BoardCommander>,
    drives: Option<Box<dyn DriveProbe>>,
    history: HashMap<String, VecDeque<SensorReading>>,
    expected: HashMap<String, u64>,
    latest: BTreeMap<String, SensorReading>,
    token: u64,
    retention: Duration,
    min_readings: usize,
}

impl SensorAggregator {
    pub fn new(
        commander: Arc<BoardCommander>,
        drives: Option<Box<dyn DriveProbe>>,
        safety: &SafetySettings,
    ) -> Self {
        Self {
            commander,
            drives,
            history: HashMap::new(),
            expected: HashMap::new(),
            latest: BTreeMap::new(),
            token: 0,
            retention: secs(safety.watchdog_timeout),
            min_readings: safety.min_temp_readings.max(1),
        }
    }

    /// Window used for statistics and history retention
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Token of the most recent snapshot
    pub fn current_token(&self) -> u64 {
        self.token
    }

    fn issue_token(&mut self) -> u64 {
        self.token = self.token.wrapping_add(1);
        let token = self.token;
        for expected in self.expected.values_mut() {
            *expected = token;
        }
        token
    }

    /// Poll both sources now
    pub fn snapshot(&mut self) -> Result<BTreeMap<String, SensorReading>> {
        self.snapshot_at(Instant::now())
    }

    /// Poll both sources and stamp readings with `now`.
    ///
    /// Drive readings are kept even when the controller dump fails; the
    /// controller error is returned after they are recorded.
    pub fn snapshot_at(&mut self, now: Instant) -> Result<BTreeMap<String, SensorReading>> {
        let token = self.issue_token();
        let mut accepted = BTreeMap::new();

        let controller = self.commander.sensor_dump();
        if let Ok(text) = &controller {
            for parsed in parse_sdr(text, token) {
                let reading = SensorReading {
                    name: parsed.name,
                    kind: parsed.kind,
                    value: parsed.value,
                    source: SensorSource::ControllerSensor,
                    state: parsed.state,
                    token: parsed.token,
                    captured_at: now,
                };
                if self.record(reading.clone()) {
                    accepted.insert(reading.name.clone(), reading);
                }
            }
        }

        for reading in self.poll_drives(token, now) {
            if self.record(reading.clone()) {
                accepted.insert(reading.name.clone(), reading);
            }
        }

        self.prune(now);

        match controller {
            Ok(_) => {
                debug!(token, sensors = accepted.len(), "READ: Sensor snapshot");
                Ok(accepted)
            }
            Err(e) => {
                warn!("READ: Controller sensor dump failed: {}", e);
                Err(e)
            }
        }
    }

    fn poll_drives(&self, token: u64, now: Instant) -> Vec<SensorReading> {
        let Some(probe) = &self.drives else {
            return Vec::new();
        };

        let devices = match probe.list_devices() {
            Ok(devices) => devices,
            Err(e) => {
                debug!("READ: No drives enumerated: {}", e);
                return Vec::new();
            }
        };

        let mut readings = Vec::new();
        for device in devices {
            let value = match probe.smart_log(&device) {
                Ok(text) => parse_smart_log_temperature(&text),
                Err(e) => {
                    warn!(device = %device, "READ: Drive temperature query failed: {}", e);
                    continue;
                }
            };
            readings.push(SensorReading {
                name: drive_sensor_name(&device),
                kind: SensorKind::Temperature,
                value,
                source: SensorSource::DriveProbe,
                state: if value.is_some() { SensorState::Ok } else { SensorState::NoReading },
                token,
                captured_at: now,
            });
        }
        readings
    }

    /// Offer a reading. Returns false when its token does not match the
    /// last token issued for that sensor.
    pub fn record(&mut self, reading: SensorReading) -> bool {
        let expected = *self
            .expected
            .entry(reading.name.clone())
            .or_insert(self.token);
        if reading.token != expected {
            warn!(
                sensor = %reading.name,
                token = reading.token,
                expected,
                "READ: Discarding stale or mismatched response"
            );
            return false;
        }

        if reading.is_valid() {
            let history = self.history.entry(reading.name.clone()).or_default();
            history.push_back(reading.clone());
            while history.len() > MAX_HISTORY_PER_SENSOR {
                history.pop_front();
            }
        } else {
            debug!(sensor = %reading.name, "READ: No reading");
        }
        self.latest.insert(reading.name.clone(), reading);
        true
    }

    fn prune(&mut self, now: Instant) {
        let retention = self.retention;
        for history in self.history.values_mut() {
            while history
                .front()
                .is_some_and(|r| now.saturating_duration_since(r.captured_at) > retention)
            {
                history.pop_front();
            }
        }
        self.history.retain(|_, h| !h.is_empty());
        self.latest
            .retain(|_, r| now.saturating_duration_since(r.captured_at) <= retention);
    }

    /// Statistics for one sensor over readings no older than `window`
    pub fn stats(&self, name: &str, window: Duration) -> Option<SensorStats> {
        self.stats_at(name, window, Instant::now())
    }

    /// As [`stats`](Self::stats) relative to `now`. None when fewer than
    /// the configured minimum readings fall inside the window.
    pub fn stats_at(&self, name: &str, window: Duration, now: Instant) -> Option<SensorStats> {
        let values: Vec<f64> = self
            .history
            .get(name)?
            .iter()
            .filter(|r| now.saturating_duration_since(r.captured_at) <= window)
            .filter_map(|r| r.value)
            .collect();
        if values.len() < self.min_readings {
            return None;
        }
        SensorStats::from_values(&values)
    }

    /// Latest reading per sensor, valid or not
    pub fn latest(&self) -> &BTreeMap<String, SensorReading> {
        &self.latest
    }

    pub fn sensor_names(&self) -> Vec<String> {
        self.latest.keys().cloned().collect()
    }

    /// Valid readings refreshed by the most recent snapshot. Older entries in
    /// `latest` are kept for display only.
    fn current(&self, kind: SensorKind) -> impl Iterator<Item = &SensorReading> + '_ {
        let token = self.token;
        self.latest
            .values()
            .filter(move |r| r.kind == kind && r.token == token && r.is_valid())
    }

    /// Current values of temperature sensors matching any pattern that were
    /// refreshed by the last snapshot and have enough readings in the window
    pub fn matched_temperatures(&self, patterns: &[SensorPattern], now: Instant) -> Vec<(String, f64)> {
        self.current(SensorKind::Temperature)
            .filter(|r| matches_any(patterns, &r.name))
            .filter_map(|r| {
                self.stats_at(&r.name, self.retention, now)
                    .map(|s| (r.name.clone(), s.current))
            })
            .collect()
    }

    /// Valid fan readings of the last snapshot, optionally restricted to patterns
    pub fn fan_readings(&self, patterns: Option<&[SensorPattern]>) -> Vec<&SensorReading> {
        self.current(SensorKind::Fan)
            .filter(|r| patterns.map_or(true, |p| matches_any(p, &r.name)))
            .collect()
    }

    fn valid_temperatures(&self) -> impl Iterator<Item = f64> + '_ {
        self.current(SensorKind::Temperature).filter_map(|r| r.value)
    }

    pub fn highest_temperature(&self) -> Option<f64> {
        self.valid_temperatures().reduce(f64::max)
    }

    pub fn average_temperature(&self) -> Option<f64> {
        let values: Vec<f64> = self.valid_temperatures().collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipmi::sim::{SimFault, SimHandle, SimulatedBmc, StaticDrives, StaticIdentity};
    use crate::ipmi::{BoardGeneration, RetryPolicy};

    fn aggregator(min_readings: usize) -> (SensorAggregator, SimHandle) {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()))
            .with_retry(RetryPolicy::none());
        let safety = SafetySettings {
            min_temp_readings: min_readings,
            watchdog_timeout: 60.0,
            ..SafetySettings::default()
        };
        (SensorAggregator::new(Arc::new(commander), None, &safety), handle)
    }

    #[test]
    fn test_snapshot_collects_readings() {
        let (mut agg, handle) = aggregator(1);
        handle.set_temperature("CPU1 Temp", 52.0);
        handle.set_fan("FAN1", 1200.0);
        handle.set_no_reading("Peripheral Temp");

        let snap = agg.snapshot().unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap["CPU1 Temp"].value, Some(52.0));
        assert_eq!(snap["Peripheral Temp"].state, SensorState::NoReading);
        assert!(agg.stats("Peripheral Temp", Duration::from_secs(60)).is_none());
        assert_eq!(agg.fan_readings(None).len(), 1);
    }

    #[test]
    fn test_stats_over_window() {
        let (mut agg, handle) = aggregator(2);
        let start = Instant::now();
        for (i, temp) in [40.0, 44.0, 48.0].iter().enumerate() {
            handle.set_temperature("CPU1 Temp", *temp);
            agg.snapshot_at(start + Duration::from_secs(i as u64 * 10)).unwrap();
        }
        let now = start + Duration::from_secs(20);
        let stats = agg.stats_at("CPU1 Temp", Duration::from_secs(60), now).unwrap();
        assert_eq!(stats.current, 48.0);
        assert_eq!(stats.min, 40.0);
        assert_eq!(stats.max, 48.0);
        assert!((stats.avg - 44.0).abs() < 1e-9);
        assert!((stats.stdev - 4.0).abs() < 1e-9);

        // Only the last reading is inside a 5 second window
        assert!(agg.stats_at("CPU1 Temp", Duration::from_secs(5), now).is_none());
    }

    #[test]
    fn test_min_readings_required() {
        let (mut agg, handle) = aggregator(2);
        handle.set_temperature("CPU1 Temp", 50.0);
        agg.snapshot().unwrap();
        assert!(agg.stats("CPU1 Temp", Duration::from_secs(60)).is_none());
        agg.snapshot().unwrap();
        assert!(agg.stats("CPU1 Temp", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_mismatched_token_discarded() {
        let (mut agg, handle) = aggregator(1);
        handle.set_temperature("CPU1 Temp", 50.0);
        let now = Instant::now();
        agg.snapshot_at(now).unwrap();
        let before = agg.stats_at("CPU1 Temp", Duration::from_secs(60), now).unwrap();

        let stale = SensorReading {
            name: "CPU1 Temp".into(),
            kind: SensorKind::Temperature,
            value: Some(95.0),
            source: SensorSource::ControllerSensor,
            state: SensorState::Ok,
            token: agg.current_token() - 1,
            captured_at: now,
        };
        assert!(!agg.record(stale));
        let after = agg.stats_at("CPU1 Temp", Duration::from_secs(60), now).unwrap();
        assert_eq!(before, after);
        assert_eq!(agg.latest()["CPU1 Temp"].value, Some(50.0));
    }

    #[test]
    fn test_unexpected_id_line_discards_row() {
        let (mut agg, handle) = aggregator(1);
        handle.set_sdr_text(
            "CPU1 Temp | 45 degrees C | ok\n\
             Received a response with unexpected ID 99\n\
             System Temp | 30 degrees C | ok",
        );
        let snap = agg.snapshot().unwrap();
        assert!(!snap.contains_key("CPU1 Temp"));
        assert!(snap.contains_key("System Temp"));
    }

    #[test]
    fn test_history_pruned_after_retention() {
        let (mut agg, handle) = aggregator(1);
        let start = Instant::now();
        handle.set_temperature("CPU1 Temp", 50.0);
        agg.snapshot_at(start).unwrap();
        handle.remove_sensor("CPU1 Temp");
        agg.snapshot_at(start + Duration::from_secs(120)).unwrap();
        assert!(agg
            .stats_at("CPU1 Temp", Duration::from_secs(600), start + Duration::from_secs(120))
            .is_none());
    }

    #[test]
    fn test_vanished_sensor_not_current() {
        let (mut agg, handle) = aggregator(1);
        let start = Instant::now();
        let cpu = [SensorPattern::new("CPU*").unwrap()];
        handle.set_temperature("CPU1 Temp", 50.0);
        handle.set_fan("FAN1", 1200.0);
        agg.snapshot_at(start).unwrap();
        assert_eq!(agg.matched_temperatures(&cpu, start).len(), 1);

        handle.remove_sensor("CPU1 Temp");
        handle.remove_sensor("FAN1");
        let later = start + Duration::from_secs(5);
        agg.snapshot_at(later).unwrap();

        // still listed for display, but no longer drives anything
        assert_eq!(agg.latest()["CPU1 Temp"].value, Some(50.0));
        assert!(agg.matched_temperatures(&cpu, later).is_empty());
        assert!(agg.fan_readings(None).is_empty());
        assert_eq!(agg.highest_temperature(), None);
    }

    #[test]
    fn test_drive_sensors_synthesized() {
        let (bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        handle.set_temperature("CPU1 Temp", 50.0);
        let commander = BoardCommander::new(Box::new(bmc), Box::new(StaticIdentity::none()));
        let drives = StaticDrives::new(&[("/dev/nvme0n1", 38.0), ("/dev/nvme1n1", 44.0)]);
        let mut agg = SensorAggregator::new(
            Arc::new(commander),
            Some(Box::new(drives)),
            &SafetySettings { min_temp_readings: 1, ..SafetySettings::default() },
        );
        let snap = agg.snapshot().unwrap();
        assert_eq!(snap["NVMe_nvme0n1"].value, Some(38.0));
        assert_eq!(snap["NVMe_nvme1n1"].source, SensorSource::DriveProbe);
        assert_eq!(agg.highest_temperature(), Some(50.0));
        let avg = agg.average_temperature().unwrap();
        assert!((avg - 44.0).abs() < 1e-9);
    }

    #[test]
    fn test_controller_failure_reported() {
        let (mut agg, handle) = aggregator(1);
        handle.inject(SimFault::Disconnected);
        assert!(agg.snapshot().is_err());
    }
}
