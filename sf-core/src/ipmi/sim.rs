//! Simulated management controller
//!
//! Interprets the same dialect table the commander uses, keeps mode and duty
//! state, renders a sensor table, and can inject transport faults. The
//! daemon's `--simulate` flag and the test suites drive the controller
//! through it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::profile::{BoardGeneration, Dialect, DIALECTS};
use super::{BoardIdentitySource, DriveProbe, IpmiTransport};
use crate::data::FanZone;
use sf_error::{Result, SuperfanError};

/// Fault applied to the next transport call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Busy,
    Timeout,
    Disconnected,
    /// Respond with bytes no command expects
    Garbage,
}

/// Speed the simulated controller's own curve runs fans at outside manual mode
const AUTO_PERCENT: u8 = 50;

/// Mode byte for manual control
const MANUAL_MODE: u8 = 0x01;

#[derive(Debug, Clone)]
enum SimSensor {
    Temperature(Option<f64>),
    Fan(Option<f64>),
}

#[derive(Debug, Clone)]
struct FanModel {
    names: Vec<String>,
    stall_below: u8,
    rpm_per_percent: f64,
}

#[derive(Debug)]
struct SimState {
    dialect: &'static Dialect,
    mode: u8,
    duty: [u8; 2],
    pinned: [Option<u8>; 2],
    faults: VecDeque<SimFault>,
    sent: Vec<Vec<u8>>,
    calls: usize,
    mc_info: String,
    sensors: BTreeMap<String, SimSensor>,
    fan_models: BTreeMap<FanZone, FanModel>,
    sdr_override: Option<String>,
}

impl SimState {
    fn take_fault(&mut self) -> Result<Option<Vec<u8>>> {
        self.calls += 1;
        match self.faults.pop_front() {
            None => Ok(None),
            Some(SimFault::Busy) => Err(SuperfanError::TransportBusy(
                "Device or resource busy".into(),
            )),
            Some(SimFault::Timeout) => Err(SuperfanError::Timeout("simulated".into())),
            Some(SimFault::Disconnected) => Err(SuperfanError::Transport(
                "Error in open session".into(),
            )),
            Some(SimFault::Garbage) => Ok(Some(vec![0xde, 0xad])),
        }
    }

    fn zone_slot(&self, zone_byte: u8) -> Option<usize> {
        let index = zone_byte.checked_sub(self.dialect.zone_base)? as usize;
        (index < 2).then_some(index)
    }

    fn duty_percent(&self, slot: usize) -> u8 {
        let raw = self.pinned[slot].unwrap_or(self.duty[slot]) as u32;
        ((raw * 100 + self.dialect.duty_max as u32 / 2) / self.dialect.duty_max as u32) as u8
    }

    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        let d = self.dialect;
        if request == d.mode_get {
            return vec![self.mode];
        }
        if request.len() == d.mode_set.len() + 1 && request.starts_with(d.mode_set) {
            self.mode = request[d.mode_set.len()];
            return Vec::new();
        }
        if request.len() == d.duty_set.len() + 2 && request.starts_with(d.duty_set) {
            if let Some(slot) = self.zone_slot(request[d.duty_set.len()]) {
                self.duty[slot] = request[d.duty_set.len() + 1];
            }
            return Vec::new();
        }
        if request.starts_with(d.duty_get) && request.len() > d.duty_get.len() {
            if let Some(slot) = self.zone_slot(request[d.duty_get.len()]) {
                return vec![self.pinned[slot].unwrap_or(self.duty[slot])];
            }
        }
        Vec::new()
    }

    fn render_sdr(&self) -> String {
        if let Some(text) = &self.sdr_override {
            return text.clone();
        }

        let mut rows: BTreeMap<String, String> = BTreeMap::new();
        for (name, sensor) in &self.sensors {
            let row = match sensor {
                SimSensor::Temperature(Some(v)) => format!("{} degrees C | ok", v),
                SimSensor::Fan(Some(rpm)) => format!("{} RPM | ok", rpm),
                SimSensor::Temperature(None) | SimSensor::Fan(None) => "no reading | ns".to_string(),
            };
            rows.insert(name.clone(), row);
        }
        for (zone, model) in &self.fan_models {
            let percent = if self.mode == MANUAL_MODE {
                self.duty_percent(zone.index() as usize)
            } else {
                AUTO_PERCENT
            };
            let rpm = if percent < model.stall_below {
                0.0
            } else {
                percent as f64 * model.rpm_per_percent
            };
            for name in &model.names {
                rows.insert(name.clone(), format!("{} RPM | ok", rpm));
            }
        }

        rows.iter()
            .map(|(name, row)| format!("{:<16} | {}", name, row))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared view of a [`SimulatedBmc`]'s state
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn set_mc_info(&self, text: &str) {
        self.state.lock().mc_info = text.to_string();
    }

    pub fn set_temperature(&self, name: &str, celsius: f64) {
        self.state
            .lock()
            .sensors
            .insert(name.to_string(), SimSensor::Temperature(Some(celsius)));
    }

    /// Report a temperature sensor as present without a reading
    pub fn set_no_reading(&self, name: &str) {
        self.state
            .lock()
            .sensors
            .insert(name.to_string(), SimSensor::Temperature(None));
    }

    pub fn set_fan(&self, name: &str, rpm: f64) {
        self.state
            .lock()
            .sensors
            .insert(name.to_string(), SimSensor::Fan(Some(rpm)));
    }

    pub fn remove_sensor(&self, name: &str) {
        self.state.lock().sensors.remove(name);
    }

    /// Fans whose RPM follows the zone duty in manual mode and stop below
    /// `stall_below` percent
    pub fn model_fans(&self, zone: FanZone, names: &[&str], stall_below: u8, rpm_per_percent: f64) {
        self.state.lock().fan_models.insert(
            zone,
            FanModel {
                names: names.iter().map(|n| n.to_string()).collect(),
                stall_below,
                rpm_per_percent,
            },
        );
    }

    /// Replace the rendered sensor table with literal text
    pub fn set_sdr_text(&self, text: &str) {
        self.state.lock().sdr_override = Some(text.to_string());
    }

    pub fn inject(&self, fault: SimFault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Make duty reads for a zone return a fixed raw value and ignore writes
    pub fn pin_duty(&self, zone: FanZone, raw: u8) {
        self.state.lock().pinned[zone.index() as usize] = Some(raw);
    }

    pub fn unpin_duty(&self, zone: FanZone) {
        self.state.lock().pinned[zone.index() as usize] = None;
    }

    /// Raw duty byte last written to a zone
    pub fn duty(&self, zone: FanZone) -> u8 {
        self.state.lock().duty[zone.index() as usize]
    }

    /// Current speed of a zone in percent as the controller would report it
    pub fn duty_percent(&self, zone: FanZone) -> u8 {
        self.state.lock().duty_percent(zone.index() as usize)
    }

    pub fn mode(&self) -> u8 {
        self.state.lock().mode
    }

    /// Raw requests received, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    /// Number of duty-set requests received
    pub fn duty_writes(&self) -> usize {
        let state = self.state.lock();
        let prefix = state.dialect.duty_set;
        state
            .sent
            .iter()
            .filter(|r| r.len() == prefix.len() + 2 && r.starts_with(prefix))
            .count()
    }

    /// Transport calls of any kind, including failed ones
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.calls = 0;
    }
}

/// In-memory management controller implementing [`IpmiTransport`]
pub struct SimulatedBmc {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBmc {
    /// Controller speaking the dialect of `generation` (X11 for Unknown),
    /// starting in automatic mode with zero duty
    pub fn new(generation: BoardGeneration) -> (Self, SimHandle) {
        let dialect = DIALECTS
            .iter()
            .find(|d| d.generation == generation)
            .or_else(|| DIALECTS.iter().find(|d| d.generation == BoardGeneration::X11))
            .unwrap_or(&DIALECTS[0]);

        let state = Arc::new(Mutex::new(SimState {
            dialect,
            mode: 0x00,
            duty: [0; 2],
            pinned: [None; 2],
            faults: VecDeque::new(),
            sent: Vec::new(),
            calls: 0,
            mc_info: String::new(),
            sensors: BTreeMap::new(),
            fan_models: BTreeMap::new(),
            sdr_override: None,
        }));
        let handle = SimHandle { state: Arc::clone(&state) };
        (Self { state }, handle)
    }
}

impl IpmiTransport for SimulatedBmc {
    fn raw(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.sent.push(request.to_vec());
        if let Some(garbage) = state.take_fault()? {
            return Ok(garbage);
        }
        Ok(state.handle(request))
    }

    fn sdr_list(&mut self) -> Result<String> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state.render_sdr())
    }

    fn mc_info(&mut self) -> Result<String> {
        let mut state = self.state.lock();
        state.take_fault()?;
        Ok(state.mc_info.clone())
    }
}

/// Fixed baseboard identification text
pub struct StaticIdentity {
    text: Option<String>,
}

impl StaticIdentity {
    pub fn new(text: &str) -> Self {
        Self { text: Some(text.to_string()) }
    }

    /// Identification unavailable, as when dmidecode is missing
    pub fn none() -> Self {
        Self { text: None }
    }
}

impl BoardIdentitySource for StaticIdentity {
    fn baseboard_text(&self) -> Result<String> {
        self.text.clone().ok_or_else(|| SuperfanError::CommandFailed {
            command: "dmidecode".into(),
            reason: "no identification available".into(),
        })
    }
}

/// Fixed set of drives with constant temperatures
pub struct StaticDrives {
    drives: BTreeMap<String, f64>,
}

impl StaticDrives {
    pub fn new(drives: &[(&str, f64)]) -> Self {
        Self {
            drives: drives.iter().map(|(d, t)| (d.to_string(), *t)).collect(),
        }
    }
}

impl DriveProbe for StaticDrives {
    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.drives.keys().cloned().collect())
    }

    fn smart_log(&self, device: &str) -> Result<String> {
        let temp = self.drives.get(device).ok_or_else(|| SuperfanError::CommandFailed {
            command: format!("nvme smart-log {}", device),
            reason: "no such device".into(),
        })?;
        Ok(format!(
            "Smart Log for NVME device:{} namespace-id:ffffffff\n\
             critical_warning                    : 0\n\
             temperature                         : {} C ({} Kelvin)\n\
             available_spare                     : 100%\n",
            device.rsplit('/').next().unwrap_or(device),
            temp,
            (temp + 273.15).round()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_tracks_mode_and_duty() {
        let (mut bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        bmc.raw(&[0x30, 0x45, 0x01, 0x01]).unwrap();
        assert_eq!(bmc.raw(&[0x30, 0x45, 0x00]).unwrap(), vec![0x01]);
        bmc.raw(&[0x30, 0x70, 0x66, 0x01, 0x01, 0x40]).unwrap();
        assert_eq!(bmc.raw(&[0x30, 0x70, 0x66, 0x00, 0x01]).unwrap(), vec![0x40]);
        assert_eq!(handle.duty(FanZone::Cpu), 0x40);
        assert_eq!(handle.duty_writes(), 1);
    }

    #[test]
    fn test_sim_renders_fan_model() {
        let (mut bmc, handle) = SimulatedBmc::new(BoardGeneration::H12);
        handle.model_fans(FanZone::Cpu, &["FANA"], 20, 50.0);
        // automatic mode runs the controller's own speed
        assert!(bmc.sdr_list().unwrap().contains("FANA             | 2500 RPM | ok"));

        bmc.raw(&[0x30, 0x45, 0x01, 0x01]).unwrap();
        bmc.raw(&[0x30, 0x91, 0x5a, 0x03, 0x11, 30]).unwrap();
        assert!(bmc.sdr_list().unwrap().contains("FANA             | 1500 RPM | ok"));
        bmc.raw(&[0x30, 0x91, 0x5a, 0x03, 0x11, 10]).unwrap();
        assert!(bmc.sdr_list().unwrap().contains("| 0 RPM | ok"));
    }

    #[test]
    fn test_sim_faults_consumed_in_order() {
        let (mut bmc, handle) = SimulatedBmc::new(BoardGeneration::X11);
        handle.inject(SimFault::Busy);
        handle.inject(SimFault::Garbage);
        assert!(matches!(bmc.sdr_list(), Err(SuperfanError::TransportBusy(_))));
        assert_eq!(bmc.raw(&[0x30, 0x45, 0x00]).unwrap(), vec![0xde, 0xad]);
        assert_eq!(bmc.raw(&[0x30, 0x45, 0x00]).unwrap(), vec![0x00]);
        assert_eq!(handle.call_count(), 3);
    }

    #[test]
    fn test_static_drives_smart_log() {
        let drives = StaticDrives::new(&[("/dev/nvme0n1", 41.0)]);
        assert_eq!(drives.list_devices().unwrap(), vec!["/dev/nvme0n1".to_string()]);
        let log = drives.smart_log("/dev/nvme0n1").unwrap();
        assert!(log.contains("temperature                         : 41 C (314 Kelvin)"));
        assert!(drives.smart_log("/dev/nvme9n1").is_err());
    }
}
