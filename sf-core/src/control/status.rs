//! Published controller status for concurrent readers

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::state::ControlState;
use crate::data::FanZone;
use crate::ipmi::BoardGeneration;
use crate::sensors::SensorReading;

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneStatus {
    pub temperature: Option<f64>,
    pub commanded: Option<u8>,
    /// Decision waiting for the minimum command interval
    pub pending: Option<u8>,
    pub floor: u8,
}

/// Immutable snapshot produced at the end of every cycle
#[derive(Debug, Clone)]
pub struct ControlStatus {
    pub state: ControlState,
    pub board: BoardGeneration,
    pub zones: BTreeMap<FanZone, ZoneStatus>,
    pub readings: Vec<SensorReading>,
    pub cycle_at: Option<Instant>,
    pub cycles: u64,
}

impl ControlStatus {
    pub fn initial(state: ControlState, board: BoardGeneration) -> Self {
        Self {
            state,
            board,
            zones: BTreeMap::new(),
            readings: Vec::new(),
            cycle_at: None,
            cycles: 0,
        }
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let zones: Vec<String> = self
            .zones
            .iter()
            .map(|(zone, z)| {
                let temp = z
                    .temperature
                    .map(|t| format!("{:.1}°C", t))
                    .unwrap_or_else(|| "--".to_string());
                let speed = z
                    .commanded
                    .map(|s| format!("{}%", s))
                    .unwrap_or_else(|| "--".to_string());
                format!("{} {} @ {}", zone, temp, speed)
            })
            .collect();
        format!("[{}] {}", self.state, zones.join(", "))
    }
}

/// Cloneable read handle; readers never block the control loop for long
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<Arc<ControlStatus>>>,
}

impl StatusHandle {
    pub fn new(initial: ControlStatus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn latest(&self) -> Arc<ControlStatus> {
        self.inner.read().clone()
    }

    pub(crate) fn publish(&self, status: ControlStatus) {
        *self.inner.write() = Arc::new(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_replaces_snapshot() {
        let handle = StatusHandle::new(ControlStatus::initial(ControlState::Normal, BoardGeneration::X11));
        let reader = handle.clone();
        let before = reader.latest();

        let mut next = ControlStatus::initial(ControlState::Warning, BoardGeneration::X11);
        next.cycles = 1;
        handle.publish(next);

        assert_eq!(before.state, ControlState::Normal);
        assert_eq!(reader.latest().state, ControlState::Warning);
        assert_eq!(reader.latest().cycles, 1);
    }

    #[test]
    fn test_summary() {
        let mut status = ControlStatus::initial(ControlState::Normal, BoardGeneration::X11);
        status.zones.insert(
            FanZone::Cpu,
            ZoneStatus { temperature: Some(61.3), commanded: Some(35), pending: None, floor: 10 },
        );
        assert_eq!(status.summary(), "[normal] cpu 61.3°C @ 35%");
    }
}
