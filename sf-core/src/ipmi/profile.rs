//! Board generations and their command dialects
//!
//! Each supported generation is one row in [`DIALECTS`]. Commands are built by
//! appending zone and value bytes to the row's templates, so adding a family
//! means adding a row rather than another branch.

use std::fmt;

use crate::data::FanZone;

/// Supermicro board family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardGeneration {
    X9,
    X10,
    X11,
    H12,
    X13,
    Unknown,
}

impl fmt::Display for BoardGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardGeneration::X9 => "X9",
            BoardGeneration::X10 => "X10",
            BoardGeneration::X11 => "X11",
            BoardGeneration::H12 => "H12",
            BoardGeneration::X13 => "X13",
            BoardGeneration::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Automatic fan modes offered by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMode {
    Standard,
    Optimal,
    HeavyIo,
}

/// Requested controller fan mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    /// Full mode; duty cycles are taken from our commands
    Manual,
    Auto(AutoMode),
}

impl FanMode {
    pub fn byte(self) -> u8 {
        match self {
            FanMode::Manual => 0x01,
            FanMode::Auto(AutoMode::Standard) => 0x00,
            FanMode::Auto(AutoMode::Optimal) => 0x02,
            FanMode::Auto(AutoMode::HeavyIo) => 0x04,
        }
    }
}

/// Command templates and limits for one generation
#[derive(Debug, PartialEq, Eq)]
pub struct Dialect {
    pub generation: BoardGeneration,
    /// Lowercase product-name prefixes identifying the family
    pub markers: &'static [&'static str],
    pub mode_get: &'static [u8],
    /// Mode byte is appended
    pub mode_set: &'static [u8],
    /// Zone byte and duty byte are appended
    pub duty_set: &'static [u8],
    /// Zone byte is appended, then `duty_get_suffix`
    pub duty_get: &'static [u8],
    pub duty_get_suffix: &'static [u8],
    /// Added to the zone index to form the zone byte
    pub zone_base: u8,
    /// Duty byte representing 100%
    pub duty_max: u8,
    /// Lowest speed in percent the firmware honors
    pub floor_percent: u8,
    /// Mode bytes accepted in requests and responses
    pub modes: &'static [u8],
    /// Request prefixes never sent to this family
    pub blacklist: &'static [&'static [u8]],
}

/// Requests never sent to any board: get supported commands, get OEM commands
pub const GLOBAL_BLACKLIST: &[&[u8]] = &[&[0x06, 0x01], &[0x06, 0x02]];

const MODES: &[u8] = &[0x00, 0x01, 0x02, 0x04];
const MODE_GET: &[u8] = &[0x30, 0x45, 0x00];
const MODE_SET: &[u8] = &[0x30, 0x45, 0x01];

const LEGACY_SET: &[u8] = &[0x30, 0x91, 0x5a, 0x03];
const LEGACY_GET: &[u8] = &[0x30, 0x90, 0x5a, 0x03];
const MODERN_SET: &[u8] = &[0x30, 0x70, 0x66, 0x01];
const MODERN_GET: &[u8] = &[0x30, 0x70, 0x66, 0x00];

/// Dialects in detection precedence order (newest family first)
pub static DIALECTS: &[Dialect] = &[
    Dialect {
        generation: BoardGeneration::X13,
        markers: &["x13", "h13", "b13"],
        mode_get: MODE_GET,
        mode_set: MODE_SET,
        duty_set: MODERN_SET,
        duty_get: MODERN_GET,
        duty_get_suffix: &[],
        zone_base: 0x00,
        duty_max: 0xff,
        floor_percent: 2,
        modes: MODES,
        blacklist: &[LEGACY_SET],
    },
    Dialect {
        generation: BoardGeneration::H12,
        markers: &["h12", "b12"],
        mode_get: MODE_GET,
        mode_set: MODE_SET,
        duty_set: LEGACY_SET,
        duty_get: LEGACY_GET,
        duty_get_suffix: &[0x01],
        zone_base: 0x10,
        duty_max: 0x64,
        floor_percent: 20,
        modes: MODES,
        blacklist: &[MODERN_SET],
    },
    Dialect {
        generation: BoardGeneration::X11,
        markers: &["x11", "h11", "b11"],
        mode_get: MODE_GET,
        mode_set: MODE_SET,
        duty_set: MODERN_SET,
        duty_get: MODERN_GET,
        duty_get_suffix: &[],
        zone_base: 0x00,
        duty_max: 0xff,
        floor_percent: 10,
        modes: MODES,
        blacklist: &[LEGACY_SET],
    },
    Dialect {
        generation: BoardGeneration::X10,
        markers: &["x10", "h10", "b10"],
        mode_get: MODE_GET,
        mode_set: MODE_SET,
        duty_set: MODERN_SET,
        duty_get: MODERN_GET,
        duty_get_suffix: &[],
        zone_base: 0x00,
        duty_max: 0xff,
        floor_percent: 10,
        modes: MODES,
        blacklist: &[LEGACY_SET],
    },
    Dialect {
        generation: BoardGeneration::X9,
        markers: &["x9", "h9", "b9"],
        mode_get: MODE_GET,
        mode_set: MODE_SET,
        duty_set: LEGACY_SET,
        duty_get: LEGACY_GET,
        duty_get_suffix: &[0x01],
        zone_base: 0x10,
        duty_max: 0xff,
        floor_percent: 10,
        modes: MODES,
        blacklist: &[MODERN_SET],
    },
];

/// Detected board and its dialect; `Unknown` carries none
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardProfile {
    pub generation: BoardGeneration,
    dialect: Option<&'static Dialect>,
}

impl BoardProfile {
    pub fn unknown() -> Self {
        Self {
            generation: BoardGeneration::Unknown,
            dialect: None,
        }
    }

    pub fn for_generation(generation: BoardGeneration) -> Self {
        let dialect = DIALECTS.iter().find(|d| d.generation == generation);
        Self { generation, dialect }
    }

    pub fn dialect(&self) -> Option<&'static Dialect> {
        self.dialect
    }

    /// Whether manual commands may be issued to this board
    pub fn is_supported(&self) -> bool {
        self.dialect.is_some()
    }

    /// Minimum enforceable speed in percent
    pub fn min_speed(&self) -> u8 {
        self.dialect.map(|d| d.floor_percent).unwrap_or(0)
    }

    pub fn duty_max(&self) -> u8 {
        self.dialect.map(|d| d.duty_max).unwrap_or(0xff)
    }

    /// Percent to duty byte, after applying the family floor
    pub fn to_raw(&self, percent: u8) -> u8 {
        let percent = percent.clamp(self.min_speed(), 100) as u32;
        (percent * self.duty_max() as u32 / 100) as u8
    }

    /// Duty byte to the nearest percent
    pub fn from_raw(&self, raw: u8) -> u8 {
        let max = self.duty_max() as u32;
        (((raw as u32).min(max) * 100 + max / 2) / max) as u8
    }

    fn zone_byte(dialect: &Dialect, zone: FanZone) -> u8 {
        dialect.zone_base + zone.index()
    }

    pub fn mode_get_command(&self) -> Option<Vec<u8>> {
        self.dialect.map(|d| d.mode_get.to_vec())
    }

    pub fn mode_set_command(&self, mode: FanMode) -> Option<Vec<u8>> {
        self.dialect.map(|d| {
            let mut cmd = d.mode_set.to_vec();
            cmd.push(mode.byte());
            cmd
        })
    }

    pub fn duty_set_command(&self, zone: FanZone, percent: u8) -> Option<Vec<u8>> {
        self.dialect.map(|d| {
            let mut cmd = d.duty_set.to_vec();
            cmd.push(Self::zone_byte(d, zone));
            cmd.push(self.to_raw(percent));
            cmd
        })
    }

    pub fn duty_get_command(&self, zone: FanZone) -> Option<Vec<u8>> {
        self.dialect.map(|d| {
            let mut cmd = d.duty_get.to_vec();
            cmd.push(Self::zone_byte(d, zone));
            cmd.extend_from_slice(d.duty_get_suffix);
            cmd
        })
    }

    /// Whether a mode byte is in this board's allow-list
    pub fn allows_mode(&self, mode: u8) -> bool {
        self.dialect.map(|d| d.modes.contains(&mode)).unwrap_or(false)
    }

    /// Whether a request matches the global or family blacklist
    pub fn is_blacklisted(&self, request: &[u8]) -> bool {
        let family: &[&[u8]] = self.dialect.map(|d| d.blacklist).unwrap_or(&[]);
        GLOBAL_BLACKLIST
            .iter()
            .chain(family.iter())
            .any(|prefix| request.starts_with(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x13_conversion() {
        let profile = BoardProfile::for_generation(BoardGeneration::X13);
        assert_eq!(profile.to_raw(50), 0x7f);
        assert_eq!(profile.to_raw(100), 0xff);
        assert_eq!(profile.to_raw(2), 0x05);
        assert_eq!(profile.to_raw(0), 0x05);
        assert_eq!(profile.from_raw(0x7f), 50);
        assert_eq!(profile.from_raw(0xff), 100);
    }

    #[test]
    fn test_h12_conversion_uses_percent_scale() {
        let profile = BoardProfile::for_generation(BoardGeneration::H12);
        assert_eq!(profile.to_raw(100), 0x64);
        assert_eq!(profile.to_raw(45), 45);
        assert_eq!(profile.to_raw(10), 0x14);
        assert_eq!(profile.from_raw(0x64), 100);
    }

    #[test]
    fn test_command_bytes_per_dialect() {
        let x11 = BoardProfile::for_generation(BoardGeneration::X11);
        assert_eq!(
            x11.duty_set_command(FanZone::Cpu, 50).unwrap(),
            vec![0x30, 0x70, 0x66, 0x01, 0x01, 0x7f]
        );
        assert_eq!(
            x11.duty_get_command(FanZone::Chassis).unwrap(),
            vec![0x30, 0x70, 0x66, 0x00, 0x00]
        );

        let x9 = BoardProfile::for_generation(BoardGeneration::X9);
        assert_eq!(
            x9.duty_set_command(FanZone::Chassis, 100).unwrap(),
            vec![0x30, 0x91, 0x5a, 0x03, 0x10, 0xff]
        );
        assert_eq!(
            x9.duty_get_command(FanZone::Cpu).unwrap(),
            vec![0x30, 0x90, 0x5a, 0x03, 0x11, 0x01]
        );

        assert_eq!(
            x11.mode_set_command(FanMode::Manual).unwrap(),
            vec![0x30, 0x45, 0x01, 0x01]
        );
        assert_eq!(
            x11.mode_set_command(FanMode::Auto(AutoMode::Standard)).unwrap(),
            vec![0x30, 0x45, 0x01, 0x00]
        );
    }

    #[test]
    fn test_unknown_profile_builds_nothing() {
        let profile = BoardProfile::unknown();
        assert!(!profile.is_supported());
        assert_eq!(profile.duty_set_command(FanZone::Cpu, 50), None);
        assert_eq!(profile.mode_set_command(FanMode::Manual), None);
        assert_eq!(profile.min_speed(), 0);
    }

    #[test]
    fn test_blacklist() {
        let x11 = BoardProfile::for_generation(BoardGeneration::X11);
        assert!(x11.is_blacklisted(&[0x06, 0x01]));
        assert!(x11.is_blacklisted(&[0x06, 0x02, 0x00]));
        assert!(x11.is_blacklisted(&[0x30, 0x91, 0x5a, 0x03, 0x10, 0x20]));
        assert!(!x11.is_blacklisted(&[0x06, 0x04]));
        assert!(!x11.is_blacklisted(&[0x30, 0x70, 0x66, 0x01, 0x00, 0x40]));
        assert!(BoardProfile::unknown().is_blacklisted(&[0x06, 0x01]));
    }

    #[test]
    fn test_every_generation_has_one_row() {
        for generation in [
            BoardGeneration::X9,
            BoardGeneration::X10,
            BoardGeneration::X11,
            BoardGeneration::H12,
            BoardGeneration::X13,
        ] {
            let rows = DIALECTS.iter().filter(|d| d.generation == generation).count();
            assert_eq!(rows, 1, "{}", generation);
        }
    }
}
