//! Text parsers for the controller sensor table and drive health logs
//!
//! Controller rows look like `CPU1 Temp | 45 degrees C | ok` or
//! `CPU1 Temp | 45(318 K) | ok`; fan rows carry `RPM`. Rows with other units
//! (volts, watts, discrete states) are ignored.

use crate::constants::thermal::KELVIN_OFFSET;
use super::reading::{SensorKind, SensorState};

/// One row of a dump, before source and timestamp are attached
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReading {
    pub name: String,
    pub kind: SensorKind,
    pub value: Option<f64>,
    pub state: SensorState,
    pub token: u64,
}

/// Parse a raw state column, case-insensitively
pub fn parse_state(raw: &str) -> SensorState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ns" | "no reading" | "na" | "n/a" | "disabled" => SensorState::NoReading,
        "cr" | "critical" | "nc" | "nr" | "lcr" | "ucr" | "lnc" | "unc" | "lnr" | "unr" => {
            SensorState::Critical
        }
        _ => SensorState::Ok,
    }
}

fn leading_number(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+')))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_kelvin(s: &str) -> bool {
    let t = s.trim();
    (t.ends_with('k') || t.ends_with("kelvin")) && !t.contains('c')
}

/// Resolve a temperature value to Celsius.
///
/// Accepts `45`, `45 degrees C`, `38 °C`, `45(318 K)`, `38 C (311 Kelvin)`
/// and bare Kelvin (`318 K`). The Celsius part wins when both are present.
pub fn parse_temperature(raw: &str) -> Option<f64> {
    let lower = raw.trim().to_lowercase();
    let (celsius_part, kelvin_part) = match lower.split_once('(') {
        Some((c, k)) => (c, Some(k.trim_end_matches(')'))),
        None => (lower.as_str(), None),
    };

    if kelvin_part.is_none() && is_kelvin(celsius_part) {
        return leading_number(celsius_part).map(|k| k - KELVIN_OFFSET);
    }

    leading_number(celsius_part)
        .or_else(|| kelvin_part.and_then(leading_number).map(|k| k - KELVIN_OFFSET))
}

enum UnitClass {
    Fan,
    Temperature,
    Unitless,
    Other,
}

fn unit_class(value_lower: &str) -> UnitClass {
    let letters: String = value_lower
        .chars()
        .filter(|c| c.is_alphabetic() || *c == '°')
        .collect();
    if letters.contains("rpm") {
        return UnitClass::Fan;
    }
    if letters.is_empty() {
        return UnitClass::Unitless;
    }
    let rest = letters
        .replace("degrees", "")
        .replace("kelvin", "")
        .replace(['°', 'c', 'k'], "");
    if rest.is_empty() {
        UnitClass::Temperature
    } else {
        UnitClass::Other
    }
}

fn kind_from_name(name: &str) -> Option<SensorKind> {
    let upper = name.to_ascii_uppercase();
    if upper.contains("FAN") {
        Some(SensorKind::Fan)
    } else if upper.contains("TEMP") || upper.starts_with("NVME") {
        Some(SensorKind::Temperature)
    } else {
        None
    }
}

/// Correlation id carried by an `unexpected ID` line
fn unexpected_id(line: &str) -> Option<u64> {
    let lower = line.to_ascii_lowercase();
    let idx = lower.find("unexpected id")?;
    let tail = lower[idx + "unexpected id".len()..]
        .trim()
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    match tail.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => tail.parse().ok(),
    }
}

/// Parse a controller sensor dump. Every row gets `token` unless an
/// `unexpected ID <n>` line follows it, which re-tags that row with `n`.
pub fn parse_sdr(text: &str, token: u64) -> Vec<ParsedReading> {
    let mut readings: Vec<ParsedReading> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(id) = unexpected_id(line) {
            if let Some(last) = readings.last_mut() {
                last.token = id;
            }
            continue;
        }

        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        if parts.len() < 2 || parts[0].is_empty() {
            continue;
        }
        let name = parts[0];
        let value_raw = parts[1];
        let mut state = parts.get(2).map(|s| parse_state(s)).unwrap_or(SensorState::Ok);
        let value_lower = value_raw.to_lowercase();

        if parse_state(&value_lower) == SensorState::NoReading {
            state = SensorState::NoReading;
        }

        let kind = if state == SensorState::NoReading {
            kind_from_name(name)
        } else {
            match unit_class(&value_lower) {
                UnitClass::Fan => Some(SensorKind::Fan),
                UnitClass::Temperature => Some(SensorKind::Temperature),
                UnitClass::Unitless => kind_from_name(name),
                UnitClass::Other => None,
            }
        };
        let Some(kind) = kind else { continue };

        let value = match state {
            SensorState::NoReading => None,
            _ => match kind {
                SensorKind::Temperature => parse_temperature(value_raw),
                SensorKind::Fan => leading_number(&value_lower),
            },
        };
        if value.is_none() {
            state = SensorState::NoReading;
        }

        readings.push(ParsedReading {
            name: name.to_string(),
            kind,
            value,
            state,
            token,
        });
    }

    readings
}

/// Device paths from a drive list (`/dev/nvme0n1 ...` rows)
pub fn parse_nvme_devices(text: &str) -> Vec<String> {
    let mut devices: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(first) = line.split_whitespace().next() {
            if first.starts_with("/dev/nvme") && !devices.iter().any(|d| d == first) {
                devices.push(first.to_string());
            }
        }
    }
    devices
}

/// Temperature from a drive health log (`temperature : 38 C (311 Kelvin)`)
pub fn parse_smart_log_temperature(text: &str) -> Option<f64> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("temperature"))
        .and_then(|(_, value)| parse_temperature(value))
}

/// Sensor name synthesized for a drive: `NVMe_<device>`
pub fn drive_sensor_name(device: &str) -> String {
    let base = device.rsplit('/').next().unwrap_or(device);
    format!("NVMe_{}", base)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDR: &str = "\
CPU1 Temp        | 45 degrees C      | ok
CPU2 Temp        | 47(320 K)         | ok
System Temp      | 31 degrees C      | ok
Peripheral Temp  | no reading        | ns
FAN1             | 1400 RPM          | ok
FANA             | 300 RPM           | cr
12V              | 12.19 Volts       | ok
PS1 Status       | 0x01              | ok
";

    #[test]
    fn test_parse_sdr_rows() {
        let readings = parse_sdr(SDR, 7);
        let names: Vec<&str> = readings.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["CPU1 Temp", "CPU2 Temp", "System Temp", "Peripheral Temp", "FAN1", "FANA"]
        );
        assert_eq!(readings[0].value, Some(45.0));
        assert_eq!(readings[1].value, Some(47.0));
        assert_eq!(readings[3].state, SensorState::NoReading);
        assert_eq!(readings[3].value, None);
        assert_eq!(readings[3].kind, SensorKind::Temperature);
        assert_eq!(readings[4].kind, SensorKind::Fan);
        assert_eq!(readings[4].value, Some(1400.0));
        assert_eq!(readings[5].state, SensorState::Critical);
        assert!(readings.iter().all(|r| r.token == 7));
    }

    #[test]
    fn test_temperature_encodings() {
        assert_eq!(parse_temperature("45"), Some(45.0));
        assert_eq!(parse_temperature("45 degrees C"), Some(45.0));
        assert_eq!(parse_temperature("38 °C (311 K)"), Some(38.0));
        assert_eq!(parse_temperature("45(318 K)"), Some(45.0));
        let kelvin_only = parse_temperature("(318 K)").unwrap();
        assert!((kelvin_only - 44.85).abs() < 1e-9);
        let bare_kelvin = parse_temperature("311 K").unwrap();
        assert!((bare_kelvin - 37.85).abs() < 1e-9);
        assert_eq!(parse_temperature("no reading"), None);
    }

    #[test]
    fn test_unparseable_value_becomes_no_reading() {
        let readings = parse_sdr("CPU1 Temp | -- degrees C | ok", 1);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].state, SensorState::NoReading);
    }

    #[test]
    fn test_state_case_insensitive() {
        assert_eq!(parse_state("NS"), SensorState::NoReading);
        assert_eq!(parse_state("No Reading"), SensorState::NoReading);
        assert_eq!(parse_state("CR"), SensorState::Critical);
        assert_eq!(parse_state("Ok"), SensorState::Ok);
    }

    #[test]
    fn test_unexpected_id_retags_previous_row() {
        let text = "\
CPU1 Temp | 45 degrees C | ok
Received a response with unexpected ID 12
CPU2 Temp | 46 degrees C | ok
";
        let readings = parse_sdr(text, 3);
        assert_eq!(readings[0].token, 12);
        assert_eq!(readings[1].token, 3);
    }

    #[test]
    fn test_nvme_list_and_smart_log() {
        let list = "\
Node             SN                   Model
---------------- -------------------- ----------------
/dev/nvme0n1     S4EWNX0R123456       Samsung SSD 980 PRO
/dev/nvme1n1     S4EWNX0R654321       Samsung SSD 980 PRO
";
        assert_eq!(parse_nvme_devices(list), vec!["/dev/nvme0n1", "/dev/nvme1n1"]);

        let log = "\
Smart Log for NVME device:nvme0n1 namespace-id:ffffffff
critical_warning                    : 0
temperature                         : 38 C (311 Kelvin)
Temperature Sensor 1                : 41 C (314 Kelvin)
";
        assert_eq!(parse_smart_log_temperature(log), Some(38.0));
        assert_eq!(parse_smart_log_temperature("available_spare : 100%"), None);
        assert_eq!(drive_sensor_name("/dev/nvme0n1"), "NVMe_nvme0n1");
    }
}
