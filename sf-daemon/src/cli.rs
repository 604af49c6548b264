//! Command Line Interface

use clap::Parser;
use std::path::PathBuf;

use sf_core::constants::paths;
use sf_core::data::validate_percentage;
use sf_core::ipmi::generation_from_text;
use sf_core::{BoardGeneration, FanZone};

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "superfand")]
#[command(version)]
#[command(about = "superfand - Supermicro IPMI fan controller")]
#[command(long_about = "superfand - Supermicro IPMI fan controller

Drives the chassis and cpu fan zones from temperature curves and hands
control back to the board whenever it stops.

EXAMPLES:
    superfand                          Curve control with the default config
    superfand --monitor                Same, logging a status line per cycle
    superfand --manual 60              Pin every zone to 60%
    superfand --learn cpu              Learn the cpu zone's minimum speed
    superfand --simulate x11 -m        Run against a simulated X11 board

ENVIRONMENT VARIABLES:
    SUPERFAN_LOG=debug     Log filter (trace, debug, info, warn, error)

FILES:
    /etc/superfan/config.json          Configuration and learned speeds")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = paths::CONFIG_FILE)]
    pub config_path: PathBuf,

    /// Poll at the monitor interval and log status each cycle
    #[arg(short, long)]
    pub monitor: bool,

    /// Pin all zones to SPEED percent
    #[arg(long, value_name = "SPEED", value_parser = parse_speed, conflicts_with = "learn")]
    pub manual: Option<u8>,

    /// Learn the minimum stable speed of ZONE (chassis|cpu) and exit
    #[arg(long, value_name = "ZONE", value_parser = parse_zone)]
    pub learn: Option<FanZone>,

    /// Use a simulated controller of generation GEN (X9..X13, unknown)
    #[arg(long, value_name = "GEN", value_parser = parse_generation)]
    pub simulate: Option<BoardGeneration>,
}

fn parse_speed(value: &str) -> Result<u8, String> {
    let percent: f64 = value
        .parse()
        .map_err(|_| format!("expected a percentage, got {:?}", value))?;
    validate_percentage(percent).map_err(|e| e.to_string())
}

fn parse_zone(value: &str) -> Result<FanZone, String> {
    FanZone::parse(value).ok_or_else(|| format!("unknown zone {:?}", value))
}

fn parse_generation(value: &str) -> Result<BoardGeneration, String> {
    if value.eq_ignore_ascii_case("unknown") {
        return Ok(BoardGeneration::Unknown);
    }
    generation_from_text(value).ok_or_else(|| format!("unknown board generation {:?}", value))
}
