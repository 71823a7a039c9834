//! Core application runner (business logic) for `ble-scanner`.
//!
//! This module is intentionally decoupled from CLI parsing and process exit codes
//! so it can be tested deterministically.

use crate::advertising::{uuid_from_u16, uuid_from_u32};
use crate::controller::{ControlError, ScanController};
use crate::filter::FilterCriteria;
use crate::output::OutputFormatter;
use crate::output::text::TextFormatter;
use crate::scanner::{Backend, Scanner};
use crate::session::{ErrorCause, ScanSessionState, SessionSnapshot};
use clap::Parser;
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use uuid::Uuid;

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Only show peripherals whose name contains this text (case-insensitive)
    #[arg(long)]
    pub name: Option<String>,

    /// Only show peripherals advertising this service.
    /// Accepts 16/32-bit assigned numbers (180D, 0x180D) or full UUIDs.
    /// Repeat to require several services.
    #[arg(long = "service", value_parser = parse_service, value_name = "UUID")]
    pub services: Vec<Uuid>,

    /// Only show peripherals received at or above this RSSI (dBm)
    #[arg(long, allow_negative_numbers = true, value_name = "DBM")]
    pub min_rssi: Option<i16>,

    /// Only show peripherals received at -50 dBm or stronger
    #[arg(long)]
    pub nearby: bool,

    /// Only show peripherals advertising a name
    #[arg(long)]
    pub only_named: bool,

    /// Stop scanning after this long.
    /// Accepts duration with suffix: 10s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Print the peripheral list at most once per interval
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub refresh: Duration,

    /// Verbose output, log scanner activity to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

impl Options {
    /// The filter described by the command line.
    pub fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            name: self.name.clone(),
            services: self.services.iter().copied().collect(),
            min_rssi: self.min_rssi,
            nearby_only: self.nearby,
            only_with_name: self.only_named,
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Session(ErrorCause),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Duration suffixes and their length in milliseconds. `ms` must come
/// before `m` and `s`.
const DURATION_UNITS: [(&str, u64); 4] = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)];

/// Parse a duration from a human-readable string.
///
/// Supports `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.
///
/// # Examples
/// ```
/// use ble_scanner::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, unit_millis) = DURATION_UNITS
        .iter()
        .find_map(|&(suffix, millis)| src.strip_suffix(suffix).map(|number| (number, millis)))
        .unwrap_or((src, 1_000));

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;
    value
        .checked_mul(unit_millis)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too long: {}", src))
}

/// Parse a service UUID given as an assigned number or in full.
pub fn parse_service(src: &str) -> Result<Uuid, String> {
    let hex = src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
        .unwrap_or(src);
    let invalid = |_: std::num::ParseIntError| format!("invalid service UUID: {}", src);

    match hex.len() {
        4 => u16::from_str_radix(hex, 16).map(uuid_from_u16).map_err(invalid),
        8 => u32::from_str_radix(hex, 16).map(uuid_from_u32).map_err(invalid),
        _ => Uuid::parse_str(src).map_err(|_| format!("invalid service UUID: {}", src)),
    }
}

fn write_snapshot(
    formatter: &dyn OutputFormatter,
    snapshot: &SessionSnapshot,
    out: &mut dyn Write,
) -> io::Result<()> {
    match &snapshot.state {
        ScanSessionState::Scanning { .. } => writeln!(out, "Scanning..."),
        ScanSessionState::Empty if snapshot.is_scanning => {
            writeln!(out, "No matching peripherals found yet")
        }
        ScanSessionState::Empty => writeln!(out, "No matching peripherals found"),
        ScanSessionState::Result(peripherals) => {
            writeln!(out, "Found {} peripheral(s):", peripherals.len())?;
            for peripheral in peripherals {
                writeln!(out, "{}", formatter.format(peripheral))?;
            }
            writeln!(out)
        }
        // Errors are reported by the caller.
        ScanSessionState::Idle | ScanSessionState::Error(_) => Ok(()),
    }
}

/// Run one scan session, writing the peripheral list to `out` whenever it
/// changes (at most once per `options.refresh`) and session errors to `err`.
///
/// Returns when the session stops scanning: on timeout, when the platform
/// stream ends, or on error.
pub async fn run_with_io(
    options: Options,
    scanner: Arc<dyn Scanner>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    let formatter = TextFormatter::new();
    let handle = ScanController::spawn(scanner);
    let mut state = handle.subscribe();

    handle.start(options.criteria(), options.timeout).await?;
    let mut snapshot = state.borrow_and_update().clone();

    loop {
        write_snapshot(&formatter, &snapshot, out)?;
        if !snapshot.is_scanning {
            break;
        }

        time::sleep(options.refresh).await;
        if state.changed().await.is_err() {
            break;
        }
        snapshot = state.borrow_and_update().clone();
    }
    handle.shutdown().await;

    if let ScanSessionState::Error(cause) = snapshot.state {
        writeln!(err, "error: {cause}")?;
        return Err(RunError::Session(cause));
    }
    Ok(())
}
