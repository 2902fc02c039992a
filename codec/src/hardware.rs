//! Parser for the controller's text telemetry lines.
//!
//! The controller reports on the same serial link it receives frames on,
//! one message per line:
//!
//! ```text
//! @speed:12.5;;
//! @imu:0.1;0.2;0.3;0.0;0.0;9.81;;
//! @battery:7800;;
//! @warning:0H5M30S;;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};

use crate::telemetry::TelemetryEvent;

static RESOURCE_MONITOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Heap \((\d+\.\d+)\);Stack \((\d+\.\d+)\)").expect("static regex")
});

static WARNING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-?[0-9]+)H(-?[0-5]?[0-9])M(-?[0-5]?[0-9])S$").expect("static regex")
});

/// Battery voltage (mV) that reads as 0%.
const BATTERY_EMPTY_MV: i64 = 7200;
/// Millivolts per percentage point above empty.
const BATTERY_MV_PER_PERCENT: f64 = 12.0;

const IMU_FIELDS: [&str; 6] = ["roll", "pitch", "yaw", "accelx", "accely", "accelz"];

/// Parses one line. Returns `None` for lines that are not telemetry or whose
/// value does not match the action's format.
pub fn parse_line(line: &str) -> Option<TelemetryEvent> {
    let line = line.trim();
    let rest = line.strip_prefix('@')?;
    let (action, value) = rest.split_once(':')?;
    let value = value.strip_suffix(";;").unwrap_or(value).trim();

    match action {
        "imu" => Some(parse_imu(value)),
        "speed" | "steer" => {
            let v = value.split(',').next()?.trim().parse::<f64>().ok()?;
            Some(TelemetryEvent::sensor(action, v))
        }
        "instant" => {
            let v = parse_digits(value)?;
            Some(TelemetryEvent::sensor("instant", v as f64 / 1000.0))
        }
        "battery" => {
            let mv = parse_digits(value)? as i64;
            let pct = ((mv - BATTERY_EMPTY_MV) as f64 / BATTERY_MV_PER_PERCENT).round();
            Some(TelemetryEvent::sensor("battery", pct.clamp(0.0, 100.0) as u8))
        }
        "resourceMonitor" => {
            let caps = RESOURCE_MONITOR.captures(value)?;
            let heap = caps[1].parse::<f64>().ok()?;
            let stack = caps[2].parse::<f64>().ok()?;
            Some(TelemetryEvent::sensor(
                "resourceMonitor",
                json!({ "heap": heap, "stack": stack }),
            ))
        }
        "warning" => {
            let caps = WARNING.captures(value)?;
            let hours = caps[1].parse::<i64>().ok()?;
            let minutes = caps[2].parse::<i64>().ok()?;
            let seconds = caps[3].parse::<i64>().ok()?;
            Some(TelemetryEvent::status(
                "warning",
                json!({ "hours": hours, "minutes": minutes, "seconds": seconds }),
            ))
        }
        "shutdown" => Some(TelemetryEvent::status("shutdown", true)),
        "" => None,
        other => Some(TelemetryEvent::status(other, Value::String(value.to_string()))),
    }
}

fn parse_imu(value: &str) -> TelemetryEvent {
    let parts: Vec<&str> = value.split(';').collect();
    if parts.len() >= IMU_FIELDS.len() {
        let readings: Option<Vec<f64>> = parts[..IMU_FIELDS.len()]
            .iter()
            .map(|p| p.trim().parse::<f64>().ok())
            .collect();
        if let Some(readings) = readings {
            let mut obj = serde_json::Map::new();
            for (name, v) in IMU_FIELDS.iter().zip(readings) {
                obj.insert((*name).to_string(), json!(v));
            }
            return TelemetryEvent::sensor("imu", Value::Object(obj));
        }
    }
    TelemetryEvent::status("imuAck", parts[0].to_string())
}

fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
