//! Bridge configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! control_addr: "0.0.0.0:8080"
//! monitor_addr: "0.0.0.0:8081"
//! serial:
//!   port: /dev/ttyUSB0
//!   baud_rate: 115200
//! telemetry:
//!   camera_interval_ms: 33
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use carlink_codec::TelemetryKind;
use carlink_serial::SerialConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default control listen address.
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:8080";
/// Default monitor listen address.
pub const DEFAULT_MONITOR_ADDR: &str = "0.0.0.0:8081";

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listen address for control, telemetry and HTTP API.
    pub control_addr: String,
    /// Listen address for monitoring clients.
    pub monitor_addr: String,
    /// Reject move commands whose direction is not W/A/S/D.
    pub strict_direction: bool,
    /// Per-connection outbound queue depth.
    pub client_queue: usize,
    pub serial: SerialConfig,
    pub telemetry: RelayConfig,
    pub monitor: MonitorConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            monitor_addr: DEFAULT_MONITOR_ADDR.to_string(),
            strict_direction: false,
            client_queue: 64,
            serial: SerialConfig::default(),
            telemetry: RelayConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Flush cadence per telemetry kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub camera_interval_ms: u64,
    pub sensor_interval_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            camera_interval_ms: 33,
            sensor_interval_ms: 100,
            status_interval_ms: 250,
        }
    }
}

impl RelayConfig {
    pub fn interval(&self, kind: TelemetryKind) -> Duration {
        let ms = match kind {
            TelemetryKind::Camera => self.camera_interval_ms,
            TelemetryKind::Sensor => self.sensor_interval_ms,
            TelemetryKind::Status => self.status_interval_ms,
        };
        Duration::from_millis(ms.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Also broadcast process tracing output to monitoring clients.
    pub forward_tracing: bool,
}

impl BridgeConfig {
    /// Parse a config from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Check addresses and sizes.
    pub fn validate(&self) -> Result<()> {
        parse_addr(&self.control_addr)?;
        parse_addr(&self.monitor_addr)?;
        if self.serial.port.is_empty() {
            return Err(Error::Config("serial.port is empty".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("serial.baud_rate must be positive".into()));
        }
        if self.client_queue == 0 {
            return Err(Error::Config("client_queue must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a listen address. A leading `:` means all interfaces.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    addr.parse()
        .map_err(|e| Error::Config(format!("invalid address {:?}: {}", addr, e)))
}
