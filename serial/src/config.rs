//! Serial link configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default device path.
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Default baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Serial transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Depth of the single-writer queue.
    pub queue_capacity: usize,
    /// Read timeout for the telemetry reader, in milliseconds.
    pub read_timeout_ms: u64,
    /// Reopen interval while closed. `None` disables reconnection.
    pub reconnect_interval_ms: Option<u64>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            queue_capacity: 64,
            read_timeout_ms: 100,
            reconnect_interval_ms: None,
        }
    }
}

impl SerialConfig {
    /// Create a config for the given device.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the writer queue depth.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the reader timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable periodic reopen attempts while the port is closed.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn read_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn reconnect_duration(&self) -> Option<Duration> {
        self.reconnect_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
