//! Telemetry event model.
//!
//! Every event carries a channel tag. On the wire an event becomes
//! `{"channel": <tag>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broad event class. Each class is flushed on its own cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Camera,
    Sensor,
    Status,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [
        TelemetryKind::Camera,
        TelemetryKind::Sensor,
        TelemetryKind::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Camera => "camera",
            TelemetryKind::Sensor => "sensor",
            TelemetryKind::Status => "status",
        }
    }
}

/// One encoded camera image, typically base64 JPEG.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub channel: String,
    pub image: String,
}

/// A numeric or structured sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub channel: String,
    pub value: Value,
}

/// A controller or bridge state change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub channel: String,
    pub value: Value,
}

/// Tagged union of everything the hardware side reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Camera(CameraFrame),
    Sensor(SensorSample),
    Status(StatusUpdate),
}

/// Channel names that always carry status updates.
const STATUS_CHANNELS: &[&str] = &["warning", "shutdown", "serial", "recording", "imuAck"];

impl TelemetryEvent {
    pub fn camera(channel: impl Into<String>, image: impl Into<String>) -> Self {
        TelemetryEvent::Camera(CameraFrame {
            channel: channel.into(),
            image: image.into(),
        })
    }

    pub fn sensor(channel: impl Into<String>, value: impl Into<Value>) -> Self {
        TelemetryEvent::Sensor(SensorSample {
            channel: channel.into(),
            value: value.into(),
        })
    }

    pub fn status(channel: impl Into<String>, value: impl Into<Value>) -> Self {
        TelemetryEvent::Status(StatusUpdate {
            channel: channel.into(),
            value: value.into(),
        })
    }

    pub fn kind(&self) -> TelemetryKind {
        match self {
            TelemetryEvent::Camera(_) => TelemetryKind::Camera,
            TelemetryEvent::Sensor(_) => TelemetryKind::Sensor,
            TelemetryEvent::Status(_) => TelemetryKind::Status,
        }
    }

    /// The tag used for subscription and last-value-wins slots.
    pub fn channel(&self) -> &str {
        match self {
            TelemetryEvent::Camera(f) => &f.channel,
            TelemetryEvent::Sensor(s) => &s.channel,
            TelemetryEvent::Status(s) => &s.channel,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            TelemetryEvent::Camera(f) => Value::String(f.image.clone()),
            TelemetryEvent::Sensor(s) => s.value.clone(),
            TelemetryEvent::Status(s) => s.value.clone(),
        }
    }

    pub fn to_message(&self) -> TelemetryMessage {
        TelemetryMessage {
            channel: self.channel().to_string(),
            data: self.data(),
        }
    }

    /// Classifies an inbound `{channel, data}` message.
    ///
    /// Camera channels must carry a string image; returns `None` otherwise.
    pub fn from_message(msg: TelemetryMessage) -> Option<Self> {
        if msg.channel.is_empty() {
            return None;
        }
        if is_camera_channel(&msg.channel) {
            return match msg.data {
                Value::String(image) => Some(TelemetryEvent::camera(msg.channel, image)),
                _ => None,
            };
        }
        if STATUS_CHANNELS.contains(&msg.channel.as_str()) {
            return Some(TelemetryEvent::status(msg.channel, msg.data));
        }
        Some(TelemetryEvent::sensor(msg.channel, msg.data))
    }
}

fn is_camera_channel(channel: &str) -> bool {
    channel == "camera" || channel.ends_with("Camera")
}

/// Wire form of a telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub channel: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_channels() {
        let cases = [
            ("camera", json!("abc"), TelemetryKind::Camera),
            ("frontCamera", json!("abc"), TelemetryKind::Camera),
            ("warning", json!({"hours": 1}), TelemetryKind::Status),
            ("shutdown", json!(true), TelemetryKind::Status),
            ("speed", json!(3.5), TelemetryKind::Sensor),
        ];
        for (channel, data, kind) in cases {
            let event = TelemetryEvent::from_message(TelemetryMessage {
                channel: channel.to_string(),
                data,
            })
            .unwrap();
            assert_eq!(event.kind(), kind, "channel {}", channel);
            assert_eq!(event.channel(), channel);
        }
    }

    #[test]
    fn camera_requires_string() {
        let msg = TelemetryMessage {
            channel: "camera".into(),
            data: json!(42),
        };
        assert!(TelemetryEvent::from_message(msg).is_none());
    }

    #[test]
    fn wire_shape() {
        let event = TelemetryEvent::sensor("battery", 87);
        let text = serde_json::to_string(&event.to_message()).unwrap();
        assert_eq!(text, r#"{"channel":"battery","data":87}"#);
    }
}
