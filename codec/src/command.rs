//! Client command descriptors and their typed form.
//!
//! Clients send JSON objects such as `{"type":"move","direction":"W","speed":50}`.
//! A [`CommandDescriptor`] is the loosely typed parse of that object; a
//! [`Command`] is the validated, immutable value handed to the encoder.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Command id for motion commands.
pub const CMD_MOVE: u8 = 0x01;

/// Command id for controller setting adjustments.
pub const CMD_ADJUST_SETTING: u8 = 0x02;

/// Direction byte written for symbols outside W/A/S/D.
pub const DIRECTION_UNKNOWN: u8 = 0x00;

/// Raw command object as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandDescriptor {
    /// Parses a descriptor from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))
    }

    /// Parses a descriptor from an already decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Malformed(e.to_string()))
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Movement direction.
///
/// Symbols follow the keyboard layout the UI uses: W forward, A left,
/// S back, D right. Anything else is kept as [`Direction::Unknown`] and
/// encoded as [`DIRECTION_UNKNOWN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Left,
    Back,
    Right,
    Unknown(String),
}

impl Direction {
    /// Maps a direction symbol. Matching is exact and case-sensitive.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "W" => Direction::Forward,
            "A" => Direction::Left,
            "S" => Direction::Back,
            "D" => Direction::Right,
            other => Direction::Unknown(other.to_string()),
        }
    }

    /// Wire byte for this direction.
    pub fn code(&self) -> u8 {
        match self {
            Direction::Forward => b'W',
            Direction::Left => b'A',
            Direction::Back => b'S',
            Direction::Right => b'D',
            Direction::Unknown(_) => DIRECTION_UNKNOWN,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Direction::Unknown(_))
    }

    pub fn symbol(&self) -> &str {
        match self {
            Direction::Forward => "W",
            Direction::Left => "A",
            Direction::Back => "S",
            Direction::Right => "D",
            Direction::Unknown(s) => s,
        }
    }
}

/// A validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drive in a direction at a speed (0..=255).
    Move { direction: Direction, speed: u8 },
    /// Set the controller's tunable parameter (`adjustKL` on the wire).
    AdjustSetting { value: u16 },
    /// A well-formed descriptor of a type with no wire encoding.
    Other { kind: String },
}

impl Command {
    /// Builds a command from a descriptor.
    ///
    /// Field-level problems (missing direction, speed out of range,
    /// non-numeric value) are [`Error::Malformed`]. Unknown types are
    /// accepted here and rejected by the encoder.
    pub fn from_descriptor(desc: &CommandDescriptor) -> Result<Self> {
        match desc.kind.as_str() {
            "move" => {
                let direction = desc
                    .field("direction")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Malformed("move requires a string direction".into()))?;
                let speed = desc
                    .field("speed")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Malformed("move requires an integer speed".into()))?;
                let speed = u8::try_from(speed)
                    .map_err(|_| Error::Malformed(format!("speed out of range: {}", speed)))?;
                Ok(Command::Move {
                    direction: Direction::from_symbol(direction),
                    speed,
                })
            }
            "adjustKL" => {
                let value = match desc.field("value") {
                    Some(Value::String(s)) => s.trim().parse::<u16>().map_err(|_| {
                        Error::Malformed(format!("value is not a 16-bit integer: {:?}", s))
                    })?,
                    Some(Value::Number(n)) => n
                        .as_u64()
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| {
                            Error::Malformed(format!("value is not a 16-bit integer: {}", n))
                        })?,
                    _ => return Err(Error::Malformed("adjustKL requires a value".into())),
                };
                Ok(Command::AdjustSetting { value })
            }
            other => Ok(Command::Other {
                kind: other.to_string(),
            }),
        }
    }

    /// Parses JSON text straight into a command.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_descriptor(&CommandDescriptor::from_json(text)?)
    }

    /// The wire-level type name.
    pub fn kind(&self) -> &str {
        match self {
            Command::Move { .. } => "move",
            Command::AdjustSetting { .. } => "adjustKL",
            Command::Other { kind } => kind,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Move { direction, speed } => {
                write!(f, "move direction={} speed={}", direction.symbol(), speed)
            }
            Command::AdjustSetting { value } => write!(f, "adjustKL value={}", value),
            Command::Other { kind } => write!(f, "{}", kind),
        }
    }
}
