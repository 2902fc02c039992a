//! Wire protocol for the carlink vehicle bridge.
//!
//! ## Components
//!
//! - [`Command`]: validated client command, parsed from a JSON descriptor
//! - [`Frame`] / [`encode`]: the binary frame written to the controller
//! - [`TelemetryEvent`]: camera frames, sensor samples and status updates
//! - [`hardware::parse_line`]: the controller's `@action:value;;` report lines
//!
//! ## Example
//!
//! ```
//! use carlink_codec::{Command, encode};
//!
//! let cmd = Command::parse(r#"{"type":"move","direction":"W","speed":50}"#).unwrap();
//! let frame = encode(&cmd).unwrap();
//! assert_eq!(&frame.to_bytes()[..], &[0xAA, 0x01, 0x02, 0x57, 0x32, 0x36]);
//! ```

mod command;
mod error;
mod frame;
pub mod hardware;
mod telemetry;

pub use command::{
    CMD_ADJUST_SETTING, CMD_MOVE, Command, CommandDescriptor, DIRECTION_UNKNOWN, Direction,
};
pub use error::{Error, Result};
pub use frame::{FRAME_HEADER, FRAME_OVERHEAD, Frame, MAX_PAYLOAD_LEN, checksum, encode};
pub use telemetry::{
    CameraFrame, SensorSample, StatusUpdate, TelemetryEvent, TelemetryKind, TelemetryMessage,
};
