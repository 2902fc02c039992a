//! Serial transport for the carlink controller link.
//!
//! The transport is the only owner of the physical port. Frames are written
//! by a single writer thread in submission order; the controller's report
//! lines are read back and surfaced as telemetry events.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use carlink_codec::{Command, encode};
//! use carlink_serial::{SerialConfig, SerialTransport, SystemConnector};
//!
//! # async fn run() -> carlink_serial::Result<()> {
//! let transport = SerialTransport::new(
//!     SerialConfig::new("/dev/ttyUSB0", 115_200),
//!     Arc::new(SystemConnector),
//! );
//! transport.open()?;
//!
//! let cmd = Command::parse(r#"{"type":"move","direction":"W","speed":50}"#).unwrap();
//! transport.write(&encode(&cmd).unwrap()).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod device;
mod error;
pub mod mock;
mod reconnect;
mod transport;

pub use config::{DEFAULT_BAUD_RATE, DEFAULT_PORT, SerialConfig};
pub use device::{Connector, Link, SystemConnector};
pub use error::{Error, Result};
pub use reconnect::supervise;
pub use transport::{
    SerialTransport, TransportEvent, TransportState, TransportStats, WriteAck,
};
