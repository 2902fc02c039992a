//! Physical device access.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, StopBits};
use tracing::info;

/// The two halves of an opened device.
pub struct Link {
    pub writer: Box<dyn Write + Send>,
    /// Inbound side; `None` when the device is write-only.
    pub reader: Option<Box<dyn Read + Send>>,
}

/// Opens device links. Implemented by the OS serial backend and by the mock.
pub trait Connector: Send + Sync {
    fn connect(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Link>;
}

/// Opens real serial ports, 8N1 without flow control.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn connect(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Link> {
        let device = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()?;
        let reader = device.try_clone()?;

        info!("Opened serial port {} at {} baud", port, baud_rate);

        Ok(Link {
            writer: Box::new(device),
            reader: Some(Box::new(reader)),
        })
    }
}
