//! Tracing writer that forwards formatted lines to monitoring clients.

use std::io::{self, Write};

use tracing_subscriber::fmt::MakeWriter;

use crate::monitor::MonitorHub;

/// Implements `io::Write` by broadcasting each line on a [`MonitorHub`].
///
/// Use as the writer of a `tracing_subscriber::fmt` layer.
#[derive(Clone)]
pub struct MonitorWriter {
    hub: MonitorHub,
}

impl MonitorWriter {
    pub fn new(hub: MonitorHub) -> Self {
        Self { hub }
    }
}

impl Write for MonitorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.hub.is_empty() {
            return Ok(buf.len());
        }

        let text = String::from_utf8_lossy(buf);
        for line in text.trim_end_matches('\n').split('\n') {
            if !line.is_empty() {
                self.hub.log(line);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MonitorWriter {
    type Writer = MonitorWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
