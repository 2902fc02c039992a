//! In-memory device for tests.
//!
//! [`MockConnector`] records every byte written, can be told to refuse the
//! next open or fail the next write, adds artificial write latency, and feeds
//! injected bytes to the transport's reader as if the controller sent them.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::{Connector, Link};

/// Mock connector for unit and integration tests.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    writes: Vec<Vec<u8>>,
    fail_open: bool,
    fail_writes: usize,
    fail_read: bool,
    write_delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
    opens: usize,
    last_port: Option<(String, u32)>,
    inbound: Option<Sender<Vec<u8>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All bytes written so far, in write order.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().written.clone()
    }

    /// Each successful write call's bytes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Most write calls ever in progress at once, across all links.
    pub fn max_concurrent_writes(&self) -> usize {
        self.inner.lock().max_in_flight
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opens
    }

    /// Port and baud rate of the last successful open.
    pub fn last_port(&self) -> Option<(String, u32)> {
        self.inner.lock().last_port.clone()
    }

    /// Refuse opens until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.inner.lock().fail_open = fail;
    }

    /// Make the next write fail as if the device disappeared.
    pub fn fail_next_write(&self) {
        self.inner.lock().fail_writes += 1;
    }

    /// Make the next read fail as if the device disappeared.
    pub fn fail_next_read(&self) {
        self.inner.lock().fail_read = true;
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.lock().write_delay = delay;
    }

    /// Queue bytes for the reader of the current link.
    pub fn inject(&self, data: &[u8]) {
        if let Some(tx) = self.inner.lock().inbound.as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }
}

impl Connector for MockConnector {
    fn connect(&self, port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Link> {
        let mut state = self.inner.lock();
        if state.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device: {}", port),
            ));
        }
        state.opens += 1;
        state.last_port = Some((port.to_string(), baud_rate));

        let (tx, rx) = mpsc::channel();
        state.inbound = Some(tx);

        Ok(Link {
            writer: Box::new(MockWriter {
                inner: Arc::clone(&self.inner),
            }),
            reader: Some(Box::new(MockReader {
                inner: Arc::clone(&self.inner),
                rx,
                pending: Vec::new(),
                timeout: read_timeout,
            })),
        })
    }
}

struct MockWriter {
    inner: Arc<Mutex<MockState>>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = {
            let mut state = self.inner.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.write_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.inner.lock();
        state.in_flight -= 1;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device disconnected",
            ));
        }
        state.written.extend_from_slice(buf);
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockReader {
    inner: Arc<Mutex<MockState>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    timeout: Duration,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.inner.lock();
            if state.fail_read {
                state.fail_read = false;
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device disconnected",
                ));
            }
        }

        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // A newer link replaced this one.
                    std::thread::sleep(self.timeout);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_and_failures() {
        let mock = MockConnector::new();
        let mut link = mock
            .connect("/dev/mock", 9600, Duration::from_millis(5))
            .unwrap();

        link.writer.write_all(&[1, 2, 3]).unwrap();
        mock.fail_next_write();
        assert!(link.writer.write_all(&[4]).is_err());
        link.writer.write_all(&[5]).unwrap();

        assert_eq!(mock.written(), vec![1, 2, 3, 5]);
        assert_eq!(mock.write_count(), 2);
        assert_eq!(mock.last_port(), Some(("/dev/mock".to_string(), 9600)));
    }

    #[test]
    fn refuses_open() {
        let mock = MockConnector::new();
        mock.set_fail_open(true);
        assert!(mock.connect("/dev/mock", 9600, Duration::from_millis(5)).is_err());
        assert_eq!(mock.open_count(), 0);
    }

    #[test]
    fn reader_yields_injected_bytes() {
        let mock = MockConnector::new();
        let link = mock
            .connect("/dev/mock", 9600, Duration::from_millis(5))
            .unwrap();
        let mut reader = link.reader.unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        mock.inject(b"hello");
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'o');
    }
}
