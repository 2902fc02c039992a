//! Serial transport: exclusive owner of the controller link.
//!
//! All frames pass through a single writer thread that pulls jobs off a
//! bounded queue and performs blocking writes one at a time, so bytes of two
//! frames never interleave. Callers enqueue and await the outcome.
//!
//! A second thread reads the controller's report lines and publishes them as
//! [`TransportEvent::Telemetry`].
//!
//! Any I/O error moves the transport to Closed. While closed, writes fail
//! fast with [`Error::PortUnavailable`] until [`SerialTransport::open`]
//! succeeds again.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use carlink_codec::{Frame, TelemetryEvent, hardware};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::SerialConfig;
use crate::device::Connector;
use crate::error::{Error, Result};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Longest report line kept before the buffer is discarded.
const MAX_LINE_LEN: usize = 1024;

/// Lifecycle notifications and controller reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened { port: String, baud_rate: u32 },
    /// The link failed; the transport is now closed.
    Error { reason: String },
    Closed,
    Telemetry(TelemetryEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Open,
    Closed,
}

/// Acknowledgement for a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Position of this frame in the total write order since startup.
    pub sequence: u64,
    pub bytes: usize,
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub state: TransportState,
    pub port: String,
    pub baud_rate: u32,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub opens: u64,
}

struct WriteJob {
    bytes: Bytes,
    reply: oneshot::Sender<Result<WriteAck>>,
}

/// One open period of the device. Replaced on every successful open.
struct Session {
    id: u64,
    tx: mpsc::Sender<WriteJob>,
    stop: Arc<AtomicBool>,
}

struct Shared {
    config: SerialConfig,
    /// Port and baud rate used by the next open.
    target: Mutex<(String, u32)>,
    session: Mutex<Option<Session>>,
    /// Held for each device write so sessions never overlap on the wire.
    device: Mutex<()>,
    next_session: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    opens: AtomicU64,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Closes the session `id` after an I/O error. Stale sessions are ignored.
    fn fail(&self, id: u64, reason: String) {
        let session = {
            let mut guard = self.session.lock();
            match guard.as_ref() {
                Some(s) if s.id == id => guard.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            session.stop.store(true, Ordering::SeqCst);
            warn!("Serial port {} failed: {}", self.target.lock().0, reason);
            self.emit(TransportEvent::Error { reason });
            self.emit(TransportEvent::Closed);
        }
    }
}

/// Exclusive owner of the serial device.
///
/// Constructed once per process and shared by reference (`Arc`).
pub struct SerialTransport {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
}

impl SerialTransport {
    /// Create a closed transport. Call [`open`](Self::open) to acquire the port.
    pub fn new(config: SerialConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let target = (config.port.clone(), config.baud_rate);
        Self {
            shared: Arc::new(Shared {
                config,
                target: Mutex::new(target),
                session: Mutex::new(None),
                device: Mutex::new(()),
                next_session: AtomicU64::new(1),
                events,
                frames_written: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                write_failures: AtomicU64::new(0),
                opens: AtomicU64::new(0),
            }),
            connector,
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.shared.config
    }

    /// Port and baud rate the transport opens (or has open).
    pub fn target(&self) -> (String, u32) {
        self.shared.target.lock().clone()
    }

    /// Open the current target port and start the writer and reader threads.
    ///
    /// The target starts as the configured port and changes with
    /// [`open_with`](Self::open_with). Opening an already open transport is a
    /// no-op. This call blocks while the device is opened.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let (port, baud_rate) = self.target();
        self.open_link(port, baud_rate)
    }

    /// Open `port` at `baud_rate`, making it the target for later reopens.
    ///
    /// If a different port or rate is open, it is closed first.
    pub fn open_with(&self, port: &str, baud_rate: u32) -> Result<()> {
        let changed = {
            let mut target = self.shared.target.lock();
            let changed = target.0 != port || target.1 != baud_rate;
            *target = (port.to_string(), baud_rate);
            changed
        };
        if changed {
            self.close();
        }
        self.open()
    }

    fn open_link(&self, port: String, baud_rate: u32) -> Result<()> {
        let config = &self.shared.config;
        let link = self
            .connector
            .connect(&port, baud_rate, config.read_timeout_duration())
            .map_err(|e| Error::PortUnavailable(format!("{}: {}", port, e)))?;

        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        {
            let mut guard = self.shared.session.lock();
            if guard.is_some() {
                // Lost a race with a concurrent open; drop our link.
                return Ok(());
            }
            *guard = Some(Session {
                id,
                tx,
                stop: Arc::clone(&stop),
            });
        }

        let shared = Arc::clone(&self.shared);
        let writer_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("serial-writer".into())
            .spawn(move || writer_loop(shared, id, writer_stop, link.writer, rx));
        if let Err(e) = spawned {
            self.shared.fail(id, format!("spawn writer: {}", e));
            return Err(Error::PortUnavailable(e.to_string()));
        }

        if let Some(reader) = link.reader {
            let shared = Arc::clone(&self.shared);
            let reader_stop = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name("serial-reader".into())
                .spawn(move || reader_loop(shared, id, reader_stop, reader));
            if let Err(e) = spawned {
                warn!("Serial reader not started: {}", e);
            }
        }

        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        info!("Serial transport open on {} at {} baud", port, baud_rate);
        self.shared.emit(TransportEvent::Opened { port, baud_rate });
        Ok(())
    }

    /// Release the port. Queued writes that have not started fail with
    /// [`Error::PortUnavailable`].
    pub fn close(&self) {
        let session = self.shared.session.lock().take();
        if let Some(session) = session {
            session.stop.store(true, Ordering::SeqCst);
            info!("Serial transport on {} closed", self.shared.target.lock().0);
            self.shared.emit(TransportEvent::Closed);
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// Enqueue a frame and wait for the device write to finish.
    ///
    /// Dropping the returned future after the frame is queued does not cancel
    /// the write; its result is discarded.
    pub async fn write(&self, frame: &Frame) -> Result<WriteAck> {
        let tx = {
            let guard = self.shared.session.lock();
            match guard.as_ref() {
                Some(s) => s.tx.clone(),
                None => return Err(Error::PortUnavailable("port closed".into())),
            }
        };

        let (reply, rx) = oneshot::channel();
        let job = WriteJob {
            bytes: frame.to_bytes(),
            reply,
        };
        tx.send(job)
            .await
            .map_err(|_| Error::PortUnavailable("port closed".into()))?;
        drop(tx);

        rx.await
            .map_err(|_| Error::PortUnavailable("writer stopped".into()))?
    }

    /// Subscribe to lifecycle and telemetry events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> TransportStats {
        let s = &self.shared;
        let (port, baud_rate) = self.target();
        TransportStats {
            state: if self.is_open() {
                TransportState::Open
            } else {
                TransportState::Closed
            },
            port,
            baud_rate,
            frames_written: s.frames_written.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            write_failures: s.write_failures.load(Ordering::Relaxed),
            opens: s.opens.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(
    shared: Arc<Shared>,
    id: u64,
    stop: Arc<AtomicBool>,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<WriteJob>,
) {
    debug!("Serial writer {} started", id);

    while let Some(job) = rx.blocking_recv() {
        // A writer from an older session may still be inside the device call.
        let _device = shared.device.lock();
        if stop.load(Ordering::SeqCst) {
            let _ = job
                .reply
                .send(Err(Error::PortUnavailable("port closed".into())));
            continue;
        }

        match writer.write_all(&job.bytes).and_then(|_| writer.flush()) {
            Ok(()) => {
                let sequence = shared.frames_written.fetch_add(1, Ordering::SeqCst) + 1;
                shared
                    .bytes_written
                    .fetch_add(job.bytes.len() as u64, Ordering::Relaxed);
                trace!("Serial write #{} ({} bytes)", sequence, job.bytes.len());
                // The requester may be gone; the write still happened.
                let _ = job.reply.send(Ok(WriteAck {
                    sequence,
                    bytes: job.bytes.len(),
                }));
            }
            Err(e) => {
                shared.write_failures.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                shared.fail(id, format!("write failed: {}", reason));
                let _ = job.reply.send(Err(Error::WriteFailed(reason)));
            }
        }
    }

    // Dropping `writer` releases this session's handle on the device.
    debug!("Serial writer {} stopped", id);
}

fn reader_loop(
    shared: Arc<Shared>,
    id: u64,
    stop: Arc<AtomicBool>,
    mut reader: Box<dyn Read + Send>,
) {
    debug!("Serial reader {} started", id);

    let mut buf = [0u8; 256];
    let mut line: Vec<u8> = Vec::with_capacity(128);

    while !stop.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(10)),
            Ok(n) => {
                for &b in &buf[..n] {
                    if b == b'\n' {
                        dispatch_line(&shared, &line);
                        line.clear();
                    } else if line.len() < MAX_LINE_LEN {
                        line.push(b);
                    } else {
                        debug!("Discarding oversized report line");
                        line.clear();
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                shared.fail(id, format!("read failed: {}", e));
                break;
            }
        }
    }

    debug!("Serial reader {} stopped", id);
}

fn dispatch_line(shared: &Shared, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    match hardware::parse_line(&text) {
        Some(event) => shared.emit(TransportEvent::Telemetry(event)),
        None => trace!("Ignoring report line: {}", text.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use carlink_codec::{Command, Direction, encode};
    use std::time::Duration;

    fn transport(mock: &MockConnector) -> Arc<SerialTransport> {
        let config = SerialConfig::new("/dev/mock", 115_200).read_timeout(Duration::from_millis(5));
        Arc::new(SerialTransport::new(config, Arc::new(mock.clone())))
    }

    fn move_frame(symbol: &str, speed: u8) -> Frame {
        encode(&Command::Move {
            direction: Direction::from_symbol(symbol),
            speed,
        })
        .unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn write_before_open_fails_fast() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        let err = t.write(&move_frame("W", 1)).await.unwrap_err();
        assert!(matches!(err, Error::PortUnavailable(_)));
        assert_eq!(mock.write_count(), 0);
    }

    #[tokio::test]
    async fn open_failure_is_port_unavailable() {
        let mock = MockConnector::new();
        mock.set_fail_open(true);
        let t = transport(&mock);
        assert!(matches!(t.open(), Err(Error::PortUnavailable(_))));
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn writes_frame_bytes() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        let mut events = t.subscribe();
        t.open().unwrap();
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Opened {
                port: "/dev/mock".into(),
                baud_rate: 115_200
            }
        );

        let ack = t.write(&move_frame("W", 50)).await.unwrap();
        assert_eq!(ack.sequence, 1);
        assert_eq!(ack.bytes, 6);
        assert_eq!(mock.written(), vec![0xAA, 0x01, 0x02, 0x57, 0x32, 0x36]);

        let stats = t.stats();
        assert_eq!(stats.state, TransportState::Open);
        assert_eq!(stats.frames_written, 1);
        assert_eq!(stats.bytes_written, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_never_interleave() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        t.open().unwrap();

        let symbols = ["W", "A", "S", "D"];
        let mut handles = Vec::new();
        for symbol in symbols {
            let t = Arc::clone(&t);
            handles.push(tokio::spawn(async move {
                for speed in 0..50u8 {
                    t.write(&move_frame(symbol, speed)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let written = mock.written();
        let mut offset = 0;
        let mut last: std::collections::HashMap<u8, i32> = Default::default();
        let mut count = 0;
        while offset < written.len() {
            let (frame, used) = Frame::decode(&written[offset..]).unwrap();
            offset += used;
            count += 1;
            let dir = frame.payload()[0];
            let speed = frame.payload()[1] as i32;
            let prev = last.insert(dir, speed).unwrap_or(-1);
            assert_eq!(speed, prev + 1, "out of order for direction {}", dir);
        }
        assert_eq!(count, 200);
    }

    #[tokio::test]
    async fn write_failure_closes_until_reopened() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        t.open().unwrap();
        let mut events = t.subscribe();

        mock.fail_next_write();
        let err = t.write(&move_frame("W", 1)).await.unwrap_err();
        assert!(matches!(err, Error::WriteFailed(_)));
        assert!(!t.is_open());
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Error { .. }
        ));
        assert_eq!(next_event(&mut events).await, TransportEvent::Closed);

        let err = t.write(&move_frame("W", 2)).await.unwrap_err();
        assert!(matches!(err, Error::PortUnavailable(_)));

        t.open().unwrap();
        t.write(&move_frame("W", 3)).await.unwrap();
        assert_eq!(mock.write_count(), 1);
        assert_eq!(mock.open_count(), 2);
        assert_eq!(t.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn close_releases_port() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        t.open().unwrap();
        t.close();
        assert!(!t.is_open());
        assert!(matches!(
            t.write(&move_frame("W", 1)).await,
            Err(Error::PortUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn report_lines_become_telemetry() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        let mut events = t.subscribe();
        t.open().unwrap();
        let _ = next_event(&mut events).await;

        mock.inject(b"garbage\n@speed:1");
        mock.inject(b"2.5;;\n@battery:7800;;\n");

        match next_event(&mut events).await {
            TransportEvent::Telemetry(e) => {
                assert_eq!(e.channel(), "speed");
                assert_eq!(e.data(), serde_json::json!(12.5));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut events).await {
            TransportEvent::Telemetry(e) => assert_eq!(e.channel(), "battery"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_failure_closes() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        t.open().unwrap();
        let mut events = t.subscribe();

        mock.fail_next_read();
        match next_event(&mut events).await {
            TransportEvent::Error { reason } => assert!(reason.contains("read failed")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!t.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reopen_waits_for_write_in_progress() {
        let mock = MockConnector::new();
        mock.set_write_delay(Duration::from_millis(150));
        let t = transport(&mock);
        t.open().unwrap();

        let first = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.write(&move_frame("W", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        t.close();
        t.open().unwrap();

        let second = t.write(&move_frame("S", 2)).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(mock.max_concurrent_writes(), 1);
        assert!(first.sequence < second.sequence);
        assert_eq!(
            mock.writes(),
            vec![move_frame("W", 1).to_bytes().to_vec(), move_frame("S", 2).to_bytes().to_vec()]
        );
    }

    #[tokio::test]
    async fn open_with_switches_device() {
        let mock = MockConnector::new();
        let t = transport(&mock);
        let mut events = t.subscribe();
        t.open().unwrap();
        let _ = next_event(&mut events).await;

        // Same target is a no-op.
        t.open_with("/dev/mock", 115_200).unwrap();
        assert_eq!(mock.open_count(), 1);

        t.open_with("/dev/ttyACM0", 9600).unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Opened {
                port: "/dev/ttyACM0".into(),
                baud_rate: 9600
            }
        );
        assert_eq!(mock.last_port(), Some(("/dev/ttyACM0".to_string(), 9600)));
        let stats = t.stats();
        assert_eq!(stats.port, "/dev/ttyACM0");
        assert_eq!(stats.baud_rate, 9600);

        // Later reopens keep the new target.
        t.close();
        t.open().unwrap();
        assert_eq!(mock.open_count(), 3);
        assert_eq!(t.target(), ("/dev/ttyACM0".to_string(), 9600));
    }
}
