//! Client connections.
//!
//! Each WebSocket is split into a read stream, owned by the connection task,
//! and an outbound queue drained by a dedicated writer task. Everything that
//! talks to a client (responses, telemetry, log lines) goes through its
//! [`ClientHandle`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ClientId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outbound half of a client connection.
///
/// Cloning is cheap; all clones feed the same queue.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Arc<str>>,
}

impl ClientHandle {
    /// Create a handle and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ClientId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a message, waiting for room.
    pub async fn send(&self, text: impl Into<Arc<str>>) -> Result<()> {
        self.tx
            .send(text.into())
            .await
            .map_err(|_| Error::ClientDisconnected)
    }

    /// Queue a message without waiting. Returns false if the queue is full
    /// or the client is gone.
    pub fn try_send(&self, text: Arc<str>) -> bool {
        self.tx.try_send(text).is_ok()
    }
}

/// A WebSocket after it has been split into its parts.
pub struct Attached {
    pub handle: ClientHandle,
    pub stream: SplitStream<WebSocket>,
    /// Cancelled when either side of the socket goes away.
    pub cancel: CancellationToken,
    pub writer: JoinHandle<()>,
}

/// Split `socket`, start its writer task, and tie its lifetime to `parent`.
pub fn attach(socket: WebSocket, queue: usize, parent: &CancellationToken) -> Attached {
    let (sink, stream) = socket.split();
    let (handle, rx) = ClientHandle::channel(queue);
    let cancel = parent.child_token();
    let writer = tokio::spawn(write_loop(handle.id(), sink, rx, cancel.clone()));
    Attached {
        handle,
        stream,
        cancel,
        writer,
    }
}

async fn write_loop(
    id: ClientId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = rx.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        if let Err(e) = sink.send(Message::Text(text.as_ref().into())).await {
            debug!("{} send failed: {}", id, e);
            cancel.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}
