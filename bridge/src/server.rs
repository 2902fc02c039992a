//! HTTP and WebSocket surface.
//!
//! Control listener:
//! - GET  /, /ws        - control WebSocket (`?channels=a,b` also joins telemetry)
//! - GET  /telemetry    - telemetry WebSocket (`?channels=a,b`, default all)
//! - POST /api/command  - one command, same body and reply as the WebSocket
//! - POST /api/telemetry - ingest `{channel, data}` from off-link producers
//! - GET  /api/status   - transport, relay and pool counters
//!
//! Monitor listener:
//! - GET  /, /monitor   - monitor WebSocket (`{log}` broadcasts)

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use carlink_codec::{TelemetryEvent, TelemetryMessage};
use carlink_serial::{Connector, SerialTransport, TransportEvent, TransportStats};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, parse_addr};
use crate::connection::{self, Attached, ClientHandle};
use crate::error::{Error, Result};
use crate::gateway::{ControlGateway, Response};
use crate::monitor::MonitorHub;
use crate::relay::{ALL_CHANNELS, RelayStats, TelemetryRelay};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    gateway: ControlGateway,
    relay: TelemetryRelay,
    monitor: MonitorHub,
    control_clients: Arc<AtomicUsize>,
    telemetry_clients: Arc<AtomicUsize>,
    client_queue: usize,
    cancel: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelQuery {
    channels: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionRequest {
    #[serde(default)]
    subscribe: Vec<String>,
    #[serde(default)]
    unsubscribe: Vec<String>,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub serial: TransportStats,
    pub control_clients: usize,
    pub telemetry_clients: usize,
    pub monitor_clients: usize,
    pub telemetry: RelayStats,
    pub monitor: MonitorCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorCounters {
    pub sent: u64,
    pub skipped: u64,
}

/// Router for the control listener.
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_control))
        .route("/ws", get(ws_control))
        .route("/telemetry", get(ws_telemetry))
        .route("/api/command", post(post_command))
        .route("/api/telemetry", post(post_telemetry))
        .route("/api/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Router for the monitor listener.
pub fn monitor_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_monitor))
        .route("/monitor", get(ws_monitor))
        .with_state(state)
}

/// Comma-separated tags; empty means every channel.
fn parse_tags(raw: Option<&str>) -> Vec<String> {
    let tags: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if tags.is_empty() {
        vec![ALL_CHANNELS.to_string()]
    } else {
        tags
    }
}

async fn ws_control(
    ws: WebSocketUpgrade,
    Query(query): Query<ChannelQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_control(socket, state, query.channels))
}

async fn ws_telemetry(
    ws: WebSocketUpgrade,
    Query(query): Query<ChannelQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_telemetry(socket, state, query.channels))
}

async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_monitor(socket, state))
}

async fn post_command(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.gateway.submit(&body).await {
        Ok(_) => (StatusCode::OK, Json(Response::sent())),
        Err(e) => {
            let code = if e.is_transport() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_REQUEST
            };
            (code, Json(Response::from(&e)))
        }
    }
}

async fn post_telemetry(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let event = serde_json::from_str::<TelemetryMessage>(&body)
        .ok()
        .and_then(TelemetryEvent::from_message);
    match event {
        Some(event) => {
            state.relay.publish(event);
            (
                StatusCode::ACCEPTED,
                Json(Response::Status {
                    status: "accepted".to_string(),
                }),
            )
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(Response::error("malformed telemetry")),
        ),
    }
}

async fn get_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status())
}

impl AppState {
    pub fn status(&self) -> StatusReport {
        let (sent, skipped) = self.monitor.counters();
        StatusReport {
            serial: self.gateway.transport().stats(),
            control_clients: self.control_clients.load(Ordering::Relaxed),
            telemetry_clients: self.telemetry_clients.load(Ordering::Relaxed),
            monitor_clients: self.monitor.len(),
            telemetry: self.relay.stats(),
            monitor: MonitorCounters { sent, skipped },
        }
    }
}

/// Control connection: read commands, answer each in order.
async fn serve_control(socket: WebSocket, state: AppState, channels: Option<String>) {
    let Attached {
        handle,
        mut stream,
        cancel,
        writer,
    } = connection::attach(socket, state.client_queue, &state.cancel);
    let id = handle.id();
    state.control_clients.fetch_add(1, Ordering::Relaxed);
    if channels.is_some() {
        state
            .relay
            .subscribe(handle.clone(), parse_tags(channels.as_deref()));
    }
    info!("Control {} connected", id);

    let (req_tx, req_rx) = mpsc::channel::<String>(state.client_queue);
    let dispatcher = tokio::spawn(dispatch_loop(
        state.gateway.clone(),
        handle.clone(),
        req_rx,
        cancel.clone(),
    ));

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("{} read error: {}", id, e);
                break;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = req_tx.send(text) => if sent.is_err() { break },
        }
    }

    // Pending response waits end here; writes already queued still complete.
    cancel.cancel();
    drop(req_tx);
    state.relay.remove(id);
    state.control_clients.fetch_sub(1, Ordering::Relaxed);
    let _ = dispatcher.await;
    let _ = writer.await;
    info!("Control {} disconnected", id);
}

/// Handle one client's requests sequentially so its replies keep its order.
async fn dispatch_loop(
    gateway: ControlGateway,
    handle: ClientHandle,
    mut requests: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = requests.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        // The command runs to completion (write and log entry) even if the
        // client leaves; only the wait for its reply is abandoned.
        let job = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.handle_message(&text).await }
        });
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            joined = job => match joined {
                Ok(response) => response,
                Err(e) => {
                    warn!("command task failed: {}", e);
                    Response::error("hardware send failed")
                }
            },
        };
        if handle.send(response.to_json()).await.is_err() {
            break;
        }
    }
}

/// Telemetry connection: manage subscriptions; the relay does the sending.
async fn serve_telemetry(socket: WebSocket, state: AppState, channels: Option<String>) {
    let Attached {
        handle,
        mut stream,
        cancel,
        writer,
    } = connection::attach(socket, state.client_queue, &state.cancel);
    let id = handle.id();
    state
        .relay
        .subscribe(handle.clone(), parse_tags(channels.as_deref()));
    state.telemetry_clients.fetch_add(1, Ordering::Relaxed);
    info!("Telemetry {} connected", id);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<SubscriptionRequest>(text.as_str()) {
                    Ok(req) => {
                        state.relay.add_tags(id, req.subscribe);
                        state.relay.remove_tags(id, req.unsubscribe);
                    }
                    Err(_) => {
                        let reply = Response::error("malformed subscription").to_json();
                        if handle.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("{} read error: {}", id, e);
                break;
            }
        }
    }

    cancel.cancel();
    state.relay.remove(id);
    state.telemetry_clients.fetch_sub(1, Ordering::Relaxed);
    let _ = writer.await;
    info!("Telemetry {} disconnected", id);
}

/// Monitor connection: receive-only from the client's point of view.
async fn serve_monitor(socket: WebSocket, state: AppState) {
    let Attached {
        handle,
        mut stream,
        cancel,
        writer,
    } = connection::attach(socket, state.client_queue, &state.cancel);
    let id = handle.id();
    state.monitor.register(handle);
    info!("Monitor {} connected", id);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => debug!("Monitor {} sent: {}", id, text.as_str()),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("{} read error: {}", id, e);
                break;
            }
        }
    }

    cancel.cancel();
    state.monitor.unregister(id);
    let _ = writer.await;
    info!("Monitor {} disconnected", id);
}

/// The assembled bridge: one transport, one relay, one monitor pool.
pub struct Bridge {
    config: BridgeConfig,
    transport: Arc<SerialTransport>,
    monitor: MonitorHub,
    relay: TelemetryRelay,
    gateway: ControlGateway,
}

impl Bridge {
    /// Build the bridge. The serial port is opened by [`serve`](Self::serve).
    pub fn new(config: BridgeConfig, connector: Arc<dyn Connector>, monitor: MonitorHub) -> Self {
        let transport = Arc::new(SerialTransport::new(config.serial.clone(), connector));
        let relay = TelemetryRelay::new(config.telemetry.clone());
        let gateway = ControlGateway::new(Arc::clone(&transport), monitor.clone())
            .strict_direction(config.strict_direction);
        Self {
            config,
            transport,
            monitor,
            relay,
            gateway,
        }
    }

    pub fn transport(&self) -> Arc<SerialTransport> {
        Arc::clone(&self.transport)
    }

    pub fn monitor(&self) -> MonitorHub {
        self.monitor.clone()
    }

    pub fn relay(&self) -> TelemetryRelay {
        self.relay.clone()
    }

    /// Bind the configured addresses and serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let control = TcpListener::bind(parse_addr(&self.config.control_addr)?).await?;
        let monitor = TcpListener::bind(parse_addr(&self.config.monitor_addr)?).await?;
        self.serve(control, monitor, cancel).await
    }

    /// Serve on already bound listeners until `cancel` fires.
    pub async fn serve(
        self,
        control: TcpListener,
        monitor: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        let pump = spawn_event_pump(
            self.transport.subscribe(),
            self.relay.clone(),
            self.monitor.clone(),
            cancel.clone(),
        );
        self.open_serial().await;

        let flushers = self.relay.spawn_flushers(cancel.clone());
        let supervisor = self.config.serial.reconnect_duration().map(|interval| {
            tokio::spawn(carlink_serial::supervise(
                Arc::clone(&self.transport),
                interval,
                cancel.clone(),
            ))
        });

        let state = AppState {
            gateway: self.gateway.clone(),
            relay: self.relay.clone(),
            monitor: self.monitor.clone(),
            control_clients: Arc::new(AtomicUsize::new(0)),
            telemetry_clients: Arc::new(AtomicUsize::new(0)),
            client_queue: self.config.client_queue,
            cancel: cancel.clone(),
        };

        info!("Control listening on {}", control.local_addr()?);
        info!("Monitor listening on {}", monitor.local_addr()?);

        let control_server = axum::serve(control, control_router(state.clone()))
            .with_graceful_shutdown(shutdown_signal(cancel.clone()));
        let monitor_server = axum::serve(monitor, monitor_router(state))
            .with_graceful_shutdown(shutdown_signal(cancel.clone()));

        let result = tokio::try_join!(async { control_server.await }, async {
            monitor_server.await
        });

        cancel.cancel();
        self.transport.close();
        let _ = pump.await;
        for task in flushers {
            let _ = task.await;
        }
        if let Some(task) = supervisor {
            let _ = task.await;
        }
        info!("Bridge stopped");

        result.map(|_| ()).map_err(Error::Io)
    }

    async fn open_serial(&self) {
        let transport = Arc::clone(&self.transport);
        match tokio::task::spawn_blocking(move || transport.open()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Serial port unavailable at startup: {}", e);
                self.monitor.log(format!("serial port unavailable: {}", e));
            }
            Err(e) => warn!("Serial open task failed: {}", e),
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
}

/// Route transport events to the relay and the monitor pool.
fn spawn_event_pump(
    mut events: broadcast::Receiver<TransportEvent>,
    relay: TelemetryRelay,
    monitor: MonitorHub,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(TransportEvent::Telemetry(event)) => relay.publish(event),
                Ok(TransportEvent::Opened { port, baud_rate }) => {
                    monitor.log(format!("serial port {} opened at {} baud", port, baud_rate));
                    relay.publish(TelemetryEvent::status(
                        "serial",
                        json!({ "state": "open", "port": port }),
                    ));
                }
                Ok(TransportEvent::Error { reason }) => {
                    monitor.log(format!("serial error: {}", reason));
                    relay.publish(TelemetryEvent::status(
                        "serial",
                        json!({ "state": "error", "reason": reason }),
                    ));
                }
                Ok(TransportEvent::Closed) => {
                    monitor.log("serial port closed");
                    relay.publish(TelemetryEvent::status("serial", json!({ "state": "closed" })));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Transport event pump lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
