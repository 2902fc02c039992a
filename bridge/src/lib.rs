//! Command and telemetry bridge between web clients and the vehicle controller.
//!
//! ## Components
//!
//! - [`ControlGateway`]: client commands → codec → serial transport, one reply per request
//! - [`TelemetryRelay`]: last-value-wins fan-out of hardware events per channel
//! - [`MonitorHub`]: best-effort broadcast of diagnostic log lines
//! - [`Bridge`]: wires the above to one serial transport and two listeners
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use carlink_bridge::{Bridge, BridgeConfig, MonitorHub};
//! use carlink_serial::SystemConnector;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> carlink_bridge::Result<()> {
//!     let bridge = Bridge::new(BridgeConfig::default(), Arc::new(SystemConnector), MonitorHub::new());
//!     bridge.run(CancellationToken::new()).await
//! }
//! ```

mod config;
mod connection;
mod error;
mod gateway;
mod log_writer;
mod monitor;
mod relay;
mod server;

pub use config::{
    BridgeConfig, DEFAULT_CONTROL_ADDR, DEFAULT_MONITOR_ADDR, MonitorConfig, RelayConfig,
    parse_addr,
};
pub use connection::{ClientHandle, ClientId};
pub use error::{Error, GatewayError, Result};
pub use gateway::{ControlGateway, Response};
pub use log_writer::MonitorWriter;
pub use monitor::{LogEntry, MonitorHub};
pub use relay::{ALL_CHANNELS, RelayStats, TelemetryRelay};
pub use server::{AppState, Bridge, MonitorCounters, StatusReport, control_router, monitor_router};
