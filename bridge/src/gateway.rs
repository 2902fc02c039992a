//! Control gateway: client command in, serial frame out, result back.
//!
//! Every request is independent. A failure is answered to the requesting
//! client only and never affects other clients or the gateway itself.

use std::sync::Arc;

use carlink_codec::{Command, CommandDescriptor, encode};
use carlink_serial::{SerialTransport, WriteAck};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;
use crate::monitor::MonitorHub;

/// Reply sent to the originating client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Status { status: String },
    Error { error: String },
}

impl Response {
    pub fn sent() -> Self {
        Response::Status {
            status: "sent".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Status { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&GatewayError> for Response {
    fn from(e: &GatewayError) -> Self {
        Response::error(e.client_message())
    }
}

/// Routes client commands through the codec into the serial transport.
#[derive(Clone)]
pub struct ControlGateway {
    transport: Arc<SerialTransport>,
    monitor: MonitorHub,
    strict_direction: bool,
}

impl ControlGateway {
    pub fn new(transport: Arc<SerialTransport>, monitor: MonitorHub) -> Self {
        Self {
            transport,
            monitor,
            strict_direction: false,
        }
    }

    /// Reject unknown move directions instead of sending the sentinel byte.
    pub fn strict_direction(mut self, strict: bool) -> Self {
        self.strict_direction = strict;
        self
    }

    pub fn transport(&self) -> &Arc<SerialTransport> {
        &self.transport
    }

    /// Handle one raw client message.
    pub async fn handle_message(&self, text: &str) -> Response {
        match self.submit(text).await {
            Ok(_) => Response::sent(),
            Err(e) => Response::from(&e),
        }
    }

    /// Parse, encode and write one command.
    pub async fn submit(&self, text: &str) -> Result<WriteAck, GatewayError> {
        let descriptor = CommandDescriptor::from_json(text)?;
        self.execute(&descriptor).await
    }

    /// Encode and write an already parsed descriptor.
    pub async fn execute(&self, descriptor: &CommandDescriptor) -> Result<WriteAck, GatewayError> {
        let command = Command::from_descriptor(descriptor)?;
        if self.strict_direction {
            if let Command::Move { direction, .. } = &command {
                if !direction.is_known() {
                    return Err(GatewayError::MalformedRequest(format!(
                        "unknown direction {:?}",
                        direction.symbol()
                    )));
                }
            }
        }

        let frame = match encode(&command) {
            Ok(frame) => frame,
            Err(e) => {
                let err = GatewayError::from(e);
                self.monitor
                    .log(format!("command {} rejected: {}", command.kind(), err));
                return Err(err);
            }
        };

        match self.transport.write(&frame).await {
            Ok(ack) => {
                debug!("Command #{} written: {}", ack.sequence, command);
                self.monitor.log(format!("command sent: {}", command));
                Ok(ack)
            }
            Err(e) => {
                self.monitor
                    .log(format!("command {} failed: {}", command.kind(), e));
                Err(GatewayError::Transport(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientHandle;
    use carlink_serial::SerialConfig;
    use carlink_serial::mock::MockConnector;
    use std::time::Duration;

    fn gateway(mock: &MockConnector) -> (ControlGateway, MonitorHub) {
        let config = SerialConfig::new("/dev/mock", 115_200).read_timeout(Duration::from_millis(5));
        let transport = Arc::new(SerialTransport::new(config, Arc::new(mock.clone())));
        transport.open().unwrap();
        let monitor = MonitorHub::new();
        (ControlGateway::new(transport, monitor.clone()), monitor)
    }

    #[tokio::test]
    async fn sent_command_is_logged() {
        let mock = MockConnector::new();
        let (gw, monitor) = gateway(&mock);
        let (handle, mut rx) = ClientHandle::channel(8);
        monitor.register(handle);

        let resp = gw
            .handle_message(r#"{"type":"move","direction":"W","speed":50}"#)
            .await;
        assert_eq!(resp, Response::sent());
        assert_eq!(resp.to_json(), r#"{"status":"sent"}"#);
        assert_eq!(mock.written(), vec![0xAA, 0x01, 0x02, 0x57, 0x32, 0x36]);

        let log = rx.recv().await.unwrap();
        assert!(log.contains("command sent: move direction=W speed=50"));
    }

    #[tokio::test]
    async fn malformed_is_reply_only() {
        let mock = MockConnector::new();
        let (gw, monitor) = gateway(&mock);
        let (handle, mut rx) = ClientHandle::channel(8);
        monitor.register(handle);

        for text in ["{", r#"{"type":"move","speed":1}"#, r#"{"type":"adjustKL","value":"x"}"#] {
            let resp = gw.handle_message(text).await;
            assert_eq!(resp.to_json(), r#"{"error":"malformed command"}"#);
        }
        assert_eq!(mock.write_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsupported_never_reaches_transport() {
        let mock = MockConnector::new();
        let (gw, monitor) = gateway(&mock);
        let (handle, mut rx) = ClientHandle::channel(8);
        monitor.register(handle);

        let resp = gw.handle_message(r#"{"type":"honk"}"#).await;
        assert_eq!(resp, Response::error("unsupported command: honk"));
        assert_eq!(mock.write_count(), 0);
        assert_eq!(gw.transport().stats().frames_written, 0);
        assert!(rx.recv().await.unwrap().contains("honk rejected"));
    }

    #[tokio::test]
    async fn write_failure_maps_to_hardware_error() {
        let mock = MockConnector::new();
        let (gw, _monitor) = gateway(&mock);
        mock.fail_next_write();

        let resp = gw
            .handle_message(r#"{"type":"adjustKL","value":"300"}"#)
            .await;
        assert_eq!(resp, Response::error("hardware send failed"));

        // Port is closed now; fails fast with the same client message.
        let err = gw
            .submit(r#"{"type":"adjustKL","value":"300"}"#)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.client_message(), "hardware send failed");
    }

    #[tokio::test]
    async fn strict_direction_rejects_unknown() {
        let mock = MockConnector::new();
        let (gw, _monitor) = gateway(&mock);

        let lenient = gw
            .handle_message(r#"{"type":"move","direction":"Q","speed":1}"#)
            .await;
        assert!(lenient.is_ok());
        assert_eq!(mock.written()[3], 0x00);

        let strict = gw.clone().strict_direction(true);
        let resp = strict
            .handle_message(r#"{"type":"move","direction":"Q","speed":1}"#)
            .await;
        assert_eq!(resp, Response::error("malformed command"));
        assert_eq!(mock.write_count(), 1);
    }
}
