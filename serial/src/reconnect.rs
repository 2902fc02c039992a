//! Optional reopen loop for a closed transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::SerialTransport;

/// Periodically reopen `transport` while it is closed, until `cancel` fires.
///
/// Individual writes are never retried; this only restores the port so that
/// later writes can succeed.
pub async fn supervise(
    transport: Arc<SerialTransport>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        "Serial reconnect enabled every {}ms for {}",
        interval.as_millis(),
        transport.config().port
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if transport.is_open() {
            continue;
        }

        let t = Arc::clone(&transport);
        match tokio::task::spawn_blocking(move || t.open()).await {
            Ok(Ok(())) => info!("Serial port {} reopened", transport.config().port),
            Ok(Err(e)) => debug!("Serial reopen failed: {}", e),
            Err(e) => warn!("Serial reopen task failed: {}", e),
        }
    }

    debug!("Serial reconnect stopped");
}
