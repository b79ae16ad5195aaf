//! Driver spawns and manages the feed processing task

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::KartwallError;
use crate::connection::Shared;
use crate::transport::TransportConnection;
use crate::types::ConnectionState;

/// Keepalive frame sent while connected
pub const KEEPALIVE_FRAME: &str = r#"{"type":"ping"}"#;

/// How a connection stopped delivering frames
enum Ended {
    Cancelled,
    Dropped(KartwallError),
}

/// Driver owns the open connection for one circuit
///
/// A single task reads frames in delivery order, sends keepalives, and runs
/// the reconnect loop when an established connection drops. The task stops
/// on cancellation or once reconnect attempts are exhausted.
pub(crate) struct Driver;

impl Driver {
    /// Spawn the driver task for an established connection
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        connection: Box<dyn TransportConnection>,
        circuit_id: String,
        url: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            Self::run(shared, connection, circuit_id, url, cancel).await;
        })
    }

    async fn run(
        shared: Arc<Shared>,
        mut connection: Box<dyn TransportConnection>,
        circuit_id: String,
        url: String,
        cancel: CancellationToken,
    ) {
        info!(circuit = %circuit_id, "Feed driver started");

        loop {
            let ended = Self::pump(&shared, connection.as_mut(), &circuit_id, &cancel).await;
            connection.close().await;

            match ended {
                Ended::Cancelled => {
                    info!(circuit = %circuit_id, "Feed driver cancelled");
                    return;
                }
                Ended::Dropped(e) => {
                    warn!(circuit = %circuit_id, error = %e, "Connection lost");
                    shared.record_error(&e);
                }
            }

            match Self::reconnect(&shared, &url, &cancel).await {
                Some(next) => connection = next,
                None => return,
            }
        }
    }

    /// Read frames until the connection ends or the driver is cancelled
    async fn pump(
        shared: &Shared,
        connection: &mut dyn TransportConnection,
        circuit_id: &str,
        cancel: &CancellationToken,
    ) -> Ended {
        let period = shared.config.keepalive_interval();
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ended::Cancelled,
                result = connection.next_frame() => match result {
                    Ok(Some(text)) => {
                        frames += 1;
                        trace!(frame = frames, bytes = text.len(), "Frame received");
                        shared.ingest(circuit_id, &text, cancel).await;
                    }
                    Ok(None) => return Ended::Dropped(KartwallError::transport("connection closed by feed")),
                    Err(e) => return Ended::Dropped(e),
                },
                _ = keepalive.tick() => {
                    // Send failures surface through the read side.
                    if let Err(e) = connection.send(KEEPALIVE_FRAME.to_string()).await {
                        debug!(error = %e, "Keepalive send failed");
                    }
                }
            }
        }
    }

    /// Retry with a fixed delay; `None` once attempts run out or on cancel
    async fn reconnect(
        shared: &Shared,
        url: &str,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn TransportConnection>> {
        let max_attempts = shared.config.max_reconnect_attempts;
        let delay = shared.config.reconnect_delay();

        for attempt in 1..=max_attempts {
            shared.set_state(ConnectionState::Reconnecting { attempt }, cancel);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            shared.set_state(ConnectionState::Connecting, cancel);
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = shared.open(url) => result,
            };
            match result {
                Ok(connection) => {
                    info!(url, attempt, "Reconnected");
                    shared.set_state(ConnectionState::Connected, cancel);
                    return Some(connection);
                }
                Err(e) => {
                    warn!(url, attempt, max_attempts, error = %e, "Reconnect attempt failed");
                    shared.record_error(&e);
                }
            }
        }

        error!(url, max_attempts, "Giving up on timing feed; call connect() or reconnect() to retry");
        shared.set_state(ConnectionState::Disconnected, cancel);
        None
    }
}
