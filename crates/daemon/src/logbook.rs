//! Writes guardian events to the log as logbook lines.

use lastseen_events::{describe, BusEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Log every guardian event on the bus until cancelled.
pub async fn run(mut rx: broadcast::Receiver<BusEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(BusEvent::Guardian(event)) => {
                    let entry = describe(&event);
                    tracing::info!(
                        event_type = event.event_type(),
                        entity_id = %event.entity_id(),
                        icon = entry.icon,
                        "{}: {}",
                        entry.name,
                        entry.message
                    );
                }
                Ok(BusEvent::StateChanged(event)) => {
                    tracing::trace!(
                        entity_id = %event.entity_id,
                        state = %event.state,
                        "State changed"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Logbook lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
