//! Line-oriented input for the daemon.
//!
//! Each input line is one JSON object:
//!
//! - a state change, `{"entity_id": "sensor.door", "state": "on",
//!   "timestamp": 1700000000.0, "attributes": {...}}`, handed to the
//!   guardian and then published on the event bus for other subscribers
//!   (`timestamp` defaults to now). The guardian's channel is bounded, so
//!   a burst slows reading down instead of dropping events;
//! - a command, `{"type": "get_summary", "id": 7}`, dispatched through the
//!   [`CommandRouter`] with the response written as one JSON line.

use std::sync::Arc;

use lastseen_core::types::{now_secs, EpochSecs};
use lastseen_engine::commands::CommandRouter;
use lastseen_engine::guardian::GuardianHandle;
use lastseen_events::{EventBus, StateChangedEvent};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Counters for one ingest session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub events: u64,
    pub commands: u64,
    pub rejected: u64,
}

#[derive(Debug, Deserialize)]
struct InboundState {
    entity_id: String,
    state: String,
    #[serde(default)]
    timestamp: Option<EpochSecs>,
    #[serde(default)]
    attributes: serde_json::Map<String, serde_json::Value>,
}

/// Read lines until EOF, cancellation or the guardian stopping.
pub async fn run<R, W>(
    reader: R,
    mut writer: W,
    bus: Arc<EventBus>,
    guardian: GuardianHandle,
    router: CommandRouter,
    connection_id: String,
    cancel: CancellationToken,
) -> std::io::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IngestStats::default();
    tracing::info!(connection_id = %connection_id, "Ingest session started");

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!(connection_id = %connection_id, "Input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed input line");
                stats.rejected += 1;
                continue;
            }
        };

        if value.get("type").is_some() {
            stats.commands += 1;
            let response = handle_command(&router, &connection_id, value).await;
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
            continue;
        }

        match serde_json::from_value::<InboundState>(value) {
            Ok(inbound) => {
                let event = StateChangedEvent::new(
                    inbound.entity_id,
                    inbound.timestamp.unwrap_or_else(now_secs),
                    inbound.state,
                )
                .with_attributes(inbound.attributes);
                if let Err(e) = guardian.observe(event.clone()).await {
                    tracing::error!(error = %e, "Guardian unavailable, stopping ingest");
                    break;
                }
                bus.publish_state(event);
                stats.events += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring input line that is neither event nor command");
                stats.rejected += 1;
            }
        }
    }

    router.disconnect(&connection_id).await;
    tracing::info!(
        connection_id = %connection_id,
        events = stats.events,
        commands = stats.commands,
        rejected = stats.rejected,
        "Ingest session ended"
    );
    Ok(stats)
}

async fn handle_command(
    router: &CommandRouter,
    connection_id: &str,
    mut value: serde_json::Value,
) -> serde_json::Value {
    let id = value
        .as_object_mut()
        .and_then(|obj| obj.remove("id"))
        .unwrap_or(serde_json::Value::Null);

    match router.dispatch_json(connection_id, value).await {
        Ok(result) => json!({ "id": id, "success": true, "result": result }),
        Err(e) => json!({ "id": id, "success": false, "error": e }),
    }
}

#[cfg(test)]
mod tests {
    use lastseen_engine::guardian::{Guardian, GuardianOptions};
    use lastseen_engine::storage::MemoryStore;
    use lastseen_events::BusEvent;

    use super::*;

    async fn guardian(bus: Arc<EventBus>) -> GuardianHandle {
        let guardian = Guardian::load(
            Arc::new(MemoryStore::new()),
            bus,
            GuardianOptions::default(),
        )
        .await;
        let (handle, _task) = guardian.spawn(CancellationToken::new());
        handle
    }

    #[tokio::test]
    async fn events_go_to_bus_and_commands_get_responses() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let handle = guardian(bus.clone()).await;
        let router = CommandRouter::new(handle.clone());

        let input = concat!(
            r#"{"entity_id": "sensor.door", "state": "on", "timestamp": 100.0, "attributes": {"battery": 80}}"#,
            "\n\n",
            "not json\n",
            r#"{"state": "on"}"#,
            "\n",
            r#"{"type": "get_config", "id": 7}"#,
            "\n",
            r#"{"type": "set_mode", "mode": "party", "id": 8}"#,
            "\n",
        );
        let mut output = Vec::new();

        let stats = run(
            input.as_bytes(),
            &mut output,
            bus,
            handle.clone(),
            router,
            "test".into(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            stats,
            IngestStats {
                events: 1,
                commands: 2,
                rejected: 2,
            }
        );

        match rx.try_recv().unwrap() {
            BusEvent::StateChanged(event) => {
                assert_eq!(event.entity_id, "sensor.door");
                assert_eq!(event.timestamp, 100.0);
                assert_eq!(event.attributes["battery"], 80);
            }
            other => panic!("unexpected bus event: {other:?}"),
        }

        let responses: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 7);
        assert_eq!(responses[0]["success"], true);
        assert_eq!(responses[0]["result"]["config"]["modes"]["current"], "normal");
        assert_eq!(responses[1]["id"], 8);
        assert_eq!(responses[1]["success"], false);
        assert_eq!(responses[1]["error"]["code"], "invalid_input");

        let stats = handle.entity_stats("sensor.door").await.unwrap().unwrap();
        assert_eq!(stats.event_count, 1);
    }

    #[tokio::test]
    async fn bursts_larger_than_the_bus_are_all_learned() {
        let bus = Arc::new(EventBus::default());
        let handle = guardian(bus.clone()).await;
        let router = CommandRouter::new(handle.clone());

        let lines = 3_000;
        let input: String = (0..lines)
            .map(|i| format!(r#"{{"entity_id": "sensor.a", "state": "on", "timestamp": {i}.0}}"#) + "\n")
            .collect();

        let stats = run(
            input.as_bytes(),
            tokio::io::sink(),
            bus,
            handle.clone(),
            router,
            "burst".into(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(stats.events, lines);

        let record = handle.entity_stats("sensor.a").await.unwrap().unwrap();
        assert_eq!(record.event_count, lines);
    }
}
