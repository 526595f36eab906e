//! Streams in-flight progress and publishes terminal bundles to a durable
//! queue.
//!
//! Grounded on `original_source/benchmarker/send.py::connect_to_queue`
//! (durable queue declaration, persistent delivery mode) translated from
//! `pika`'s blocking API to `lapin`'s async one — the teacher pack never
//! needed a queue client, so this crate picks up `lapin` itself, the same
//! way `original_source` reaches for `aio_pika`/`pika`.

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::benchmarker::SharedTrace;
use crate::error::{Result, SandboxError};
use crate::metrics::metrics;

pub const DEFAULT_PUBLISH_INTERVAL_S: f64 = 0.5;

/// The durable document published to the queue (spec.md §6 report envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvelope {
    pub session_id: String,
    pub report_type: String,
    pub metadata: serde_json::Value,
    pub result: serde_json::Value,
    pub statistics: serde_json::Value,
}

/// Connect and declare `queue_name` durable, mirroring
/// `connect_to_queue`'s `channel.queue_declare(queue=QUEUE, durable=True)`.
pub async fn open_channel(amqp_url: &str, queue_name: &str) -> Result<Channel> {
    let connection = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .map_err(|err| SandboxError::Queue(format!("connecting to {amqp_url}: {err}")))?;
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| SandboxError::Queue(format!("opening channel: {err}")))?;
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| SandboxError::Queue(format!("declaring queue {queue_name}: {err}")))?;
    Ok(channel)
}

async fn publish_persistent(channel: &Channel, queue_name: &str, payload: &[u8]) -> Result<()> {
    channel
        .basic_publish(
            "",
            queue_name,
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .map_err(|err| SandboxError::Queue(format!("publishing to {queue_name}: {err}")))?
        .await
        .map_err(|err| SandboxError::Queue(format!("awaiting publish confirm: {err}")))?;
    Ok(())
}

/// One-shot publish of the terminal bundle (spec.md §4.6 `publish_final`).
pub async fn publish_final(envelope: &ReportEnvelope, amqp_url: &str, queue_name: &str) -> Result<()> {
    let channel = open_channel(amqp_url, queue_name).await?;
    let payload = serde_json::to_vec(envelope)
        .map_err(|err| SandboxError::Queue(format!("serializing report envelope: {err}")))?;
    publish_persistent(&channel, queue_name, &payload).await?;
    metrics().record_report_published();
    Ok(())
}

/// Recurring snapshot-and-publish task. Runs until `stop` fires; cancellation
/// is cooperative, halting at the next interval boundary (spec.md §4.6).
pub async fn start_periodic(
    trace: SharedTrace,
    session_id: String,
    amqp_url: String,
    queue_name: String,
    interval_s: f64,
    mut stop: watch::Receiver<bool>,
) {
    let channel = match open_channel(&amqp_url, &queue_name).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "periodic publisher failed to connect");
            return;
        }
    };

    let mut ticker = interval(Duration::from_secs_f64(interval_s.max(0.05)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }

        let snapshot = trace.snapshot();
        let envelope = ReportEnvelope {
            session_id: session_id.clone(),
            report_type: "benchmarker-snapshot".to_string(),
            metadata: serde_json::json!({ "in_flight": true }),
            result: serde_json::to_value(&snapshot).unwrap_or_default(),
            statistics: serde_json::Value::Null,
        };

        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed serializing snapshot");
                continue;
            }
        };

        match publish_persistent(&channel, &queue_name, &payload).await {
            Ok(()) => metrics().record_report_published(),
            Err(err) => warn!(session_id = %session_id, error = %err, "periodic publish failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_envelope_round_trips_through_json() {
        let envelope = ReportEnvelope {
            session_id: "abc123".into(),
            report_type: "benchmarker".into(),
            metadata: serde_json::json!({}),
            result: serde_json::json!({}),
            statistics: serde_json::json!({}),
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        let back: ReportEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.session_id, back.session_id);
        assert_eq!(envelope.report_type, back.report_type);
    }
}
