//! pgmq-backed handoff channel via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.send, pgmq.read_with_poll, pgmq.delete.
//! Queues are provisioned outside this crate.
//!
//! pgmq stores a single JSON document per message, so body and attributes
//! travel together in an envelope:
//!
//! ```json
//! { "body": "<serialized work item>", "attributes": { "traceparent": "...", "correlation-id": "..." } }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use super::Db;
use crate::channel::{AckHandle, Attributes, HandoffChannel, Message, MessageId};
use crate::error::{Error, Result};
use crate::telemetry::metrics::{self, MetricsSink};

/// Interval between pgmq's internal polls during a long-poll read.
const POLL_INTERVAL_MS: i32 = 100;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    body: String,
    #[serde(default)]
    attributes: Attributes,
}

/// One pgmq queue used as a handoff channel.
pub struct PgmqChannel {
    db: Arc<Db>,
    queue: String,
    visibility_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl PgmqChannel {
    pub fn new(
        db: Arc<Db>,
        queue: impl Into<String>,
        visibility_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            db,
            queue: queue.into(),
            visibility_timeout,
            metrics,
        }
    }

    fn record(&self, operation: &'static str) {
        self.metrics.incr(
            metrics::QUEUE_OPERATIONS,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

/// Split a stored pgmq document into body and attributes. Documents that
/// are not envelopes are delivered whole as the body.
fn open_envelope(document: serde_json::Value) -> (Vec<u8>, Attributes) {
    match serde_json::from_value::<Envelope>(document.clone()) {
        Ok(envelope) => (envelope.body.into_bytes(), envelope.attributes),
        Err(_) => (document.to_string().into_bytes(), Attributes::new()),
    }
}

fn whole_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX).max(1)
}

#[async_trait]
impl HandoffChannel for PgmqChannel {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn send(&self, body: Vec<u8>, attributes: Attributes) -> Result<MessageId> {
        let body = String::from_utf8(body)
            .map_err(|e| Error::transport(&self.queue, format!("body is not UTF-8: {e}")))?;
        let document = serde_json::to_value(Envelope { body, attributes })?;

        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(&self.queue)
            .bind(&document)
            .fetch_one(self.db.pool())
            .await?;
        self.record("send");
        Ok(MessageId(row.0))
    }

    async fn receive(&self, max_wait: Duration) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, (i64, i32, serde_json::Value)>(
            "SELECT msg_id, read_ct, message FROM pgmq.read_with_poll($1, $2, 1, $3, $4)",
        )
        .bind(&self.queue)
        .bind(whole_seconds(self.visibility_timeout))
        .bind(whole_seconds(max_wait))
        .bind(POLL_INTERVAL_MS)
        .fetch_optional(self.db.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, document)| {
            let (body, attributes) = open_envelope(document);
            Message {
                id: MessageId(msg_id),
                body,
                attributes,
                ack_handle: AckHandle(msg_id),
                receive_count: u32::try_from(read_ct).unwrap_or(0),
            }
        });

        self.record(if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&self.queue)
            .bind(handle.0)
            .execute(self.db.pool())
            .await?;
        self.record("delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_splits_body_and_attributes() {
        let (body, attrs) = open_envelope(json!({
            "body": "{\"correlation_id\":\"abc\"}",
            "attributes": {"correlation-id": "abc"}
        }));
        assert_eq!(body, br#"{"correlation_id":"abc"}"#);
        assert_eq!(attrs.get("correlation-id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn bare_document_becomes_body() {
        let (body, attrs) = open_envelope(json!({"correlation_id": "abc", "data": "x"}));
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["correlation_id"], "abc");
        assert!(attrs.is_empty());
    }

    #[test]
    fn wait_rounds_up_to_one_second() {
        assert_eq!(whole_seconds(Duration::from_millis(200)), 1);
        assert_eq!(whole_seconds(Duration::from_secs(20)), 20);
    }
}
