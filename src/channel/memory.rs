//! In-process handoff channel for tests and the demo command.
//!
//! Mirrors the queue semantics the stages depend on: FIFO delivery,
//! a visibility timeout after each receive, redelivery of anything not
//! acknowledged in time, and a bounded wait on receive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{AckHandle, Attributes, HandoffChannel, Message, MessageId};
use crate::error::Result;

/// Upper bound on one sleep while waiting for a message, so messages whose
/// visibility window lapses are noticed without a push.
const POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct StoredMessage {
    id: i64,
    body: Vec<u8>,
    attributes: Attributes,
    /// When the message becomes visible again. `None` = visible now.
    visible_at: Option<Instant>,
    receive_count: u32,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at.is_none_or(|at| at <= now)
    }
}

/// FIFO queue with visibility-timeout redelivery.
#[derive(Debug)]
pub struct InMemoryChannel {
    name: String,
    visibility_timeout: Duration,
    messages: Mutex<VecDeque<StoredMessage>>,
    next_id: AtomicI64,
    arrived: Notify,
}

impl InMemoryChannel {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            messages: Mutex::new(VecDeque::new()),
            next_id: AtomicI64::new(1),
            arrived: Notify::new(),
        }
    }

    /// Messages not yet acknowledged, in flight or not.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages currently hidden by a visibility timeout.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| !m.is_visible(now))
            .count()
    }

    async fn try_take(&self) -> Option<Message> {
        let now = Instant::now();
        let mut messages = self.messages.lock().await;
        let stored = messages.iter_mut().find(|m| m.is_visible(now))?;
        stored.visible_at = Some(now + self.visibility_timeout);
        stored.receive_count += 1;
        Some(Message {
            id: MessageId(stored.id),
            body: stored.body.clone(),
            attributes: stored.attributes.clone(),
            ack_handle: AckHandle(stored.id),
            receive_count: stored.receive_count,
        })
    }
}

#[async_trait]
impl HandoffChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: Vec<u8>, attributes: Attributes) -> Result<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.messages.lock().await.push_back(StoredMessage {
            id,
            body,
            attributes,
            visible_at: None,
            receive_count: 0,
        });
        self.arrived.notify_waiters();
        Ok(MessageId(id))
    }

    async fn receive(&self, max_wait: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(msg) = self.try_take().await {
                return Ok(Some(msg));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_TICK);
            let _ = tokio::time::timeout(wait, self.arrived.notified()).await;
        }
    }

    async fn acknowledge(&self, handle: &AckHandle) -> Result<()> {
        // Acknowledging an already-removed message is a no-op.
        self.messages.lock().await.retain(|m| m.id != handle.0);
        Ok(())
    }
}
