//! Handoff channel: the at-least-once queue between two adjacent stages.
//!
//! A received message stays invisible to other receivers for the
//! transport's visibility window. Acknowledging removes it; not
//! acknowledging lets it reappear once the window lapses, which is the
//! only retry mechanism the pipeline relies on.

pub mod memory;

pub use memory::InMemoryChannel;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Message metadata travelling beside the body: the trace carrier plus the
/// redundant correlation id.
pub type Attributes = HashMap<String, String>;

/// Transport-assigned identifier of an enqueued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle used to acknowledge one delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle(pub(crate) i64);

/// A message as delivered to a receiver.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
    pub attributes: Attributes,
    pub ack_handle: AckHandle,
    /// How many times the transport has delivered this message, this one
    /// included. Above 1 means redelivery.
    pub receive_count: u32,
}

/// Send/receive/acknowledge primitives of one queue.
#[async_trait]
pub trait HandoffChannel: Send + Sync {
    /// Queue name, for logs and metric labels.
    fn name(&self) -> &str;

    async fn send(&self, body: Vec<u8>, attributes: Attributes) -> Result<MessageId>;

    /// Wait up to `max_wait` for one message. `Ok(None)` when nothing
    /// arrived in time.
    async fn receive(&self, max_wait: Duration) -> Result<Option<Message>>;

    /// Remove the message so it is never redelivered.
    async fn acknowledge(&self, handle: &AckHandle) -> Result<()>;
}
