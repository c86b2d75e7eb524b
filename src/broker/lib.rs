//! Persistent-stream broker client.
//!
//! [`Stream`] is the capability seam workers program against. The production
//! binding is [`nats::JetStreamBroker`]; tests use [`memory::MemoryStream`].
//! Stream and consumer shapes are declared up front and reconciled against
//! broker state on open, so a restarted worker converges the broker to its
//! declared configuration instead of failing on drift.

pub mod memory;
pub mod nats;

#[cfg(test)]
mod tests;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::trace::TraceContext;

pub use memory::MemoryStream;
pub use nats::{Credentials, JetStreamBroker, NatsOptions};

/// How long a dispatch task waits for a consumer to take a push delivery
/// before giving the message back to the broker.
pub const HANDOFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Redelivery delay applied when a push hand-off times out.
pub const NAK_DELAY: Duration = Duration::from_secs(5);

/// Default deadline for [`Stream::pull_one`].
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// Redelivery attempts before the broker gives up on a message.
pub const CONSUMER_MAX_DELIVER: i64 = 5;

/// Default stream retention age. Conditions that sit unclaimed this long are
/// stale by definition.
pub const STREAM_MAX_AGE: Duration = Duration::from_secs(3 * 60 * 60);

/// Capacity of the shared push hand-off channel.
pub const HANDOFF_BUFFER: usize = 10;

/// Channel of delivered messages, shared across all push subscriptions.
pub type MsgCh = mpsc::Receiver<Box<dyn Message>>;

/// Declarative stream shape.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub max_age: Duration,
    pub duplicate_window: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> StreamSpec {
        StreamSpec {
            name: name.into(),
            subjects,
            retention: Retention::Limits,
            max_age: STREAM_MAX_AGE,
            duplicate_window: Duration::from_secs(30),
        }
    }

    pub fn retention(mut self, retention: Retention) -> StreamSpec {
        self.retention = retention;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> StreamSpec {
        self.max_age = max_age;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Limits,
    Interest,
    WorkQueue,
}

/// Declarative consumer shape. Ack policy, deliver policy, and max-deliver
/// are fixed by this crate and not configurable.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub durable: String,
    pub mode: DeliveryMode,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
    pub queue_group: Option<String>,
    /// Pull mode: subjects `pull_one` may be called with. Push mode: one
    /// consumer per subject, all feeding the shared channel.
    pub subscribe_subjects: Vec<String>,
}

impl ConsumerSpec {
    pub fn pull(durable: impl Into<String>, subscribe_subjects: Vec<String>) -> ConsumerSpec {
        ConsumerSpec {
            durable: durable.into(),
            mode: DeliveryMode::Pull,
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 10,
            queue_group: None,
            subscribe_subjects,
        }
    }

    pub fn push(durable: impl Into<String>, subscribe_subjects: Vec<String>) -> ConsumerSpec {
        ConsumerSpec {
            durable: durable.into(),
            mode: DeliveryMode::Push,
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 10,
            queue_group: None,
            subscribe_subjects,
        }
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> ConsumerSpec {
        self.ack_wait = ack_wait;
        self
    }

    pub fn max_ack_pending(mut self, max_ack_pending: i64) -> ConsumerSpec {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> ConsumerSpec {
        self.queue_group = Some(group.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Pull,
    Push,
}

/// One delivered message. Exactly one terminal control op (`ack`, `nak`,
/// `term`) should be issued per delivery; `in_progress` may be sent any
/// number of times before that.
#[async_trait]
pub trait Message: Send + Sync + std::fmt::Debug {
    fn subject(&self) -> &str;
    fn data(&self) -> &[u8];

    /// Trace context propagated on the message headers, if the publisher
    /// attached one.
    fn trace_context(&self) -> Option<TraceContext>;

    /// Work finished, remove the message.
    async fn ack(&self) -> Result<()>;

    /// Give the message back for immediate redelivery.
    async fn nak(&self) -> Result<()>;

    /// Give the message back, redeliver no sooner than `delay`.
    async fn nak_with_delay(&self, delay: Duration) -> Result<()>;

    /// Still working, extend the redelivery deadline.
    async fn in_progress(&self) -> Result<()>;

    /// Poison message, never redeliver.
    async fn term(&self) -> Result<()>;
}

/// A configured stream endpoint.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Connect and reconcile declared stream/consumer state with the broker.
    async fn open(&mut self) -> Result<()>;

    /// Publish to `prefix.suffix`, carrying the trace context in headers.
    /// Transient broker timeouts are retried until the write is accepted.
    async fn publish(&self, trace: &TraceContext, suffix: &str, payload: &[u8]) -> Result<()>;

    /// Like [`Stream::publish`] but replaces any prior message on the same
    /// subject, so only the latest payload survives.
    async fn publish_overwrite(
        &self,
        trace: &TraceContext,
        suffix: &str,
        payload: &[u8],
    ) -> Result<()>;

    /// Start delivery. Push mode returns the shared message channel; pull
    /// mode binds its consumer and returns None.
    async fn subscribe(&mut self) -> Result<Option<MsgCh>>;

    /// Fetch a single message from a pull subscription, waiting at most
    /// `timeout`.
    async fn pull_one(&self, subject: &str, timeout: Duration) -> Result<Box<dyn Message>>;

    /// Stop subscriptions and drain the connection. Drain failures are
    /// reported but never leave the client half-open.
    async fn close(&mut self) -> Result<()>;
}
