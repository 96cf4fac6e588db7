use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

mod memory;
mod subjects;

pub use memory::*;
pub use subjects::*;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    /// The transport itself failed, not the request
    #[error("Bus is unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed subject: {0}")]
    MalformedSubject(String),
}

/// A single message as it travels over the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Describes a durable consumer attached to one or more subject filters.
/// Provisioning the same spec twice must be a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub name: String,
    pub filter_subjects: Vec<String>,
}

/// A live subscription to a subject pattern. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<BusMessage>) -> Self {
        Self { receiver }
    }

    /// Waits for the next message, returning [None] once the bus is gone
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Represents the cluster-wide publish/subscribe transport.
///
/// Every component takes this as a constructor argument, so a node can run
/// against the real transport or an in-memory one in tests.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes a payload to an exact subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribes to a subject pattern, `*` matching one token and `>` the rest
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;

    /// Creates or updates a durable consumer. Idempotent.
    async fn ensure_consumer(&self, spec: ConsumerSpec) -> BusResult<()>;

    /// Removes a durable consumer, if it exists
    async fn delete_consumer(&self, name: &str) -> BusResult<()>;
}
