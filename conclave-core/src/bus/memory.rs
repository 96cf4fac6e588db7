use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{subject_matches, Bus, BusMessage, BusResult, ConsumerSpec, Subscription};

/// How many messages a single subscription buffers before publishes to it are dropped
const SUBSCRIPTION_DEPTH: usize = 256;

/// An in-process bus, used by tests and single-node deployments.
///
/// Durable consumers are recorded but not replayed, since nothing on this bus
/// outlives the process anyway.
#[derive(Default)]
pub struct MemoryBus {
    subscriptions: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
    consumers: DashMap<String, ConsumerSpec>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the durable consumers currently provisioned
    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.iter().map(|c| c.key().clone()).collect()
    }

    pub fn consumer(&self, name: &str) -> Option<ConsumerSpec> {
        self.consumers.get(name).map(|c| c.clone())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };

        let mut subscriptions = self.subscriptions.lock();

        // Closed receivers are pruned as a side effect of publishing
        subscriptions.retain(|(pattern, sender)| {
            if sender.is_closed() {
                return false;
            }

            if subject_matches(pattern, subject) {
                // A full subscription drops the message rather than blocking the publisher
                let _ = sender.try_send(message.clone());
            }

            true
        });

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_DEPTH);

        self.subscriptions
            .lock()
            .push((subject.to_string(), sender));

        Ok(Subscription::new(receiver))
    }

    async fn ensure_consumer(&self, spec: ConsumerSpec) -> BusResult<()> {
        self.consumers.insert(spec.name.clone(), spec);
        Ok(())
    }

    async fn delete_consumer(&self, name: &str) -> BusResult<()> {
        self.consumers.remove(name);
        Ok(())
    }
}
