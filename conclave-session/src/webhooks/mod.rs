use dashmap::DashMap;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::task::JoinHandle;

use conclave_core::{BusError, CoordinationError, WEBHOOK_CLEANUP_SUBJECT};

use crate::{DatabaseError, LifecycleEvent, SessionContext, WebhookEvent};

mod queue;
pub use queue::*;

/// The coordination-store hash holding one registration per active room
pub const REGISTRY_KEY: &str = "webhookData";

/// Header carrying the tenant api key on every delivery
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the hex hmac-sha256 signature of the body
pub const SIGNATURE_HEADER: &str = "x-signature";

/// The durable per-room record of delivery urls and pending-deletion state.
/// Separate from the node-local delivery queue, which is memory only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRegistration {
    pub urls: Vec<String>,
    #[serde(rename = "performDeleting")]
    pub perform_deleting: bool,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Registration for room {0} is malformed")]
    MalformedRegistration(String),
    /// The room's local queue is full, the event is dropped
    #[error("Delivery queue for room {0} is full")]
    QueueFull(String),
}

/// Maintains one delivery queue per active room, POSTs lifecycle events to
/// the registered urls, and tears queues down cluster-wide once a room is
/// confirmed finished.
pub struct WebhookNotifier {
    context: SessionContext,
    http: reqwest::Client,
    queues: DashMap<String, DeliveryQueue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookNotifier {
    pub fn new(context: &SessionContext) -> Self {
        Self {
            context: context.clone(),
            http: reqwest::Client::new(),
            queues: Default::default(),
            tasks: Default::default(),
        }
    }

    /// Subscribes to the cluster-wide cleanup broadcast. The node deciding to
    /// clean up may not be the node holding the live queue, so every node
    /// listens and frees its own.
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<(), BusError> {
        let mut cleanup = self.context.bus.subscribe(WEBHOOK_CLEANUP_SUBJECT).await?;

        let notifier = self.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = cleanup.next().await {
                let Ok(room_id) = String::from_utf8(message.payload) else {
                    continue;
                };

                notifier.stop_local_queue(&room_id);
            }
        });

        self.tasks.lock().push(task);
        Ok(())
    }

    /// Stops the cleanup subscription and every local worker. In-flight queue
    /// contents are dropped, which is the documented loss window.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let rooms: Vec<_> = self.queues.iter().map(|q| q.key().clone()).collect();
        for room_id in rooms {
            self.stop_local_queue(&room_id);
        }
    }

    /// Registers a started room for delivery. A no-op when no urls are
    /// configured anywhere for it.
    pub async fn register(&self, room_id: &str, _sid: &str) -> Result<(), WebhookError> {
        let mut urls: Vec<String> = self
            .context
            .config
            .default_webhook_url
            .iter()
            .cloned()
            .collect();

        if let Some(url) = self.context.database.webhook_url_for_room(room_id).await? {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        if urls.is_empty() {
            debug!("No webhook urls configured for room {room_id}, skipping registration");
            return Ok(());
        }

        self.write_registration(
            room_id,
            &WebhookRegistration {
                urls,
                perform_deleting: false,
            },
        )
        .await
    }

    /// Enqueues one lifecycle event for delivery, updating the registration's
    /// pending-deletion state as a side effect.
    pub async fn notify(&self, room_id: &str, event: WebhookEvent) -> Result<(), WebhookError> {
        let Some(mut registration) = self.registration(room_id).await? else {
            debug!("Dropping {} for unregistered room {room_id}", event.event.as_str());
            return Ok(());
        };

        match event.event {
            LifecycleEvent::RoomStarted if registration.perform_deleting => {
                // A new session for the same room id beat the cleanup window
                info!("Reactivating webhook registration for room {room_id}");
                registration.perform_deleting = false;
                self.write_registration(room_id, &registration).await?;
            }
            LifecycleEvent::RoomFinished => {
                registration.perform_deleting = true;
                self.write_registration(room_id, &registration).await?;
            }
            _ => {}
        }

        let body = serde_json::to_string(&event).expect("webhook event serializes");

        let queue = self.queues.entry(room_id.to_string()).or_insert_with(|| {
            DeliveryQueue::spawn(
                room_id.to_string(),
                self.http.clone(),
                self.context.config.clone(),
            )
        });

        // A full queue already logged the drop, delivery pressure must never
        // fail the room lifecycle itself
        let _ = queue.enqueue(QueuedDelivery {
            body,
            urls: registration.urls,
        });

        Ok(())
    }

    /// Waits out the grace window, then deletes the registration and
    /// broadcasts queue teardown, unless a room_started reactivated it.
    pub fn schedule_cleanup(self: &std::sync::Arc<Self>, room_id: &str) {
        let notifier = self.clone();
        let room_id = room_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(notifier.context.config.webhook_cleanup_grace()).await;

            if let Err(e) = notifier.cleanup(&room_id).await {
                warn!("Webhook cleanup for room {room_id} failed: {e}");
            }
        });
    }

    pub(crate) async fn cleanup(&self, room_id: &str) -> Result<(), WebhookError> {
        let Some(registration) = self.registration(room_id).await? else {
            return Ok(());
        };

        if !registration.perform_deleting {
            debug!("Room {room_id} was reactivated, keeping its registration");
            return Ok(());
        }

        info!("Cleaning up webhook registration for room {room_id}");

        // Broadcast first so every node frees its local queue, then drop the
        // durable record
        self.context
            .bus
            .publish(WEBHOOK_CLEANUP_SUBJECT, room_id.as_bytes().to_vec())
            .await
            .ok();

        self.context
            .coordination
            .hash_delete(REGISTRY_KEY, room_id)
            .await?;

        // The broadcast also reaches this node, but freeing directly avoids
        // depending on our own subscription being alive
        self.stop_local_queue(room_id);
        Ok(())
    }

    pub async fn registration(
        &self,
        room_id: &str,
    ) -> Result<Option<WebhookRegistration>, WebhookError> {
        let Some(raw) = self
            .context
            .coordination
            .hash_get(REGISTRY_KEY, room_id)
            .await?
        else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| WebhookError::MalformedRegistration(room_id.to_string()))
    }

    async fn write_registration(
        &self,
        room_id: &str,
        registration: &WebhookRegistration,
    ) -> Result<(), WebhookError> {
        let raw = serde_json::to_string(registration).expect("registration serializes");

        self.context
            .coordination
            .hash_set(REGISTRY_KEY, room_id, &raw)
            .await
            .map_err(WebhookError::from)
    }

    fn stop_local_queue(&self, room_id: &str) {
        if let Some((_, queue)) = self.queues.remove(room_id) {
            info!("Stopping webhook delivery queue for room {room_id}");
            queue.stop();
        }
    }

    /// Whether this node currently holds a live queue for the room
    pub fn has_local_queue(&self, room_id: &str) -> bool {
        self.queues.contains_key(room_id)
    }
}

/// Signs a webhook body with the tenant secret, hex encoded
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use conclave_core::FabricConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn notifier_with_default_url() -> (Arc<WebhookNotifier>, SessionContext) {
        let config = FabricConfig {
            default_webhook_url: Some("http://127.0.0.1:9/hooks".to_string()),
            webhook_cleanup_grace_in_seconds: 0,
            webhook_retry_limit: 0,
            ..Default::default()
        };

        let (context, _events) = testing::context_with_config(config);
        (Arc::new(WebhookNotifier::new(&context)), context)
    }

    fn started(room_id: &str) -> WebhookEvent {
        WebhookEvent::room_lifecycle(LifecycleEvent::RoomStarted, room_id, "sid-1")
    }

    fn finished(room_id: &str) -> WebhookEvent {
        WebhookEvent::room_lifecycle(LifecycleEvent::RoomFinished, room_id, "sid-1")
    }

    #[tokio::test]
    async fn test_register_is_a_noop_without_urls() {
        let (context, _events) = testing::context();
        let notifier = WebhookNotifier::new(&context);

        notifier.register("room-1", "sid-1").await.unwrap();
        assert!(notifier.registration("room-1").await.unwrap().is_none());

        // Events for unregistered rooms are silently dropped
        notifier.notify("room-1", started("room-1")).await.unwrap();
        assert!(!notifier.has_local_queue("room-1"));
    }

    #[tokio::test]
    async fn test_second_start_within_grace_window_reactivates() {
        let (notifier, _context) = notifier_with_default_url();

        notifier.register("room-1", "sid-1").await.unwrap();
        notifier.notify("room-1", started("room-1")).await.unwrap();

        notifier.notify("room-1", finished("room-1")).await.unwrap();
        assert!(
            notifier
                .registration("room-1")
                .await
                .unwrap()
                .unwrap()
                .perform_deleting
        );

        // The second session starts before cleanup runs
        notifier.notify("room-1", started("room-1")).await.unwrap();

        let registration = notifier.registration("room-1").await.unwrap().unwrap();
        assert!(
            !registration.perform_deleting,
            "a reactivating start must clear the deletion flag"
        );

        // Cleanup now observes the reactivation and keeps the registration
        notifier.cleanup("room-1").await.unwrap();
        assert!(
            notifier.registration("room-1").await.unwrap().is_some(),
            "a reactivated registration is never deleted"
        );

        // Subsequent events continue to be delivered
        notifier.notify("room-1", finished("room-1")).await.unwrap();
        assert!(notifier.has_local_queue("room-1"));
    }

    #[tokio::test]
    async fn test_delivery_pressure_never_fails_notify() {
        let config = FabricConfig {
            default_webhook_url: Some("http://127.0.0.1:9/hooks".to_string()),
            webhook_queue_depth: 1,
            webhook_retry_limit: 3,
            ..Default::default()
        };

        let (context, _events) = testing::context_with_config(config);
        let notifier = Arc::new(WebhookNotifier::new(&context));

        notifier.register("room-1", "sid-1").await.unwrap();

        // Far more events than the queue holds, while the worker is stuck
        // retrying an unreachable url
        for _ in 0..16 {
            notifier
                .notify("room-1", finished("room-1"))
                .await
                .expect("a saturated queue must not fail notify");
        }

        notifier.shutdown();
    }

    #[tokio::test]
    async fn test_cleanup_deletes_registration_and_queue() {
        let (notifier, _context) = notifier_with_default_url();

        notifier.register("room-1", "sid-1").await.unwrap();
        notifier.notify("room-1", finished("room-1")).await.unwrap();
        assert!(notifier.has_local_queue("room-1"));

        notifier.cleanup("room-1").await.unwrap();

        assert!(notifier.registration("room-1").await.unwrap().is_none());
        assert!(!notifier.has_local_queue("room-1"));
    }

    #[tokio::test]
    async fn test_cleanup_broadcast_frees_other_nodes_queues() {
        let config = FabricConfig {
            default_webhook_url: Some("http://127.0.0.1:9/hooks".to_string()),
            webhook_retry_limit: 0,
            ..Default::default()
        };
        let (context, _events) = testing::context_with_config(config);

        // Two nodes sharing one bus and one coordination store
        let first = Arc::new(WebhookNotifier::new(&context));
        let second = Arc::new(WebhookNotifier::new(&context));
        second.start().await.unwrap();

        first.register("room-1", "sid-1").await.unwrap();
        second.notify("room-1", finished("room-1")).await.unwrap();
        assert!(second.has_local_queue("room-1"));

        // The first node decides to clean up, the second holds the queue
        first.cleanup("room-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !second.has_local_queue("room-1"),
            "the broadcast should free the other node's queue"
        );
    }

    #[test]
    fn test_signature_is_stable() {
        let signature = sign_body("secret", r#"{"event":"room_started"}"#);

        assert_eq!(signature.len(), 64);
        assert_eq!(signature, sign_body("secret", r#"{"event":"room_started"}"#));
        assert_ne!(signature, sign_body("other", r#"{"event":"room_started"}"#));
    }
}
