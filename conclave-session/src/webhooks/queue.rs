use std::time::Duration;

use log::{debug, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use conclave_core::FabricConfig;

use super::{sign_body, WebhookError, API_KEY_HEADER, SIGNATURE_HEADER};

/// Delay between retries of one failed delivery, scaled by attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One serialized event on its way out, with the urls it was registered
/// against at enqueue time.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub body: String,
    pub urls: Vec<String>,
}

/// A node-local, bounded, async delivery queue for one room.
///
/// Deliveries are FIFO relative to enqueue order. Contents are lost on an
/// abrupt process crash, which is an accepted limitation.
pub struct DeliveryQueue {
    room_id: String,
    sender: mpsc::Sender<QueuedDelivery>,
    worker: JoinHandle<()>,
}

impl DeliveryQueue {
    pub fn spawn(room_id: String, http: reqwest::Client, config: FabricConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.webhook_queue_depth);

        let worker = tokio::spawn(run_worker(
            room_id.clone(),
            receiver,
            http,
            config.api_key,
            config.api_secret,
            config.webhook_retry_limit,
        ));

        Self {
            room_id,
            sender,
            worker,
        }
    }

    /// Enqueues a delivery without blocking. A full queue drops the event.
    pub fn enqueue(&self, delivery: QueuedDelivery) -> Result<(), WebhookError> {
        self.sender.try_send(delivery).map_err(|_| {
            warn!("Webhook queue for room {} is full, dropping event", self.room_id);
            WebhookError::QueueFull(self.room_id.clone())
        })
    }

    /// Stops the worker immediately, dropping whatever is still queued
    pub fn stop(self) {
        self.worker.abort();
    }
}

async fn run_worker(
    room_id: String,
    mut receiver: mpsc::Receiver<QueuedDelivery>,
    http: reqwest::Client,
    api_key: String,
    api_secret: String,
    retry_limit: usize,
) {
    while let Some(delivery) = receiver.recv().await {
        let signature = sign_body(&api_secret, &delivery.body);

        for url in &delivery.urls {
            deliver(
                &room_id, &http, &api_key, &signature, url, &delivery.body, retry_limit,
            )
            .await;
        }
    }
}

/// POSTs one body to one url, retrying transient failures a bounded number
/// of times before dropping the event with a warning.
async fn deliver(
    room_id: &str,
    http: &reqwest::Client,
    api_key: &str,
    signature: &str,
    url: &str,
    body: &str,
    retry_limit: usize,
) {
    for attempt in 0..=retry_limit {
        let response = http
            .post(url)
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, api_key)
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_string())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!("Delivered webhook for room {room_id} to {url}");
                return;
            }
            Ok(response) => {
                debug!(
                    "Webhook delivery to {url} got status {}, attempt {attempt}",
                    response.status()
                );
            }
            Err(e) => {
                debug!("Webhook delivery to {url} failed: {e}, attempt {attempt}");
            }
        }

        if attempt < retry_limit {
            tokio::time::sleep(RETRY_BACKOFF * (attempt as u32 + 1)).await;
        }
    }

    // Never fatal to the room lifecycle
    warn!("Dropping webhook for room {room_id} after {retry_limit} retries to {url}");
}
