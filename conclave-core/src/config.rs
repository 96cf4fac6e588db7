use std::time::Duration;

/// The configuration of the coordination fabric.
///
/// One instance is shared by every component on a node, so changing a value
/// here changes it for the callout, the notifier, and the scheduler alike.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Key id the cluster signs capability tokens with
    pub issuer_key_id: String,
    /// Secret the cluster signs capability tokens with
    pub issuer_secret: String,
    /// How long an issued capability token stays valid
    pub token_ttl_in_seconds: u64,

    /// Tenant api key, sent along with signed webhook deliveries
    pub api_key: String,
    /// Tenant api secret, used to sign webhook bodies
    pub api_secret: String,
    /// Webhook url every room reports to, in addition to per-room urls
    pub default_webhook_url: Option<String>,

    /// How long a room creation guard lives before it self-expires
    pub creation_guard_ttl_in_seconds: u64,
    /// How often a waiter polls an active creation guard
    pub guard_poll_interval_in_millis: u64,

    /// How long cleanup waits for a reactivating room_started event
    pub webhook_cleanup_grace_in_seconds: u64,
    /// How many times a failed webhook delivery is retried before dropping
    pub webhook_retry_limit: usize,
    /// How many pending deliveries a room's local queue holds
    pub webhook_queue_depth: usize,

    /// How often the duration enforcement loop ticks
    pub duration_check_interval_in_seconds: u64,
    /// How often the provider reconciliation loop ticks
    pub reconcile_interval_in_seconds: u64,
    /// How long a lock guarding a periodic job lives
    pub scheduler_lock_ttl_in_seconds: u64,
    /// How old an empty room must be before it is force-ended
    pub stale_room_threshold_in_hours: u64,
}

impl FabricConfig {
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_in_seconds as i64)
    }

    pub fn creation_guard_ttl(&self) -> Duration {
        Duration::from_secs(self.creation_guard_ttl_in_seconds)
    }

    pub fn guard_poll_interval(&self) -> Duration {
        Duration::from_millis(self.guard_poll_interval_in_millis)
    }

    pub fn webhook_cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.webhook_cleanup_grace_in_seconds)
    }

    pub fn duration_check_interval(&self) -> Duration {
        Duration::from_secs(self.duration_check_interval_in_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_in_seconds)
    }

    pub fn scheduler_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler_lock_ttl_in_seconds)
    }

    pub fn stale_room_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_room_threshold_in_hours as i64)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            issuer_key_id: "conclave-issuer".to_string(),
            issuer_secret: "insecure-development-issuer-secret".to_string(),
            token_ttl_in_seconds: 60 * 10,

            api_key: "conclave".to_string(),
            api_secret: "insecure-development-api-secret".to_string(),
            default_webhook_url: None,

            creation_guard_ttl_in_seconds: 60,
            guard_poll_interval_in_millis: 500,

            webhook_cleanup_grace_in_seconds: 30,
            webhook_retry_limit: 3,
            webhook_queue_depth: 64,

            duration_check_interval_in_seconds: 5,
            reconcile_interval_in_seconds: 60 * 5,
            scheduler_lock_ttl_in_seconds: 60,
            stale_room_threshold_in_hours: 24,
        }
    }
}
