use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use conclave_core::{
    private_subject, room_subject, BusError, ChannelClass, PresenceError, RoomInfo, RoomMetadata,
    UserStatus, CONNECTED_EVENTS_SUBJECT, DISCONNECTED_EVENTS_SUBJECT,
};

use crate::{
    LifecycleEvent, SessionContext, SessionEvent, SystemEvent, WebhookEvent, WebhookNotifier,
};

/// Publishes room/user state changes as system events so every connected
/// client converges, and consumes bus-level connect/disconnect events to keep
/// the presence store current.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    context: SessionContext,
    webhooks: Arc<WebhookNotifier>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl PresenceBroadcaster {
    pub fn new(context: &SessionContext, webhooks: &Arc<WebhookNotifier>) -> Self {
        Self {
            context: context.clone(),
            webhooks: webhooks.clone(),
            tasks: Default::default(),
        }
    }

    /// Subscribes to the bus-level connection event subjects
    pub async fn start(&self) -> Result<(), BusError> {
        let mut connected = self.context.bus.subscribe(CONNECTED_EVENTS_SUBJECT).await?;
        let mut disconnected = self
            .context
            .bus
            .subscribe(DISCONNECTED_EVENTS_SUBJECT)
            .await?;

        let on_connect = {
            let broadcaster = self.clone();

            tokio::spawn(async move {
                while let Some(message) = connected.next().await {
                    broadcaster.handle_connected(&message.payload).await;
                }
            })
        };

        let on_disconnect = {
            let broadcaster = self.clone();

            tokio::spawn(async move {
                while let Some(message) = disconnected.next().await {
                    broadcaster.handle_disconnected(&message.payload).await;
                }
            })
        };

        self.tasks.lock().extend([on_connect, on_disconnect]);
        Ok(())
    }

    /// Drops the connection event subscriptions
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Writes new room metadata and broadcasts it, either room-wide or to a
    /// single user's scoped subject.
    pub async fn update_room_metadata(
        &self,
        room_id: &str,
        metadata: RoomMetadata,
        only_user: Option<&str>,
    ) -> Result<RoomInfo, BroadcastError> {
        let info = self
            .context
            .presence
            .update_room_metadata(room_id, metadata.clone())
            .await?;

        let event = SystemEvent::MetadataUpdate {
            room_id: room_id.to_string(),
            metadata,
        };

        let subject = match only_user {
            Some(user_id) => private_subject(room_id, ChannelClass::SystemPrivate, user_id),
            None => room_subject(room_id, ChannelClass::SystemPublic),
        };

        self.publish_system_event(&subject, &event).await?;
        Ok(info)
    }

    /// Publishes a system event to an arbitrary subject
    pub async fn publish_system_event(
        &self,
        subject: &str,
        event: &SystemEvent,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event).expect("system event serializes");
        self.context.bus.publish(subject, payload).await
    }

    async fn handle_connected(&self, payload: &[u8]) {
        let Some((room_id, user_id)) = parse_identity(payload) else {
            warn!("Ignoring connect event with malformed identity");
            return;
        };

        debug!("User {user_id} connected to room {room_id}");

        if let Err(e) = self
            .context
            .presence
            .update_user_status(&room_id, &user_id, UserStatus::Online)
            .await
        {
            warn!("Failed to mark {user_id} online: {e}");
            return;
        }

        self.notify_participant(&room_id, &user_id, LifecycleEvent::ParticipantJoined)
            .await;

        self.context
            .emit(SessionEvent::UserConnected { room_id, user_id });
    }

    async fn handle_disconnected(&self, payload: &[u8]) {
        let Some((room_id, user_id)) = parse_identity(payload) else {
            warn!("Ignoring disconnect event with malformed identity");
            return;
        };

        info!("User {user_id} disconnected from room {room_id}");

        if let Err(e) = self
            .context
            .presence
            .update_user_status(&room_id, &user_id, UserStatus::Disconnected)
            .await
        {
            warn!("Failed to mark {user_id} disconnected: {e}");
            return;
        }

        self.notify_participant(&room_id, &user_id, LifecycleEvent::ParticipantLeft)
            .await;

        // Downstream per-user cleanup happens on the event channel, never here
        self.context
            .emit(SessionEvent::UserDisconnected { room_id, user_id });
    }

    /// Forwards a participant movement to the room's webhook stream. Losing
    /// one is never fatal to the connection handling itself.
    async fn notify_participant(&self, room_id: &str, user_id: &str, event: LifecycleEvent) {
        let sid = match self.context.presence.room(room_id).await {
            Ok(Some(info)) => info.sid,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to look up room {room_id} for a participant webhook: {e}");
                return;
            }
        };

        let webhook = WebhookEvent::participant(event, room_id, &sid, user_id);

        if let Err(e) = self.webhooks.notify(room_id, webhook).await {
            warn!("Failed to enqueue participant webhook for room {room_id}: {e}");
        }
    }
}

/// Connection identities are encoded as `roomId:userId`
fn parse_identity(payload: &[u8]) -> Option<(String, String)> {
    let identity = std::str::from_utf8(payload).ok()?;
    let (room_id, user_id) = identity.split_once(':')?;

    if room_id.is_empty() || user_id.is_empty() {
        return None;
    }

    Some((room_id.to_string(), user_id.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use chrono::Utc;
    use conclave_core::{UserInfo, UserMetadata};
    use std::time::Duration;

    fn broadcaster(context: &SessionContext) -> PresenceBroadcaster {
        let webhooks = Arc::new(WebhookNotifier::new(context));
        PresenceBroadcaster::new(context, &webhooks)
    }

    async fn add_user(context: &SessionContext) {
        context
            .presence
            .add_user(UserInfo {
                id: "user-a".to_string(),
                sid: "sid-1".to_string(),
                name: "Ada".to_string(),
                room_id: "room-1".to_string(),
                metadata: UserMetadata::default(),
                is_admin: false,
                is_presenter: false,
                joined_at: Utc::now(),
                reconnected_at: None,
                disconnected_at: None,
            })
            .await
            .unwrap();
    }

    async fn status(context: &SessionContext) -> UserStatus {
        context
            .presence
            .user_status("room-1", "user-a")
            .await
            .unwrap()
            .unwrap()
    }

    // The handlers run on spawned tasks, so blocking on the event channel
    // needs a runtime with worker threads to keep polling them
    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_events_drive_status() {
        let (context, events) = testing::context();
        add_user(&context).await;

        let broadcaster = broadcaster(&context);
        broadcaster.start().await.unwrap();

        context
            .bus
            .publish(CONNECTED_EVENTS_SUBJECT, b"room-1:user-a".to_vec())
            .await
            .unwrap();

        let event = events
            .recv_timeout(Duration::from_secs(1))
            .expect("a connected event is emitted");
        assert!(matches!(event, SessionEvent::UserConnected { .. }));
        assert_eq!(status(&context).await, UserStatus::Online);

        context
            .bus
            .publish(DISCONNECTED_EVENTS_SUBJECT, b"room-1:user-a".to_vec())
            .await
            .unwrap();

        let event = events
            .recv_timeout(Duration::from_secs(1))
            .expect("a disconnected event is emitted");
        assert!(matches!(event, SessionEvent::UserDisconnected { .. }));
        assert_eq!(status(&context).await, UserStatus::Disconnected);

        broadcaster.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_events_feed_the_webhook_stream() {
        let config = conclave_core::FabricConfig {
            default_webhook_url: Some("http://127.0.0.1:9/hooks".to_string()),
            webhook_retry_limit: 0,
            ..Default::default()
        };

        let (context, events) = testing::context_with_config(config);
        add_user(&context).await;

        context
            .presence
            .add_room(RoomInfo {
                id: "room-1".to_string(),
                sid: "sid-1".to_string(),
                metadata: RoomMetadata::default(),
                enabled_e2ee: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let webhooks = Arc::new(WebhookNotifier::new(&context));
        webhooks.register("room-1", "sid-1").await.unwrap();

        let broadcaster = PresenceBroadcaster::new(&context, &webhooks);
        broadcaster.start().await.unwrap();

        context
            .bus
            .publish(CONNECTED_EVENTS_SUBJECT, b"room-1:user-a".to_vec())
            .await
            .unwrap();

        events
            .recv_timeout(Duration::from_secs(1))
            .expect("a connected event is emitted");

        assert!(
            webhooks.has_local_queue("room-1"),
            "a participant_joined delivery should be queued"
        );

        broadcaster.shutdown();
        webhooks.shutdown();
    }

    #[tokio::test]
    async fn test_metadata_update_is_broadcast() {
        let (context, _events) = testing::context();

        context
            .presence
            .add_room(RoomInfo {
                id: "room-1".to_string(),
                sid: "sid-1".to_string(),
                metadata: RoomMetadata::default(),
                enabled_e2ee: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut subscription = context
            .bus
            .subscribe("room-1:system-public")
            .await
            .unwrap();

        let broadcaster = broadcaster(&context);

        let mut metadata = RoomMetadata::default();
        metadata.room_title = "Retro".to_string();

        broadcaster
            .update_room_metadata("room-1", metadata.clone(), None)
            .await
            .unwrap();

        let message = subscription.next().await.unwrap();
        let event: SystemEvent = serde_json::from_slice(&message.payload).unwrap();

        assert_eq!(
            event,
            SystemEvent::MetadataUpdate {
                room_id: "room-1".to_string(),
                metadata,
            }
        );
    }
}
