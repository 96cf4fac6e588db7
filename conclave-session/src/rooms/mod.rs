mod breakout;

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

pub use breakout::*;

use conclave_core::{
    room_subject, ChannelClass, CoordinationError, CreationGuard, PresenceError, RoomInfo,
    RoomMetadata,
};

use crate::{
    BroadcastError, DatabaseError, LifecycleEvent, NewRoomRow, ProviderError, RoomRow,
    SessionContext, SessionEvent, SystemEvent, WebhookError, WebhookEvent, WebhookNotifier,
};

#[derive(Debug, Clone)]
pub struct CreateRoomRequest {
    pub room_id: String,
    pub metadata: RoomMetadata,
    pub enabled_e2ee: bool,
    /// Per-room webhook url, on top of the cluster default
    pub webhook_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum RoomError {
    /// The room's record pointed at a provider session that no longer exists
    #[error("Room {0} had a stale record which was repaired, retry the create")]
    StaleRecordRepaired(String),
    #[error("Room {0} doesn't exist")]
    RoomNotFound(String),
    #[error("Breakout room {0} doesn't exist")]
    BreakoutNotFound(String),
    #[error("Breakout rooms cannot be nested")]
    NestedBreakout,
    #[error("At least one breakout room must be requested")]
    EmptyBreakoutBatch,
    #[error(
        "Requested duration of {requested} minutes exceeds the parent room's remaining budget of {remaining} minutes"
    )]
    DurationExceedsBudget { requested: u64, remaining: u64 },
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
}

/// Orchestrates room session creation and teardown across the provider, the
/// relational store, presence, and the webhook notifier.
#[derive(Clone)]
pub struct RoomManager {
    context: SessionContext,
    guard: CreationGuard,
    webhooks: Arc<WebhookNotifier>,
}

impl RoomManager {
    pub fn new(context: &SessionContext, webhooks: &Arc<WebhookNotifier>) -> Self {
        let guard = CreationGuard::new(
            context.coordination.clone(),
            context.config.creation_guard_ttl(),
            context.config.guard_poll_interval(),
        );

        Self {
            context: context.clone(),
            guard,
            webhooks: webhooks.clone(),
        }
    }

    /// Creates a room session, converging racing create calls and provider
    /// events on a single record. A settled existing session is returned
    /// as-is rather than recreated.
    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomInfo, RoomError> {
        let room_id = request.room_id.clone();

        // Another node may be mid-creation for this id right now
        self.guard.wait_until_settled(&room_id).await?;
        self.guard.begin(&room_id).await?;

        let result = self.create_room_inner(request).await;

        if let Err(e) = self.guard.end(&room_id).await {
            warn!("Failed to clear creation guard for room {room_id}: {e}");
        }

        result
    }

    async fn create_room_inner(&self, request: CreateRoomRequest) -> Result<RoomInfo, RoomError> {
        match self
            .context
            .database
            .active_room_by_room_id(&request.room_id)
            .await
        {
            Ok(row) => return self.resume_existing(&request, row).await,
            Err(DatabaseError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let session = self
            .context
            .provider
            .create_session(&request.room_id)
            .await?;

        let row = match self
            .context
            .database
            .create_room_row(NewRoomRow {
                room_id: request.room_id.clone(),
                sid: session.sid.clone(),
                webhook_url: request.webhook_url.clone(),
                duration_minutes: request.metadata.duration_minutes.map(|d| d as i64),
            })
            .await
        {
            Ok(row) => row,
            Err(DatabaseError::Conflict { .. }) => {
                // Lost a cross-node race after the guard check, converge on
                // the winner's record
                let row = self
                    .context
                    .database
                    .active_room_by_room_id(&request.room_id)
                    .await?;

                return self.resume_existing(&request, row).await;
            }
            Err(e) => return Err(e.into()),
        };

        let info = RoomInfo {
            id: request.room_id.clone(),
            sid: row.sid.clone(),
            metadata: request.metadata,
            enabled_e2ee: request.enabled_e2ee,
            created_at: row.created_at,
        };

        self.context.presence.add_room(info.clone()).await?;
        self.webhooks.register(&info.id, &info.sid).await?;
        self.webhooks
            .notify(
                &info.id,
                WebhookEvent::room_lifecycle(LifecycleEvent::RoomStarted, &info.id, &info.sid),
            )
            .await?;

        info!("Created room {} with session {}", info.id, info.sid);
        self.context.emit(SessionEvent::RoomCreated {
            room_id: info.id.clone(),
            sid: info.sid.clone(),
        });

        Ok(info)
    }

    /// A running row already exists: hand back the live session, or repair
    /// the row when the provider no longer knows the room.
    async fn resume_existing(
        &self,
        request: &CreateRoomRequest,
        row: RoomRow,
    ) -> Result<RoomInfo, RoomError> {
        if self.context.provider.session(&row.room_id).await?.is_some() {
            if let Some(info) = self.context.presence.room(&row.room_id).await? {
                return Ok(info);
            }

            // The session is live but presence was lost, rebuild it
            let info = RoomInfo {
                id: row.room_id.clone(),
                sid: row.sid.clone(),
                metadata: request.metadata.clone(),
                enabled_e2ee: request.enabled_e2ee,
                created_at: row.created_at,
            };

            self.context.presence.add_room(info.clone()).await?;
            return Ok(info);
        }

        self.context.database.mark_room_ended(&row.sid).await?;
        info!("Repaired stale record for room {}", row.room_id);

        Err(RoomError::StaleRecordRepaired(row.room_id))
    }

    /// Ends a room session everywhere: provider, relational store, presence,
    /// and the webhook stream.
    pub async fn end_room(&self, room_id: &str) -> Result<(), RoomError> {
        let row = self.context.database.active_room_by_room_id(room_id).await?;

        self.context.provider.end_session(room_id).await?;
        self.finalize(&row).await
    }

    /// Completes teardown for a row whose provider session is already gone
    pub(crate) async fn finalize(&self, row: &RoomRow) -> Result<(), RoomError> {
        self.context.database.mark_room_ended(&row.sid).await?;

        self.drop_room_users(&row.room_id).await;
        self.context.presence.delete_room(&row.room_id).await?;
        self.cleanup_breakout_record(&row.room_id).await?;

        self.webhooks
            .notify(
                &row.room_id,
                WebhookEvent::room_lifecycle(LifecycleEvent::RoomFinished, &row.room_id, &row.sid),
            )
            .await?;
        self.webhooks.schedule_cleanup(&row.room_id);

        info!("Ended room {} with session {}", row.room_id, row.sid);
        self.context.emit(SessionEvent::RoomEnded {
            room_id: row.room_id.clone(),
            sid: row.sid.clone(),
        });

        Ok(())
    }

    /// Tears down the per-user durable consumers and user records of an
    /// ending room. Losing one is logged, never fatal to the teardown.
    async fn drop_room_users(&self, room_id: &str) {
        let users = match self.context.presence.room_users(room_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!("Failed to list users of room {room_id} for teardown: {e}");
                return;
            }
        };

        for (user_id, _) in users {
            for class in ChannelClass::ALL {
                let name = format!("{}:{}:{}", class.as_str(), room_id, user_id);

                if let Err(e) = self.context.bus.delete_consumer(&name).await {
                    warn!("Failed to delete consumer {name}: {e}");
                }
            }

            if let Err(e) = self.context.presence.delete_user(room_id, &user_id).await {
                warn!("Failed to drop presence record for {user_id}: {e}");
            }
        }
    }

    /// A breakout child ending through any path also drops its record and,
    /// when it was the last one under its parent, clears the parent's flag
    /// and rebroadcasts the metadata.
    async fn cleanup_breakout_record(&self, room_id: &str) -> Result<(), RoomError> {
        let Some((parent_id, _)) = room_id.split_once(':') else {
            return Ok(());
        };

        let bucket = breakout_bucket(parent_id);
        let backend = self.context.presence.backend();

        if backend.get(&bucket, room_id).await?.is_none() {
            return Ok(());
        }

        backend.delete(&bucket, room_id).await?;

        if !backend.keys(&bucket).await?.is_empty() {
            return Ok(());
        }

        backend.drop_bucket(&bucket).await?;

        let Some(parent) = self.context.presence.room(parent_id).await? else {
            return Ok(());
        };

        if parent.metadata.breakout_room_activated {
            let mut metadata = parent.metadata;
            metadata.breakout_room_activated = false;

            self.context
                .presence
                .update_room_metadata(parent_id, metadata.clone())
                .await?;

            let event = SystemEvent::MetadataUpdate {
                room_id: parent_id.to_string(),
                metadata,
            };
            let payload = serde_json::to_vec(&event).expect("system event serializes");
            let subject = room_subject(parent_id, ChannelClass::SystemPublic);

            if let Err(e) = self.context.bus.publish(&subject, payload).await {
                warn!("Failed to rebroadcast metadata for room {parent_id}: {e}");
            }

            info!("Last breakout room under {parent_id} ended");
        }

        Ok(())
    }

    pub async fn room(&self, room_id: &str) -> Result<Option<RoomInfo>, RoomError> {
        Ok(self.context.presence.room(room_id).await?)
    }

    /// Kicks a user out of a room at the provider and marks them offline
    pub async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), RoomError> {
        self.context
            .provider
            .remove_participant(room_id, user_id)
            .await?;

        self.context
            .presence
            .update_user_status(room_id, user_id, conclave_core::UserStatus::Offline)
            .await?;

        info!("Removed {user_id} from room {room_id}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{testing, MemoryDatabase, MemoryProvider};
    use chrono::Utc;
    use conclave_core::FabricConfig;
    use std::sync::Arc;

    fn manager(context: &SessionContext) -> RoomManager {
        let webhooks = Arc::new(WebhookNotifier::new(context));
        RoomManager::new(context, &webhooks)
    }

    fn request(room_id: &str) -> CreateRoomRequest {
        CreateRoomRequest {
            room_id: room_id.to_string(),
            metadata: RoomMetadata::default(),
            enabled_e2ee: false,
            webhook_url: None,
        }
    }

    fn fast_guard_config() -> FabricConfig {
        FabricConfig {
            guard_poll_interval_in_millis: 5,
            creation_guard_ttl_in_seconds: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_room_end_to_end() {
        let (context, events) = testing::context();
        let manager = manager(&context);

        let info = manager.create_room(request("room-1")).await.unwrap();
        assert_eq!(info.id, "room-1");

        assert!(context.presence.room("room-1").await.unwrap().is_some());
        assert!(context.provider.session("room-1").await.unwrap().is_some());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::RoomCreated { .. })
        ));

        manager.end_room("room-1").await.unwrap();
        assert!(context.presence.room("room-1").await.unwrap().is_none());
        assert!(context.provider.session("room-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_racing_creates_converge_on_one_record() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut context, _events) = testing::context_with_config(fast_guard_config());
        context.database = db.clone();

        // Two nodes racing the same create
        let first = manager(&context);
        let second = manager(&context);

        let (a, b) = tokio::join!(
            first.create_room(request("room-1")),
            second.create_room(request("room-1")),
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.sid, b.sid, "both callers should see the same session");

        assert_eq!(db.rows().len(), 1, "exactly one row exists afterward");
    }

    #[tokio::test]
    async fn test_stale_record_is_repaired() {
        let db = Arc::new(MemoryDatabase::new());
        let provider = Arc::new(MemoryProvider::new());
        let (mut context, _events) = testing::context();
        context.database = db.clone();
        context.provider = provider;

        // A running row whose provider session never made it
        db.replace_row(RoomRow {
            id: 1,
            room_id: "room-1".to_string(),
            sid: "sid-stale".to_string(),
            is_running: true,
            participant_count: 0,
            webhook_url: None,
            duration_minutes: None,
            created_at: Utc::now(),
            ended_at: None,
        });

        let manager = manager(&context);
        let result = manager.create_room(request("room-1")).await;
        assert!(matches!(result, Err(RoomError::StaleRecordRepaired(_))));

        let repaired = &db.rows()[0];
        assert!(!repaired.is_running, "the stale row should be closed");

        // The retry now succeeds with a fresh session
        let info = manager.create_room(request("room-1")).await.unwrap();
        assert_ne!(info.sid, "sid-stale");
    }

    #[tokio::test]
    async fn test_ending_a_room_drops_its_consumers_and_users() {
        use conclave_core::{Bus, ConsumerSpec, MemoryBus, UserInfo, UserMetadata};

        let bus = Arc::new(MemoryBus::new());
        let (mut context, _events) = testing::context();
        context.bus = bus.clone();

        let manager = manager(&context);
        manager.create_room(request("room-1")).await.unwrap();

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

        bus.ensure_consumer(ConsumerSpec {
            name: "chat-public:room-1:user-a".to_string(),
            filter_subjects: vec!["room-1:chat-public".to_string()],
        })
        .await
        .unwrap();

        manager.end_room("room-1").await.unwrap();

        assert!(
            bus.consumer_names().is_empty(),
            "the user's consumers should be gone with the room"
        );
        assert!(context.presence.user("user-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_participant_marks_user_offline() {
        use conclave_core::{UserInfo, UserMetadata, UserStatus};

        let (context, _events) = testing::context();
        let manager = manager(&context);

        manager.create_room(request("room-1")).await.unwrap();
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

        manager.remove_participant("room-1", "user-a").await.unwrap();

        let status = context
            .presence
            .user_status("room-1", "user-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, UserStatus::Offline);
    }

    #[tokio::test]
    async fn test_create_returns_settled_existing_session() {
        let (context, _events) = testing::context();
        let manager = manager(&context);

        let created = manager.create_room(request("room-1")).await.unwrap();
        let resumed = manager.create_room(request("room-1")).await.unwrap();

        assert_eq!(created, resumed);
    }
}
