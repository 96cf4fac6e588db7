use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use conclave_core::{private_subject, ChannelClass, PresenceError, RoomInfo};

use crate::{PresenceBroadcaster, SessionContext, SystemEvent};

use super::{CreateRoomRequest, RoomError, RoomManager};

/// A child meeting spawned from a parent room, sharing a time budget ceiling
/// with it. Exactly one nesting level is allowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakoutRoom {
    /// `{parentRoomId}:{childId}`
    pub id: String,
    pub parent_room_id: String,
    pub title: String,
    pub duration_minutes: u64,
    pub started: bool,
    pub created_at: DateTime<Utc>,
    pub users: Vec<BreakoutUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakoutUser {
    pub id: String,
    pub joined: bool,
}

#[derive(Debug, Clone)]
pub struct NewBreakoutRoom {
    pub child_id: String,
    pub title: String,
    /// Users invited into this child
    pub users: Vec<String>,
}

/// Manages the breakout-room hierarchy on top of [RoomManager], enforcing
/// the parent's remaining time budget at creation and at every extension.
#[derive(Clone)]
pub struct BreakoutManager {
    context: SessionContext,
    rooms: RoomManager,
    broadcaster: PresenceBroadcaster,
}

impl BreakoutManager {
    pub fn new(
        context: &SessionContext,
        rooms: &RoomManager,
        broadcaster: &PresenceBroadcaster,
    ) -> Self {
        Self {
            context: context.clone(),
            rooms: rooms.clone(),
            broadcaster: broadcaster.clone(),
        }
    }

    /// Creates a batch of breakout rooms under a parent, all sharing one
    /// duration, and invites the listed users into them.
    pub async fn create_breakout_rooms(
        &self,
        parent_room_id: &str,
        rooms: Vec<NewBreakoutRoom>,
        duration_minutes: u64,
    ) -> Result<Vec<BreakoutRoom>, RoomError> {
        if rooms.is_empty() {
            return Err(RoomError::EmptyBreakoutBatch);
        }

        let parent = self.parent(parent_room_id).await?;

        if parent.metadata.is_breakout_room {
            return Err(RoomError::NestedBreakout);
        }

        // Re-validated against the budget at the moment of this write, the
        // store offers no multi-key transactions to lean on
        if let Some(remaining) = remaining_budget_minutes(&parent) {
            if duration_minutes > remaining {
                return Err(RoomError::DurationExceedsBudget {
                    requested: duration_minutes,
                    remaining,
                });
            }
        }

        let mut created = vec![];

        for new_room in rooms {
            let breakout = self
                .create_one(&parent, new_room, duration_minutes)
                .await?;
            created.push(breakout);
        }

        // Flag the parent and let everyone in it know
        let mut metadata = parent.metadata.clone();
        metadata.breakout_room_activated = true;
        self.broadcaster
            .update_room_metadata(parent_room_id, metadata, None)
            .await?;

        Ok(created)
    }

    async fn create_one(
        &self,
        parent: &RoomInfo,
        new_room: NewBreakoutRoom,
        duration_minutes: u64,
    ) -> Result<BreakoutRoom, RoomError> {
        let id = format!("{}:{}", parent.id, new_room.child_id);

        // Children inherit the parent's settings, minus everything a
        // breakout room is not allowed to do
        let mut metadata = parent.metadata.clone();
        metadata.room_title = new_room.title.clone();
        metadata.is_breakout_room = true;
        metadata.parent_room_id = Some(parent.id.clone());
        metadata.breakout_room_activated = false;
        metadata.allow_breakout_rooms = false;
        metadata.allow_recording = false;
        metadata.allow_rtmp = false;
        metadata.allow_external_media = false;
        metadata.is_recording = false;
        metadata.is_active_rtmp = false;
        metadata.duration_minutes = Some(duration_minutes);

        let info = self
            .rooms
            .create_room(CreateRoomRequest {
                room_id: id.clone(),
                metadata,
                enabled_e2ee: parent.enabled_e2ee,
                webhook_url: None,
            })
            .await?;

        let breakout = BreakoutRoom {
            id: id.clone(),
            parent_room_id: parent.id.clone(),
            title: new_room.title.clone(),
            duration_minutes,
            started: true,
            created_at: info.created_at,
            users: new_room
                .users
                .iter()
                .map(|id| BreakoutUser {
                    id: id.clone(),
                    joined: false,
                })
                .collect(),
        };

        self.save(&breakout).await?;

        for user in &new_room.users {
            let event = SystemEvent::BreakoutInvitation {
                parent_room_id: parent.id.clone(),
                breakout_room_id: id.clone(),
                title: new_room.title.clone(),
            };

            let subject = private_subject(&parent.id, ChannelClass::SystemPrivate, user);
            self.broadcaster
                .publish_system_event(&subject, &event)
                .await
                .map_err(crate::BroadcastError::from)?;
        }

        info!(
            "Created breakout room {} under {} for {} minutes",
            id, parent.id, duration_minutes
        );

        Ok(breakout)
    }

    /// Extends a breakout room, re-reading the parent's budget at call time.
    pub async fn increase_duration(
        &self,
        parent_room_id: &str,
        breakout_id: &str,
        added_minutes: u64,
    ) -> Result<BreakoutRoom, RoomError> {
        let parent = self.parent(parent_room_id).await?;
        let mut breakout = self
            .breakout_room(parent_room_id, breakout_id)
            .await?
            .ok_or_else(|| RoomError::BreakoutNotFound(breakout_id.to_string()))?;

        let new_total = breakout.duration_minutes + added_minutes;

        if let Some(parent_duration) = parent.metadata.duration_minutes {
            let parent_ends_at = parent.created_at + Duration::minutes(parent_duration as i64);
            let budget = (parent_ends_at - breakout.created_at).num_minutes().max(0) as u64;

            if new_total > budget {
                return Err(RoomError::DurationExceedsBudget {
                    requested: new_total,
                    remaining: budget.saturating_sub(breakout.duration_minutes),
                });
            }
        }

        breakout.duration_minutes = new_total;
        self.save(&breakout).await?;

        // The child room enforces its own budget through its metadata
        if let Some(child) = self.context.presence.room(&breakout.id).await? {
            let mut metadata = child.metadata;
            metadata.duration_minutes = Some(new_total);
            self.broadcaster
                .update_room_metadata(&breakout.id, metadata, None)
                .await?;
        }

        Ok(breakout)
    }

    /// Ends one breakout room. When it was the last one under its parent,
    /// the parent's breakout flag is cleared and rebroadcast.
    pub async fn end_breakout_room(
        &self,
        parent_room_id: &str,
        breakout_id: &str,
    ) -> Result<(), RoomError> {
        let breakout = self
            .breakout_room(parent_room_id, breakout_id)
            .await?
            .ok_or_else(|| RoomError::BreakoutNotFound(breakout_id.to_string()))?;

        match self.rooms.end_room(&breakout.id).await {
            Ok(()) => {}
            // The child session may already be gone, the record still goes
            Err(RoomError::Database(crate::DatabaseError::NotFound { .. })) => {}
            Err(e) => return Err(e),
        }

        let bucket = breakout_bucket(parent_room_id);
        self.context
            .presence
            .backend()
            .delete(&bucket, &breakout.id)
            .await?;

        let remaining = self.context.presence.backend().keys(&bucket).await?;

        if remaining.is_empty() {
            self.context.presence.backend().drop_bucket(&bucket).await?;

            if let Some(parent) = self.context.presence.room(parent_room_id).await? {
                let mut metadata = parent.metadata;
                metadata.breakout_room_activated = false;
                self.broadcaster
                    .update_room_metadata(parent_room_id, metadata, None)
                    .await?;
            }

            info!("Last breakout room under {parent_room_id} ended");
        }

        Ok(())
    }

    /// Ends every breakout room under a parent
    pub async fn end_breakout_rooms(&self, parent_room_id: &str) -> Result<(), RoomError> {
        for breakout in self.fetch_breakout_rooms(parent_room_id).await? {
            let child_id = breakout
                .id
                .split_once(':')
                .map(|(_, child)| child.to_string())
                .unwrap_or(breakout.id);

            self.end_breakout_room(parent_room_id, &child_id).await?;
        }

        Ok(())
    }

    /// Lists the breakout rooms under a parent. Empty after the last one
    /// ends, never an error.
    pub async fn fetch_breakout_rooms(
        &self,
        parent_room_id: &str,
    ) -> Result<Vec<BreakoutRoom>, RoomError> {
        let bucket = breakout_bucket(parent_room_id);
        let mut rooms = vec![];

        for key in self.context.presence.backend().keys(&bucket).await? {
            if let Some(raw) = self.context.presence.backend().get(&bucket, &key).await? {
                let breakout = decode(&bucket, &key, &raw)?;
                rooms.push(breakout);
            }
        }

        Ok(rooms)
    }

    /// Marks an invited user as having joined their breakout room
    pub async fn mark_user_joined(
        &self,
        parent_room_id: &str,
        breakout_id: &str,
        user_id: &str,
    ) -> Result<(), RoomError> {
        let mut breakout = self
            .breakout_room(parent_room_id, breakout_id)
            .await?
            .ok_or_else(|| RoomError::BreakoutNotFound(breakout_id.to_string()))?;

        for user in breakout.users.iter_mut() {
            if user.id == user_id {
                user.joined = true;
            }
        }

        self.save(&breakout).await
    }

    pub async fn breakout_room(
        &self,
        parent_room_id: &str,
        breakout_id: &str,
    ) -> Result<Option<BreakoutRoom>, RoomError> {
        let bucket = breakout_bucket(parent_room_id);
        let id = format!("{parent_room_id}:{breakout_id}");

        match self.context.presence.backend().get(&bucket, &id).await? {
            Some(raw) => Ok(Some(decode(&bucket, &id, &raw)?)),
            None => Ok(None),
        }
    }

    async fn parent(&self, parent_room_id: &str) -> Result<RoomInfo, RoomError> {
        self.context
            .presence
            .room(parent_room_id)
            .await?
            .ok_or_else(|| RoomError::RoomNotFound(parent_room_id.to_string()))
    }

    async fn save(&self, breakout: &BreakoutRoom) -> Result<(), RoomError> {
        let raw = serde_json::to_string(breakout).expect("breakout room serializes");

        self.context
            .presence
            .backend()
            .put(&breakout_bucket(&breakout.parent_room_id), &breakout.id, raw)
            .await
            .map_err(RoomError::from)
    }
}

/// The presence bucket holding a parent's breakout records
pub(crate) fn breakout_bucket(parent_room_id: &str) -> String {
    format!("breakoutRooms-{parent_room_id}")
}

/// How much of the parent's budget is left right now, in whole minutes
fn remaining_budget_minutes(parent: &RoomInfo) -> Option<u64> {
    parent.metadata.duration_minutes.map(|total| {
        let elapsed = (Utc::now() - parent.created_at).num_minutes().max(0) as u64;
        total.saturating_sub(elapsed)
    })
}

fn decode(bucket: &str, key: &str, raw: &str) -> Result<BreakoutRoom, RoomError> {
    serde_json::from_str(raw).map_err(|_| {
        RoomError::Presence(PresenceError::Malformed {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{testing, RoomManager, SessionContext, WebhookNotifier};
    use chrono::Utc;
    use conclave_core::RoomMetadata;
    use std::sync::Arc;

    async fn setup(parent_duration: Option<u64>) -> (BreakoutManager, SessionContext) {
        let (context, _events) = testing::context();

        let webhooks = Arc::new(WebhookNotifier::new(&context));
        let rooms = RoomManager::new(&context, &webhooks);
        let broadcaster = PresenceBroadcaster::new(&context, &webhooks);
        let manager = BreakoutManager::new(&context, &rooms, &broadcaster);

        let mut metadata = RoomMetadata::default();
        metadata.room_title = "Parent".to_string();
        metadata.duration_minutes = parent_duration;
        metadata.allow_breakout_rooms = true;

        rooms
            .create_room(crate::CreateRoomRequest {
                room_id: "parent".to_string(),
                metadata,
                enabled_e2ee: false,
                webhook_url: None,
            })
            .await
            .unwrap();

        (manager, context)
    }

    fn one_room(child_id: &str) -> Vec<NewBreakoutRoom> {
        vec![NewBreakoutRoom {
            child_id: child_id.to_string(),
            title: format!("Breakout {child_id}"),
            users: vec!["user-a".to_string()],
        }]
    }

    #[tokio::test]
    async fn test_duration_within_budget_is_accepted() {
        let (manager, context) = setup(Some(60)).await;

        let created = manager
            .create_breakout_rooms("parent", one_room("1"), 30)
            .await
            .unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].id, "parent:1");
        assert!(created[0].started);

        let parent = context.presence.room("parent").await.unwrap().unwrap();
        assert!(parent.metadata.breakout_room_activated);

        let child = context.presence.room("parent:1").await.unwrap().unwrap();
        assert!(child.metadata.is_breakout_room);
        assert!(!child.metadata.allow_recording);
        assert!(!child.metadata.allow_breakout_rooms);
        assert_eq!(child.metadata.parent_room_id.as_deref(), Some("parent"));
    }

    #[tokio::test]
    async fn test_duration_over_budget_is_rejected() {
        let (manager, _context) = setup(Some(60)).await;

        let result = manager
            .create_breakout_rooms("parent", one_room("1"), 120)
            .await;

        assert!(matches!(
            result,
            Err(RoomError::DurationExceedsBudget {
                requested: 120,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_unbudgeted_parent_accepts_any_duration() {
        let (manager, _context) = setup(None).await;

        manager
            .create_breakout_rooms("parent", one_room("1"), 600)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_increase_revalidates_parent_budget() {
        let (manager, _context) = setup(Some(60)).await;

        manager
            .create_breakout_rooms("parent", one_room("1"), 15)
            .await
            .unwrap();

        let extended = manager.increase_duration("parent", "1", 10).await.unwrap();
        assert_eq!(extended.duration_minutes, 25);

        let result = manager.increase_duration("parent", "1", 100).await;
        assert!(
            matches!(result, Err(RoomError::DurationExceedsBudget { .. })),
            "an extension past the parent budget must be rejected"
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let (manager, context) = setup(Some(60)).await;

        let result = manager.create_breakout_rooms("parent", vec![], 30).await;
        assert!(matches!(result, Err(RoomError::EmptyBreakoutBatch)));

        let parent = context.presence.room("parent").await.unwrap().unwrap();
        assert!(
            !parent.metadata.breakout_room_activated,
            "a rejected batch must not flag the parent"
        );
    }

    #[tokio::test]
    async fn test_child_ended_outside_the_breakout_api_cleans_up() {
        let (context, _events) = testing::context();

        let webhooks = Arc::new(WebhookNotifier::new(&context));
        let rooms = RoomManager::new(&context, &webhooks);
        let broadcaster = PresenceBroadcaster::new(&context, &webhooks);
        let manager = BreakoutManager::new(&context, &rooms, &broadcaster);

        let mut metadata = RoomMetadata::default();
        metadata.room_title = "Parent".to_string();
        metadata.duration_minutes = Some(60);

        rooms
            .create_room(crate::CreateRoomRequest {
                room_id: "parent".to_string(),
                metadata,
                enabled_e2ee: false,
                webhook_url: None,
            })
            .await
            .unwrap();

        manager
            .create_breakout_rooms("parent", one_room("1"), 30)
            .await
            .unwrap();

        // The child ends through the plain room api, as the duration and
        // reconciliation paths do
        rooms.end_room("parent:1").await.unwrap();

        let remaining = manager.fetch_breakout_rooms("parent").await.unwrap();
        assert!(remaining.is_empty(), "the record must not outlive the room");

        let parent = context.presence.room("parent").await.unwrap().unwrap();
        assert!(!parent.metadata.breakout_room_activated);
    }

    #[tokio::test]
    async fn test_nested_breakout_rooms_are_rejected() {
        let (manager, _context) = setup(Some(60)).await;

        manager
            .create_breakout_rooms("parent", one_room("1"), 30)
            .await
            .unwrap();

        let result = manager
            .create_breakout_rooms("parent:1", one_room("deeper"), 10)
            .await;

        assert!(matches!(result, Err(RoomError::NestedBreakout)));
    }

    #[tokio::test]
    async fn test_ending_last_breakout_clears_parent_flag() {
        let (manager, context) = setup(Some(60)).await;

        let mut rooms = one_room("1");
        rooms.extend(one_room("2"));
        manager
            .create_breakout_rooms("parent", rooms, 30)
            .await
            .unwrap();

        manager.end_breakout_room("parent", "1").await.unwrap();

        let parent = context.presence.room("parent").await.unwrap().unwrap();
        assert!(
            parent.metadata.breakout_room_activated,
            "one breakout room is still running"
        );

        manager.end_breakout_room("parent", "2").await.unwrap();

        let parent = context.presence.room("parent").await.unwrap().unwrap();
        assert!(!parent.metadata.breakout_room_activated);

        let remaining = manager.fetch_breakout_rooms("parent").await.unwrap();
        assert!(remaining.is_empty(), "the record is removed, not flagged");
    }

    #[tokio::test]
    async fn test_invited_users_are_notified_and_tracked() {
        let (manager, context) = setup(Some(60)).await;

        let mut subscription = context
            .bus
            .subscribe("parent:system-private.user-a")
            .await
            .unwrap();

        manager
            .create_breakout_rooms("parent", one_room("1"), 30)
            .await
            .unwrap();

        let message = subscription.next().await.unwrap();
        let event: SystemEvent = serde_json::from_slice(&message.payload).unwrap();
        assert!(matches!(event, SystemEvent::BreakoutInvitation { .. }));

        manager
            .mark_user_joined("parent", "1", "user-a")
            .await
            .unwrap();

        let breakout = manager
            .breakout_room("parent", "1")
            .await
            .unwrap()
            .unwrap();
        assert!(breakout.users[0].joined);
    }
}
