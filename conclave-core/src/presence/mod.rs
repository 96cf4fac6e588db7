use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod data;
mod memory;

pub use data::*;
pub use memory::*;

pub type PresenceResult<T> = Result<T, PresenceError>;

/// Bucket name prefixes, one bucket per entity as laid out in the cluster KV
pub const ROOM_INFO_BUCKET_PREFIX: &str = "roomInfo-";
pub const ROOM_USERS_BUCKET_PREFIX: &str = "roomUsers-";
pub const USER_INFO_BUCKET_PREFIX: &str = "userInfo-";

#[derive(Debug, Error)]
pub enum PresenceError {
    /// An unknown or internal error happened with the backing store
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A record in the store doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
    /// A stored value could not be decoded
    #[error("Malformed value for key {key} in bucket {bucket}")]
    Malformed { bucket: String, key: String },
}

/// Represents the replicated key-value store holding current room/user state,
/// organized into per-entity buckets. Readable and writable by any node.
#[async_trait]
pub trait PresenceBackend: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, value: String) -> PresenceResult<()>;
    async fn get(&self, bucket: &str, key: &str) -> PresenceResult<Option<String>>;
    async fn delete(&self, bucket: &str, key: &str) -> PresenceResult<()>;
    async fn keys(&self, bucket: &str) -> PresenceResult<Vec<String>>;
    async fn drop_bucket(&self, bucket: &str) -> PresenceResult<()>;
    async fn bucket_names(&self) -> PresenceResult<Vec<String>>;
}

/// The typed presence api over the raw bucket backend.
///
/// Cheap to clone, every component that needs presence holds one of these.
#[derive(Clone)]
pub struct Presence {
    backend: Arc<dyn PresenceBackend>,
}

impl Presence {
    pub fn new(backend: Arc<dyn PresenceBackend>) -> Self {
        Self { backend }
    }

    /// Raw bucket access, for records layered on top of the core buckets
    pub fn backend(&self) -> &Arc<dyn PresenceBackend> {
        &self.backend
    }

    fn room_bucket(room_id: &str) -> String {
        format!("{ROOM_INFO_BUCKET_PREFIX}{room_id}")
    }

    fn room_users_bucket(room_id: &str) -> String {
        format!("{ROOM_USERS_BUCKET_PREFIX}{room_id}")
    }

    fn user_bucket(user_id: &str) -> String {
        format!("{USER_INFO_BUCKET_PREFIX}{user_id}")
    }

    pub async fn add_room(&self, info: RoomInfo) -> PresenceResult<()> {
        let bucket = Self::room_bucket(&info.id);

        self.backend.put(&bucket, "id", info.id.clone()).await?;
        self.backend.put(&bucket, "sid", info.sid.clone()).await?;
        self.backend
            .put(&bucket, "metadata", encode_metadata(&info.metadata)?)
            .await?;
        self.backend
            .put(&bucket, "enabled_e2ee", info.enabled_e2ee.to_string())
            .await?;
        self.backend
            .put(&bucket, "created_at", info.created_at.to_rfc3339())
            .await?;

        Ok(())
    }

    pub async fn room(&self, room_id: &str) -> PresenceResult<Option<RoomInfo>> {
        let bucket = Self::room_bucket(room_id);

        let Some(id) = self.backend.get(&bucket, "id").await? else {
            return Ok(None);
        };

        let sid = self.required(&bucket, "sid").await?;
        let metadata = decode_metadata(&bucket, &self.required(&bucket, "metadata").await?)?;
        let enabled_e2ee = self.required_bool(&bucket, "enabled_e2ee").await?;
        let created_at = self.required_timestamp(&bucket, "created_at").await?;

        Ok(Some(RoomInfo {
            id,
            sid,
            metadata,
            enabled_e2ee,
            created_at,
        }))
    }

    /// Writes new room metadata, returning the updated record.
    /// Last write wins, there is no versioning on this value.
    pub async fn update_room_metadata(
        &self,
        room_id: &str,
        metadata: RoomMetadata,
    ) -> PresenceResult<RoomInfo> {
        let mut info = self.room(room_id).await?.ok_or(PresenceError::NotFound {
            resource: "room",
            identifier: room_id.to_string(),
        })?;

        let bucket = Self::room_bucket(room_id);
        self.backend
            .put(&bucket, "metadata", encode_metadata(&metadata)?)
            .await?;

        info.metadata = metadata;
        Ok(info)
    }

    /// Removes the room record and its user status map entirely
    pub async fn delete_room(&self, room_id: &str) -> PresenceResult<()> {
        self.backend.drop_bucket(&Self::room_bucket(room_id)).await?;
        self.backend
            .drop_bucket(&Self::room_users_bucket(room_id))
            .await
    }

    /// Lists every room currently present in the store
    pub async fn list_rooms(&self) -> PresenceResult<Vec<RoomInfo>> {
        let mut rooms = vec![];

        for bucket in self.backend.bucket_names().await? {
            let Some(room_id) = bucket.strip_prefix(ROOM_INFO_BUCKET_PREFIX) else {
                continue;
            };

            if let Some(info) = self.room(room_id).await? {
                rooms.push(info);
            }
        }

        Ok(rooms)
    }

    pub async fn add_user(&self, info: UserInfo) -> PresenceResult<()> {
        let bucket = Self::user_bucket(&info.id);

        self.backend.put(&bucket, "id", info.id.clone()).await?;
        self.backend.put(&bucket, "sid", info.sid.clone()).await?;
        self.backend.put(&bucket, "name", info.name.clone()).await?;
        self.backend
            .put(&bucket, "room_id", info.room_id.clone())
            .await?;
        self.backend
            .put(
                &bucket,
                "metadata",
                serde_json::to_string(&info.metadata)
                    .map_err(|e| PresenceError::Internal(Box::new(e)))?,
            )
            .await?;
        self.backend
            .put(&bucket, "is_admin", info.is_admin.to_string())
            .await?;
        self.backend
            .put(&bucket, "is_presenter", info.is_presenter.to_string())
            .await?;
        self.backend
            .put(&bucket, "joined_at", info.joined_at.to_rfc3339())
            .await?;

        if let Some(at) = info.reconnected_at {
            self.backend
                .put(&bucket, "reconnected_at", at.to_rfc3339())
                .await?;
        }

        if let Some(at) = info.disconnected_at {
            self.backend
                .put(&bucket, "disconnected_at", at.to_rfc3339())
                .await?;
        }

        self.backend
            .put(
                &Self::room_users_bucket(&info.room_id),
                &info.id,
                UserStatus::Added.as_str().to_string(),
            )
            .await
    }

    pub async fn user(&self, user_id: &str) -> PresenceResult<Option<UserInfo>> {
        let bucket = Self::user_bucket(user_id);

        let Some(id) = self.backend.get(&bucket, "id").await? else {
            return Ok(None);
        };

        let raw_metadata = self.required(&bucket, "metadata").await?;
        let metadata =
            serde_json::from_str(&raw_metadata).map_err(|_| PresenceError::Malformed {
                bucket: bucket.clone(),
                key: "metadata".to_string(),
            })?;

        Ok(Some(UserInfo {
            id,
            sid: self.required(&bucket, "sid").await?,
            name: self.required(&bucket, "name").await?,
            room_id: self.required(&bucket, "room_id").await?,
            metadata,
            is_admin: self.required_bool(&bucket, "is_admin").await?,
            is_presenter: self.required_bool(&bucket, "is_presenter").await?,
            joined_at: self.required_timestamp(&bucket, "joined_at").await?,
            reconnected_at: self.optional_timestamp(&bucket, "reconnected_at").await?,
            disconnected_at: self.optional_timestamp(&bucket, "disconnected_at").await?,
        }))
    }

    /// Moves a user to a new status, stamping the matching timestamp
    pub async fn update_user_status(
        &self,
        room_id: &str,
        user_id: &str,
        status: UserStatus,
    ) -> PresenceResult<()> {
        self.backend
            .put(
                &Self::room_users_bucket(room_id),
                user_id,
                status.as_str().to_string(),
            )
            .await?;

        let bucket = Self::user_bucket(user_id);
        let now = Utc::now().to_rfc3339();

        match status {
            UserStatus::Online => {
                // A second online transition is a reconnect
                if self.backend.get(&bucket, "disconnected_at").await?.is_some() {
                    self.backend.put(&bucket, "reconnected_at", now).await?;
                }
            }
            UserStatus::Disconnected | UserStatus::Offline => {
                self.backend.put(&bucket, "disconnected_at", now).await?;
            }
            UserStatus::Added => {}
        }

        Ok(())
    }

    pub async fn user_status(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> PresenceResult<Option<UserStatus>> {
        let value = self
            .backend
            .get(&Self::room_users_bucket(room_id), user_id)
            .await?;

        Ok(value.and_then(|v| UserStatus::parse(&v)))
    }

    /// Lists every user known to a room along with their status
    pub async fn room_users(&self, room_id: &str) -> PresenceResult<Vec<(String, UserStatus)>> {
        let bucket = Self::room_users_bucket(room_id);
        let mut users = vec![];

        for key in self.backend.keys(&bucket).await? {
            if let Some(status) = self
                .backend
                .get(&bucket, &key)
                .await?
                .and_then(|v| UserStatus::parse(&v))
            {
                users.push((key, status));
            }
        }

        Ok(users)
    }

    pub async fn delete_user(&self, room_id: &str, user_id: &str) -> PresenceResult<()> {
        self.backend
            .delete(&Self::room_users_bucket(room_id), user_id)
            .await?;
        self.backend.drop_bucket(&Self::user_bucket(user_id)).await
    }

    async fn required(&self, bucket: &str, key: &str) -> PresenceResult<String> {
        self.backend
            .get(bucket, key)
            .await?
            .ok_or_else(|| PresenceError::Malformed {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn required_bool(&self, bucket: &str, key: &str) -> PresenceResult<bool> {
        self.required(bucket, key)
            .await?
            .parse()
            .map_err(|_| PresenceError::Malformed {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn required_timestamp(&self, bucket: &str, key: &str) -> PresenceResult<DateTime<Utc>> {
        parse_timestamp(bucket, key, &self.required(bucket, key).await?)
    }

    async fn optional_timestamp(
        &self,
        bucket: &str,
        key: &str,
    ) -> PresenceResult<Option<DateTime<Utc>>> {
        match self.backend.get(bucket, key).await? {
            Some(value) => parse_timestamp(bucket, key, &value).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_timestamp(bucket: &str, key: &str, value: &str) -> PresenceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| PresenceError::Malformed {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
}

fn encode_metadata(metadata: &RoomMetadata) -> PresenceResult<String> {
    serde_json::to_string(metadata).map_err(|e| PresenceError::Internal(Box::new(e)))
}

fn decode_metadata(bucket: &str, value: &str) -> PresenceResult<RoomMetadata> {
    serde_json::from_str(value).map_err(|_| PresenceError::Malformed {
        bucket: bucket.to_string(),
        key: "metadata".to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn presence() -> Presence {
        Presence::new(Arc::new(MemoryPresence::new()))
    }

    fn user_fixture() -> UserInfo {
        UserInfo {
            id: "user-a".to_string(),
            sid: "sid-1".to_string(),
            name: "Ada".to_string(),
            room_id: "room-1".to_string(),
            metadata: UserMetadata {
                raised_hand: true,
                ..Default::default()
            },
            is_admin: true,
            is_presenter: false,
            joined_at: Utc::now(),
            reconnected_at: None,
            disconnected_at: None,
        }
    }

    #[tokio::test]
    async fn test_user_round_trip() {
        let presence = presence();
        let info = user_fixture();

        presence.add_user(info.clone()).await.unwrap();
        let read = presence.user("user-a").await.unwrap().unwrap();

        assert_eq!(read.name, info.name);
        assert_eq!(read.room_id, info.room_id);
        assert_eq!(read.metadata, info.metadata);
        assert_eq!(read.is_admin, info.is_admin);
        assert_eq!(read.is_presenter, info.is_presenter);
        assert_eq!(
            presence.user_status("room-1", "user-a").await.unwrap(),
            Some(UserStatus::Added)
        );
    }

    #[tokio::test]
    async fn test_status_transitions_stamp_timestamps() {
        let presence = presence();
        presence.add_user(user_fixture()).await.unwrap();

        presence
            .update_user_status("room-1", "user-a", UserStatus::Online)
            .await
            .unwrap();
        let user = presence.user("user-a").await.unwrap().unwrap();
        assert!(
            user.reconnected_at.is_none(),
            "first online transition is not a reconnect"
        );

        presence
            .update_user_status("room-1", "user-a", UserStatus::Disconnected)
            .await
            .unwrap();
        let user = presence.user("user-a").await.unwrap().unwrap();
        assert!(user.disconnected_at.is_some());

        presence
            .update_user_status("room-1", "user-a", UserStatus::Online)
            .await
            .unwrap();
        let user = presence.user("user-a").await.unwrap().unwrap();
        assert!(user.reconnected_at.is_some());
    }

    #[tokio::test]
    async fn test_room_metadata_update_and_delete() {
        let presence = presence();

        presence
            .add_room(RoomInfo {
                id: "room-1".to_string(),
                sid: "sid-1".to_string(),
                metadata: RoomMetadata::default(),
                enabled_e2ee: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut metadata = RoomMetadata::default();
        metadata.room_title = "Daily standup".to_string();

        let updated = presence
            .update_room_metadata("room-1", metadata.clone())
            .await
            .unwrap();
        assert_eq!(updated.metadata, metadata);
        assert_eq!(updated.sid, "sid-1");

        presence.delete_room("room-1").await.unwrap();
        assert!(presence.room("room-1").await.unwrap().is_none());
        assert!(presence.list_rooms().await.unwrap().is_empty());
    }
}
