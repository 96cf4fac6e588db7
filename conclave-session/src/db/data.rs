use chrono::{DateTime, Utc};

pub type PrimaryKey = i64;

/// A historical room session record. One running row per room id at most.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoomRow {
    pub id: PrimaryKey,
    /// The cluster-wide room id
    pub room_id: String,
    /// The provider session id, globally unique and immutable once assigned
    pub sid: String,
    pub is_running: bool,
    pub participant_count: i32,
    pub webhook_url: Option<String>,
    pub duration_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRoomRow {
    pub room_id: String,
    pub sid: String,
    pub webhook_url: Option<String>,
    pub duration_minutes: Option<i64>,
}
