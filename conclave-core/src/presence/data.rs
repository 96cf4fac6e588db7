use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default lock state applied to every user who joins a room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    pub lock_microphone: bool,
    pub lock_webcam: bool,
    pub lock_screen_sharing: bool,
    pub lock_chat: bool,
    pub lock_whiteboard: bool,
}

/// The structured metadata attached to a room's presence record.
///
/// Every node reads and writes this whole value, last write wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_title: String,
    pub welcome_message: Option<String>,

    /// Wall-clock budget for this room, if it has one
    pub duration_minutes: Option<u64>,

    pub is_recording: bool,
    pub is_active_rtmp: bool,

    pub allow_recording: bool,
    pub allow_rtmp: bool,
    pub allow_external_media: bool,
    pub allow_breakout_rooms: bool,

    /// Set when this room is itself a breakout child
    pub is_breakout_room: bool,
    pub parent_room_id: Option<String>,
    /// Set on a parent while any of its breakout rooms are running
    pub breakout_room_activated: bool,

    pub default_lock_settings: LockSettings,
}

/// One present record per active room, removed when the room ends
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub id: String,
    pub sid: String,
    pub metadata: RoomMetadata,
    pub enabled_e2ee: bool,
    pub created_at: DateTime<Utc>,
}

/// The connection status of a user within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Added,
    Online,
    Disconnected,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Added => "added",
            UserStatus::Online => "online",
            UserStatus::Disconnected => "disconnected",
            UserStatus::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "added" => Some(UserStatus::Added),
            "online" => Some(UserStatus::Online),
            "disconnected" => Some(UserStatus::Disconnected),
            "offline" => Some(UserStatus::Offline),
            _ => None,
        }
    }
}

/// Per-user overrides on top of the room's defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub raised_hand: bool,
    pub lock_settings: LockSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: String,
    pub sid: String,
    pub name: String,
    pub room_id: String,
    pub metadata: UserMetadata,
    pub is_admin: bool,
    pub is_presenter: bool,
    pub joined_at: DateTime<Utc>,
    pub reconnected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
}
