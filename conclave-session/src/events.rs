use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use conclave_core::RoomMetadata;

pub type EventSender = Sender<SessionEvent>;
pub type EventReceiver = Receiver<SessionEvent>;

/// Events emitted within one node, consumed by dependent subsystems such as
/// usage metering. Handlers run off the emitting task so bus callbacks never
/// block on them.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A client connected to the bus and was marked online
    UserConnected { room_id: String, user_id: String },
    /// A client disconnected from the bus, downstream cleanup should run now
    UserDisconnected { room_id: String, user_id: String },
    /// A room session was created on this node
    RoomCreated { room_id: String, sid: String },
    /// A room session ended, its presence record is gone
    RoomEnded { room_id: String, sid: String },
}

/// Events broadcast to connected clients over a room's system subjects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// The room's metadata changed, clients should converge on this value
    MetadataUpdate {
        room_id: String,
        metadata: RoomMetadata,
    },
    /// The user is invited into a breakout room
    BreakoutInvitation {
        parent_room_id: String,
        breakout_room_id: String,
        title: String,
    },
    /// The room is inside its final minute of budget
    RoomEnding {
        room_id: String,
        remaining_seconds: u64,
    },
}

/// The closed set of lifecycle events delivered to webhook subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    RoomStarted,
    RoomFinished,
    ParticipantJoined,
    ParticipantLeft,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::RoomStarted => "room_started",
            LifecycleEvent::RoomFinished => "room_finished",
            LifecycleEvent::ParticipantJoined => "participant_joined",
            LifecycleEvent::ParticipantLeft => "participant_left",
        }
    }
}

/// The JSON body POSTed to registered webhook urls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: LifecycleEvent,
    pub room: WebhookRoom,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRoom {
    pub sid: String,
    pub room_id: String,
}

impl WebhookEvent {
    pub fn room_lifecycle(event: LifecycleEvent, room_id: &str, sid: &str) -> Self {
        Self {
            event,
            room: WebhookRoom {
                sid: sid.to_string(),
                room_id: room_id.to_string(),
            },
            user_id: None,
        }
    }

    pub fn participant(
        event: LifecycleEvent,
        room_id: &str,
        sid: &str,
        user_id: &str,
    ) -> Self {
        Self {
            event,
            room: WebhookRoom {
                sid: sid.to_string(),
                room_id: room_id.to_string(),
            },
            user_id: Some(user_id.to_string()),
        }
    }
}
