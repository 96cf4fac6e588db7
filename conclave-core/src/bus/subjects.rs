use std::fmt::{Display, Formatter};

/// Identity payloads for client connect events, carrying `roomId:userId`
pub const CONNECTED_EVENTS_SUBJECT: &str = "sys.conn.connected";
/// Identity payloads for client disconnect events, carrying `roomId:userId`
pub const DISCONNECTED_EVENTS_SUBJECT: &str = "sys.conn.disconnected";
/// Cluster-wide webhook queue teardown, carrying the roomId as payload
pub const WEBHOOK_CLEANUP_SUBJECT: &str = "sys.webhook.cleanup";
/// The one shared ingress subject every client may publish worker requests to
pub const SYSTEM_WORKER_SUBJECT: &str = "sys.worker.ingress";

/// The five logical channel classes every room is provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    ChatPublic,
    ChatPrivate,
    SystemPublic,
    SystemPrivate,
    Whiteboard,
}

impl ChannelClass {
    pub const ALL: [ChannelClass; 5] = [
        ChannelClass::ChatPublic,
        ChannelClass::ChatPrivate,
        ChannelClass::SystemPublic,
        ChannelClass::SystemPrivate,
        ChannelClass::Whiteboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelClass::ChatPublic => "chat-public",
            ChannelClass::ChatPrivate => "chat-private",
            ChannelClass::SystemPublic => "system-public",
            ChannelClass::SystemPrivate => "system-private",
            ChannelClass::Whiteboard => "whiteboard",
        }
    }

    /// Private classes additionally scope their subjects by user
    pub fn is_private(&self) -> bool {
        matches!(self, ChannelClass::ChatPrivate | ChannelClass::SystemPrivate)
    }

    /// The subject this class uses for a given user in a given room
    pub fn subject(&self, room_id: &str, user_id: &str) -> String {
        if self.is_private() {
            private_subject(room_id, *self, user_id)
        } else {
            room_subject(room_id, *self)
        }
    }
}

impl Display for ChannelClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A room-wide subject, shared by every participant
pub fn room_subject(room_id: &str, class: ChannelClass) -> String {
    format!("{}:{}", room_id, class.as_str())
}

/// A subject scoped to a single user within a room
pub fn private_subject(room_id: &str, class: ChannelClass, user_id: &str) -> String {
    format!("{}:{}.{}", room_id, class.as_str(), user_id)
}

/// The subjects a user manages and acknowledges their own consumers on
pub fn consumer_subject(room_id: &str, user_id: &str) -> String {
    format!("consumer.{}.{}.>", room_id, user_id)
}

/// Matches a subject against a pattern, token-wise on `.`.
/// `*` matches exactly one token and `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
