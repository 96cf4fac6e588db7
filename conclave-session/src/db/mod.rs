use async_trait::async_trait;
use thiserror::Error;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type DbResult<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoDatabaseError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError;
    fn any(self) -> DatabaseError;
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult {
    /// Turns the Result into a conflict error if it's Ok()
    fn conflict_or_ok(self, resource: &'static str, field: &'static str, value: &str)
        -> DbResult<()>;
}

impl<T> DatabaseResult for DbResult<T> {
    fn conflict_or_ok(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> DbResult<()> {
        match self {
            Ok(_) => Err(DatabaseError::Conflict {
                resource,
                field,
                value: value.to_string(),
            }),
            Err(e) => match e {
                DatabaseError::NotFound {
                    resource: _,
                    identifier: _,
                } => Ok(()),
                e => Err(e),
            },
        }
    }
}

/// Represents the relational store holding historical room records.
///
/// This is an external collaborator, only the narrow calls the fabric needs
/// are specified here.
#[async_trait]
pub trait Database: Send + Sync {
    /// Inserts a row for a newly created room session
    async fn create_room_row(&self, new_row: NewRoomRow) -> DbResult<RoomRow>;

    /// Returns the single running row for a room id, if any
    async fn active_room_by_room_id(&self, room_id: &str) -> DbResult<RoomRow>;

    async fn room_by_sid(&self, sid: &str) -> DbResult<RoomRow>;

    async fn list_running_rooms(&self) -> DbResult<Vec<RoomRow>>;

    /// Marks a session ended, stamping ended_at. A no-op on an ended row.
    async fn mark_room_ended(&self, sid: &str) -> DbResult<()>;

    async fn update_participant_count(&self, sid: &str, count: i32) -> DbResult<()>;

    /// The per-room webhook url configured at creation, if any
    async fn webhook_url_for_room(&self, room_id: &str) -> DbResult<Option<String>>;
}
