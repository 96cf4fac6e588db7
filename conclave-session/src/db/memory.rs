use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{Database, DatabaseError, DatabaseResult, DbResult, NewRoomRow, RoomRow};

/// An in-memory room store, substituting for postgres in tests and
/// single-node setups.
#[derive(Default)]
pub struct MemoryDatabase {
    rows: Mutex<Vec<RoomRow>>,
    next_id: AtomicI64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a row in place, for setting up drifted test states
    pub fn replace_row(&self, row: RoomRow) {
        let mut rows = self.rows.lock();
        rows.retain(|r| r.sid != row.sid);
        rows.push(row);
    }

    pub fn rows(&self) -> Vec<RoomRow> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn create_room_row(&self, new_row: NewRoomRow) -> DbResult<RoomRow> {
        self.active_room_by_room_id(&new_row.room_id)
            .await
            .conflict_or_ok("room", "room_id", &new_row.room_id)?;

        let row = RoomRow {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            room_id: new_row.room_id,
            sid: new_row.sid,
            is_running: true,
            participant_count: 0,
            webhook_url: new_row.webhook_url,
            duration_minutes: new_row.duration_minutes,
            created_at: Utc::now(),
            ended_at: None,
        };

        self.rows.lock().push(row.clone());
        Ok(row)
    }

    async fn active_room_by_room_id(&self, room_id: &str) -> DbResult<RoomRow> {
        self.rows
            .lock()
            .iter()
            .find(|r| r.room_id == room_id && r.is_running)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "room_id",
            })
    }

    async fn room_by_sid(&self, sid: &str) -> DbResult<RoomRow> {
        self.rows
            .lock()
            .iter()
            .find(|r| r.sid == sid)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "sid",
            })
    }

    async fn list_running_rooms(&self) -> DbResult<Vec<RoomRow>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| r.is_running)
            .cloned()
            .collect())
    }

    async fn mark_room_ended(&self, sid: &str) -> DbResult<()> {
        let mut rows = self.rows.lock();

        let row = rows
            .iter_mut()
            .find(|r| r.sid == sid)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "sid",
            })?;

        if row.is_running {
            row.is_running = false;
            row.ended_at = Some(Utc::now());
        }

        Ok(())
    }

    async fn update_participant_count(&self, sid: &str, count: i32) -> DbResult<()> {
        let mut rows = self.rows.lock();

        let row = rows
            .iter_mut()
            .find(|r| r.sid == sid)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "sid",
            })?;

        row.participant_count = count;
        Ok(())
    }

    async fn webhook_url_for_room(&self, room_id: &str) -> DbResult<Option<String>> {
        match self.active_room_by_room_id(room_id).await {
            Ok(row) => Ok(row.webhook_url),
            Err(DatabaseError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_one_running_row_per_room_id() {
        let db = MemoryDatabase::new();

        db.create_room_row(NewRoomRow {
            room_id: "room-1".to_string(),
            sid: "sid-1".to_string(),
            webhook_url: None,
            duration_minutes: None,
        })
        .await
        .unwrap();

        let conflict = db
            .create_room_row(NewRoomRow {
                room_id: "room-1".to_string(),
                sid: "sid-2".to_string(),
                webhook_url: None,
                duration_minutes: None,
            })
            .await;

        assert!(matches!(conflict, Err(DatabaseError::Conflict { .. })));

        // Ending the first session frees the room id for a new one
        db.mark_room_ended("sid-1").await.unwrap();
        db.create_room_row(NewRoomRow {
            room_id: "room-1".to_string(),
            sid: "sid-2".to_string(),
            webhook_url: None,
            duration_minutes: None,
        })
        .await
        .unwrap();

        assert_eq!(db.list_running_rooms().await.unwrap().len(), 1);
    }
}
