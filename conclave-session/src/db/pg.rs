use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Error as SqlxError, PgPool};

use super::{
    Database, DatabaseError, DatabaseResult, DbResult, IntoDatabaseError, NewRoomRow, RoomRow,
};

/// A postgres implementation of the relational room store
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn new(url: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn create_room_row(&self, new_row: NewRoomRow) -> DbResult<RoomRow> {
        // A room id may only have one running row at a time
        self.active_room_by_room_id(&new_row.room_id)
            .await
            .conflict_or_ok("room", "room_id", &new_row.room_id)?;

        sqlx::query_as::<_, RoomRow>(
            "
            INSERT INTO room_sessions
                (room_id, sid, is_running, participant_count, webhook_url, duration_minutes, created_at)
            VALUES ($1, $2, true, 0, $3, $4, now())
            RETURNING *",
        )
        .bind(&new_row.room_id)
        .bind(&new_row.sid)
        .bind(&new_row.webhook_url)
        .bind(new_row.duration_minutes)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn active_room_by_room_id(&self, room_id: &str) -> DbResult<RoomRow> {
        sqlx::query_as::<_, RoomRow>(
            "SELECT * FROM room_sessions WHERE room_id = $1 AND is_running = true",
        )
        .bind(room_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("room", "room_id"))
    }

    async fn room_by_sid(&self, sid: &str) -> DbResult<RoomRow> {
        sqlx::query_as::<_, RoomRow>("SELECT * FROM room_sessions WHERE sid = $1")
            .bind(sid)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "sid"))
    }

    async fn list_running_rooms(&self) -> DbResult<Vec<RoomRow>> {
        sqlx::query_as::<_, RoomRow>("SELECT * FROM room_sessions WHERE is_running = true")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())
    }

    async fn mark_room_ended(&self, sid: &str) -> DbResult<()> {
        // Ensure the row exists
        let _ = self.room_by_sid(sid).await?;

        sqlx::query(
            "UPDATE room_sessions SET is_running = false, ended_at = now()
             WHERE sid = $1 AND is_running = true",
        )
        .bind(sid)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())
        .map(|_| ())
    }

    async fn update_participant_count(&self, sid: &str, count: i32) -> DbResult<()> {
        let _ = self.room_by_sid(sid).await?;

        sqlx::query("UPDATE room_sessions SET participant_count = $1 WHERE sid = $2")
            .bind(count)
            .bind(sid)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn webhook_url_for_room(&self, room_id: &str) -> DbResult<Option<String>> {
        match self.active_room_by_room_id(room_id).await {
            Ok(row) => Ok(row.webhook_url),
            Err(DatabaseError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl IntoDatabaseError for SqlxError {
    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier,
            },
            e => Self::any(e),
        }
    }
}
