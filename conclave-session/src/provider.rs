use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use conclave_core::random_string;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider could not be reached or refused the request
    #[error("Provider request failed: {0}")]
    Request(String),
    #[error("Provider session for room {0} doesn't exist")]
    NotFound(String),
}

/// A freshly created provider-side session
#[derive(Debug, Clone)]
pub struct ProviderSession {
    pub room_id: String,
    pub sid: String,
}

/// One live room as the provider sees it
#[derive(Debug, Clone)]
pub struct ProviderRoom {
    pub room_id: String,
    pub sid: String,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Represents the external real-time media session provider.
///
/// An external collaborator consumed through narrow request/response calls,
/// never retried indefinitely. A single bounded attempt with error
/// propagation is correct.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn create_session(&self, room_id: &str) -> Result<ProviderSession, ProviderError>;

    /// Returns the live session for a room, if the provider has one
    async fn session(&self, room_id: &str) -> Result<Option<ProviderRoom>, ProviderError>;

    /// Ends a session. Ending an absent session is a no-op.
    async fn end_session(&self, room_id: &str) -> Result<(), ProviderError>;

    async fn list_sessions(&self) -> Result<Vec<ProviderRoom>, ProviderError>;

    async fn remove_participant(&self, room_id: &str, user_id: &str)
        -> Result<(), ProviderError>;
}

/// An in-memory provider, substituting for the real media backend in tests.
#[derive(Default)]
pub struct MemoryProvider {
    sessions: DashMap<String, ProviderRoom>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the participant count the provider reports for a room
    pub fn set_participant_count(&self, room_id: &str, count: usize) {
        if let Some(mut session) = self.sessions.get_mut(room_id) {
            session.participant_count = count;
        }
    }

    /// Inserts a session with an arbitrary creation time, for staleness tests
    pub fn insert_session(&self, room: ProviderRoom) {
        self.sessions.insert(room.room_id.clone(), room);
    }
}

#[async_trait]
impl MediaProvider for MemoryProvider {
    async fn create_session(&self, room_id: &str) -> Result<ProviderSession, ProviderError> {
        let sid = format!("RS_{}", random_string(16));

        self.sessions.insert(
            room_id.to_string(),
            ProviderRoom {
                room_id: room_id.to_string(),
                sid: sid.clone(),
                participant_count: 0,
                created_at: Utc::now(),
            },
        );

        Ok(ProviderSession {
            room_id: room_id.to_string(),
            sid,
        })
    }

    async fn session(&self, room_id: &str) -> Result<Option<ProviderRoom>, ProviderError> {
        Ok(self.sessions.get(room_id).map(|s| s.clone()))
    }

    async fn end_session(&self, room_id: &str) -> Result<(), ProviderError> {
        self.sessions.remove(room_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<ProviderRoom>, ProviderError> {
        Ok(self.sessions.iter().map(|s| s.clone()).collect())
    }

    async fn remove_participant(
        &self,
        room_id: &str,
        _user_id: &str,
    ) -> Result<(), ProviderError> {
        let mut session = self
            .sessions
            .get_mut(room_id)
            .ok_or_else(|| ProviderError::NotFound(room_id.to_string()))?;

        session.participant_count = session.participant_count.saturating_sub(1);
        Ok(())
    }
}
