//! Degraded-mode store used when no backend is configured. Every
//! operation fails deterministically with the same configuration error
//! instead of hanging or silently doing nothing, so the client's error
//! handling is exercised uniformly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::errors::StoreError;
use crate::common::models::{ActiveUser, ChatRoom, Message, OutgoingMessage};
use crate::store::{ChatStore, Subscription};

#[derive(Debug, Clone, Default)]
pub struct UnconfiguredStore;

impl UnconfiguredStore {
    pub fn new() -> Self {
        Self
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable(
            "no chat store configured, set PINCHAT_DATABASE_URL".to_string(),
        )
    }
}

#[async_trait]
impl ChatStore for UnconfiguredStore {
    async fn generate_unique_pin(&self) -> Result<String, StoreError> {
        Err(Self::unavailable())
    }

    async fn insert_room(
        &self,
        _pin: &str,
        _created_at: DateTime<Utc>,
        _expires_at: DateTime<Utc>,
    ) -> Result<ChatRoom, StoreError> {
        Err(Self::unavailable())
    }

    async fn find_active_room(
        &self,
        _pin: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<ChatRoom>, StoreError> {
        Err(Self::unavailable())
    }

    async fn insert_message(
        &self,
        _room_id: &str,
        _sender: &str,
        _outgoing: &OutgoingMessage,
    ) -> Result<Message, StoreError> {
        Err(Self::unavailable())
    }

    async fn recent_messages(
        &self,
        _room_id: &str,
        _limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        Err(Self::unavailable())
    }

    async fn upsert_presence(
        &self,
        _room_id: &str,
        _nickname: &str,
        _is_typing: bool,
        _last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }

    async fn active_presence(
        &self,
        _room_id: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ActiveUser>, StoreError> {
        Err(Self::unavailable())
    }

    fn subscribe_messages(&self, room_id: &str) -> Subscription {
        Subscription::closed(room_id.to_string())
    }

    fn subscribe_presence(&self, room_id: &str) -> Subscription {
        Subscription::closed(room_id.to_string())
    }
}
