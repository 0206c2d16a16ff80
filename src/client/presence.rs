//! Presence manager: upserts the local user's (room, nickname) row and
//! maintains the decaying active-user view.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::warn;
use tokio::task::JoinHandle;

use crate::common::errors::ChatError;
use crate::common::models::ActiveUser;
use crate::store::ChatStore;

pub struct PresenceManager {
    store: Arc<dyn ChatStore>,
    active: Vec<ActiveUser>,
    typing_reset: Option<JoinHandle<()>>,
    typing_timeout: Duration,
    presence_window: Duration,
}

impl PresenceManager {
    pub fn new(store: Arc<dyn ChatStore>, typing_timeout: Duration, presence_window: Duration) -> Self {
        Self {
            store,
            active: Vec::new(),
            typing_reset: None,
            typing_timeout,
            presence_window,
        }
    }

    /// Idempotent upsert keyed by (room, nickname); `last_seen` is
    /// always refreshed to now.
    pub async fn update_presence(
        &self,
        room_id: &str,
        nickname: &str,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        self.store
            .upsert_presence(room_id, nickname, is_typing, Utc::now())
            .await
            .map_err(|e| ChatError::from_store(e, ChatError::PresenceUpdate))
    }

    /// Write the typing flag. Turning it on arms a timer that clears it
    /// after the configured timeout unless re-armed, so a crashed client
    /// cannot appear perpetually typing.
    pub async fn set_typing(
        &mut self,
        room_id: &str,
        nickname: &str,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        self.cancel_typing_reset();
        self.update_presence(room_id, nickname, is_typing).await?;

        if is_typing {
            let store = Arc::clone(&self.store);
            let room = room_id.to_string();
            let nick = nickname.to_string();
            let timeout = self.typing_timeout;
            self.typing_reset = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Err(e) = store.upsert_presence(&room, &nick, false, Utc::now()).await {
                    warn!("failed to clear stale typing flag for {}: {}", nick, e);
                }
            }));
        }
        Ok(())
    }

    /// Full re-read of the active rows (notify-then-refetch: the push
    /// event payload is never applied directly).
    pub async fn refresh(&mut self, room_id: &str) -> Result<(), ChatError> {
        let window = chrono::Duration::from_std(self.presence_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let since = Utc::now() - window;
        self.active = self
            .store
            .active_presence(room_id, since)
            .await
            .map_err(|e| ChatError::from_store(e, ChatError::PresenceUpdate))?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.cancel_typing_reset();
        self.active.clear();
    }

    /// Everyone active in the window, local user included; filtering
    /// "self" out of typing/mention views is the surface's job.
    pub fn users(&self) -> &[ActiveUser] {
        &self.active
    }

    fn cancel_typing_reset(&mut self) {
        if let Some(handle) = self.typing_reset.take() {
            handle.abort();
        }
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        self.cancel_typing_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Duration as ChronoDuration;

    async fn manager_with_store() -> (PresenceManager, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let manager = PresenceManager::new(
            store.clone(),
            Duration::from_millis(80),
            Duration::from_secs(300),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn typing_flag_expires_without_a_refresh() {
        let (mut manager, store) = manager_with_store().await;
        manager.set_typing("room-1", "Alice", true).await.unwrap();

        let since = Utc::now() - ChronoDuration::minutes(5);
        let users = store.active_presence("room-1", since).await.unwrap();
        assert!(users[0].is_typing);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let users = store.active_presence("room-1", since).await.unwrap();
        assert!(!users[0].is_typing, "typing flag must auto-clear");
    }

    #[tokio::test]
    async fn rearming_the_timer_keeps_typing_alive() {
        let (mut manager, store) = manager_with_store().await;
        manager.set_typing("room-1", "Alice", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        manager.set_typing("room-1", "Alice", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 80ms after the first call, but only 40ms after the re-arm.
        let since = Utc::now() - ChronoDuration::minutes(5);
        let users = store.active_presence("room-1", since).await.unwrap();
        assert!(users[0].is_typing);
    }

    #[tokio::test]
    async fn explicit_stop_cancels_the_pending_reset() {
        let (mut manager, store) = manager_with_store().await;
        manager.set_typing("room-1", "Alice", true).await.unwrap();
        manager.set_typing("room-1", "Alice", false).await.unwrap();

        let since = Utc::now() - ChronoDuration::minutes(5);
        let users = store.active_presence("room-1", since).await.unwrap();
        assert_eq!(users.len(), 1, "still one row per (room, nickname)");
        assert!(!users[0].is_typing);
    }

    #[tokio::test]
    async fn refresh_replaces_the_active_view() {
        let (mut manager, store) = manager_with_store().await;
        store.upsert_presence("room-1", "Bob", false, Utc::now()).await.unwrap();
        store
            .upsert_presence("room-1", "Ghost", true, Utc::now() - ChronoDuration::minutes(6))
            .await
            .unwrap();

        manager.refresh("room-1").await.unwrap();
        let names: Vec<&str> = manager.users().iter().map(|u| u.nickname.as_str()).collect();
        assert_eq!(names, vec!["Bob"]);
    }
}
