//! The Remote Data Store boundary.
//!
//! The client core only ever talks to a [`ChatStore`]. The sqlite backend
//! is the reference implementation of the contract; [`UnconfiguredStore`]
//! is the degraded mode used when no store was set up.

pub mod sqlite;
pub mod unconfigured;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::common::errors::StoreError;
use crate::common::models::{ActiveUser, ChatRoom, Message, OutgoingMessage};

pub use sqlite::SqliteStore;
pub use unconfigured::UnconfiguredStore;

/// Row-level change notification pushed by the store. Every event is
/// tagged with the room id its subscription was scoped to, so the
/// session can discard deliveries for a room it already left.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    MessageInserted { room_id: String, message: Message },
    PresenceChanged { room_id: String },
}

impl StoreEvent {
    pub fn room_id(&self) -> &str {
        match self {
            StoreEvent::MessageInserted { room_id, .. } => room_id,
            StoreEvent::PresenceChanged { room_id } => room_id,
        }
    }
}

/// Capacity of one subscription queue. When a consumer falls this far
/// behind, further events are dropped; `refresh_data` re-syncs.
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

/// Which change feed a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Messages,
    Presence,
}

/// Handle on one logical change subscription, scoped to a table and a
/// room. Dropping the handle releases the subscription: the forwarding
/// task is aborted and no further events are delivered.
pub struct Subscription {
    room_id: String,
    rx: mpsc::Receiver<StoreEvent>,
    forward: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Build a live subscription from the store's broadcast feed,
    /// keeping only events of `kind` for `room_id`.
    pub(crate) fn filtered(
        room_id: String,
        kind: SubscriptionKind,
        mut feed: broadcast::Receiver<StoreEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        let room = room_id.clone();
        let forward = tokio::spawn(async move {
            loop {
                let event = match feed.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("subscription for room {} lagged, skipped {} events", room, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let matches = match (&event, kind) {
                    (StoreEvent::MessageInserted { room_id, .. }, SubscriptionKind::Messages) => {
                        room_id == &room
                    }
                    (StoreEvent::PresenceChanged { room_id }, SubscriptionKind::Presence) => {
                        room_id == &room
                    }
                    _ => false,
                };
                if !matches {
                    continue;
                }
                if tx.try_send(event).is_err() {
                    // Queue full or receiver gone; the manual refresh path
                    // is the compensating control for dropped events.
                    warn!("subscription queue for room {} full, dropping event", room);
                }
            }
        });
        Self { room_id, rx, forward: Some(forward) }
    }

    /// A subscription that never delivers anything (degraded mode).
    pub(crate) fn closed(room_id: String) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self { room_id, rx, forward: None }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Non-blocking poll, used by the session's pump.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        self.rx.try_recv().ok()
    }

    /// Await the next event; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
    }
}

/// The operations the hosted backend provides. Everything is async and
/// must fail deterministically when the backing service is unreachable.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Server-side procedure returning a PIN unique among non-expired
    /// rooms.
    async fn generate_unique_pin(&self) -> Result<String, StoreError>;

    async fn insert_room(
        &self,
        pin: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ChatRoom, StoreError>;

    /// Room with this PIN whose expiry is strictly after `now`, if any.
    async fn find_active_room(
        &self,
        pin: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ChatRoom>, StoreError>;

    async fn insert_message(
        &self,
        room_id: &str,
        sender: &str,
        outgoing: &OutgoingMessage,
    ) -> Result<Message, StoreError>;

    /// The `limit` most recent messages of the room, oldest first.
    async fn recent_messages(&self, room_id: &str, limit: u32)
        -> Result<Vec<Message>, StoreError>;

    /// Upsert keyed by (room_id, nickname); overwrites in place.
    async fn upsert_presence(
        &self,
        room_id: &str,
        nickname: &str,
        is_typing: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Presence rows with `last_seen` strictly after `since`.
    async fn active_presence(
        &self,
        room_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActiveUser>, StoreError>;

    fn subscribe_messages(&self, room_id: &str) -> Subscription;

    fn subscribe_presence(&self, room_id: &str) -> Subscription;
}
