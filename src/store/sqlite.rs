//! SQLite-backed implementation of the store contract, with an
//! in-process change feed standing in for the hosted realtime channel.

use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use async_trait::async_trait;

use crate::common::errors::StoreError;
use crate::common::models::{ActiveUser, ChatRoom, Message, MessageType, OutgoingMessage, ReplyRef};
use crate::common::pin;
use crate::store::{ChatStore, StoreEvent, Subscription, SubscriptionKind};

/// Attempts before the unique-PIN procedure gives up. With a 36^6 key
/// space this only triggers when the table is saturated.
const PIN_GENERATION_ATTEMPTS: usize = 32;

const EVENT_FEED_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // Multiple connections to an in-memory database would each see
        // their own empty database, so pin those to a single connection.
        let max_connections = if database_url.contains("memory") { 1 } else { 5 };

        if let Some(mut db_path) = database_url.strip_prefix("sqlite:") {
            while db_path.starts_with('/') {
                db_path = &db_path[1..];
            }
            if !db_path.is_empty() && !db_path.contains("memory") {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            StoreError::Unavailable(format!(
                                "cannot create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("connected to chat store at {}", database_url);

        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        let store = Self { pool, events };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_rooms (
                id TEXT PRIMARY KEY,
                pin TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // seq is the insertion-order tiebreak for equal created_at.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                room_id TEXT NOT NULL,
                sender_nickname TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL,
                file_name TEXT,
                file_size INTEGER,
                reply_to_id TEXT,
                reply_to_preview TEXT,
                reply_to_sender TEXT,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_presence (
                id TEXT NOT NULL,
                room_id TEXT NOT NULL,
                nickname TEXT NOT NULL,
                is_typing INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(room_id, nickname)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine; send only fails then.
        let _ = self.events.send(event);
    }
}

fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn room_from_row(row: &sqlx::sqlite::SqliteRow) -> ChatRoom {
    ChatRoom {
        id: row.get::<String, _>("id"),
        pin: row.get::<String, _>("pin"),
        created_at: datetime_from_ms(row.get::<i64, _>("created_at")),
        expires_at: datetime_from_ms(row.get::<i64, _>("expires_at")),
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Message {
    let reply_to = row
        .get::<Option<String>, _>("reply_to_id")
        .map(|id| ReplyRef {
            id,
            preview: row.get::<Option<String>, _>("reply_to_preview").unwrap_or_default(),
            sender: row.get::<Option<String>, _>("reply_to_sender").unwrap_or_default(),
        });
    Message {
        id: row.get::<String, _>("id"),
        room_id: row.get::<String, _>("room_id"),
        sender: row.get::<String, _>("sender_nickname"),
        content: row.get::<String, _>("content"),
        message_type: MessageType::parse(&row.get::<String, _>("message_type")),
        file_name: row.get::<Option<String>, _>("file_name"),
        file_size: row.get::<Option<i64>, _>("file_size"),
        reply_to,
        created_at: datetime_from_ms(row.get::<i64, _>("created_at")),
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn generate_unique_pin(&self) -> Result<String, StoreError> {
        let now = Utc::now().timestamp_millis();
        for _ in 0..PIN_GENERATION_ATTEMPTS {
            let candidate = pin::random_pin();
            let taken = sqlx::query("SELECT 1 FROM chat_rooms WHERE pin = ? AND expires_at > ?")
                .bind(&candidate)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !taken {
                return Ok(candidate);
            }
            debug!("pin {} already in use, retrying", candidate);
        }
        Err(StoreError::Unavailable(
            "unique PIN generation exhausted its attempts".to_string(),
        ))
    }

    async fn insert_room(
        &self,
        pin: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ChatRoom, StoreError> {
        let room = ChatRoom {
            id: Uuid::new_v4().to_string(),
            pin: pin.to_string(),
            created_at,
            expires_at,
        };
        sqlx::query("INSERT INTO chat_rooms (id, pin, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&room.id)
            .bind(&room.pin)
            .bind(room.created_at.timestamp_millis())
            .bind(room.expires_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        info!("created room {} (pin {})", room.id, room.pin);
        Ok(room)
    }

    async fn find_active_room(
        &self,
        pin: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ChatRoom>, StoreError> {
        let row = sqlx::query("SELECT * FROM chat_rooms WHERE pin = ? AND expires_at > ? LIMIT 1")
            .bind(pin)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(room_from_row))
    }

    async fn insert_message(
        &self,
        room_id: &str,
        sender: &str,
        outgoing: &OutgoingMessage,
    ) -> Result<Message, StoreError> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: outgoing.content.clone(),
            message_type: outgoing.kind(),
            file_name: outgoing.file_name.clone(),
            file_size: outgoing.file_size,
            reply_to: outgoing.reply_to.clone(),
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO messages
               (id, room_id, sender_nickname, content, message_type,
                file_name, file_size, reply_to_id, reply_to_preview, reply_to_sender, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(&message.sender)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(&message.file_name)
        .bind(message.file_size)
        .bind(message.reply_to.as_ref().map(|r| r.id.clone()))
        .bind(message.reply_to.as_ref().map(|r| r.preview.clone()))
        .bind(message.reply_to.as_ref().map(|r| r.sender.clone()))
        .bind(message.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.notify(StoreEvent::MessageInserted {
            room_id: room_id.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    async fn recent_messages(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        // Take the newest `limit` rows, then flip them oldest-first.
        let rows = sqlx::query(
            r#"SELECT * FROM messages WHERE room_id = ?
               ORDER BY created_at DESC, seq DESC LIMIT ?"#,
        )
        .bind(room_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    async fn upsert_presence(
        &self,
        room_id: &str,
        nickname: &str,
        is_typing: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_ms = last_seen.timestamp_millis();
        sqlx::query(
            r#"INSERT INTO user_presence (id, room_id, nickname, is_typing, last_seen, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(room_id, nickname)
               DO UPDATE SET is_typing = excluded.is_typing, last_seen = excluded.last_seen"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(room_id)
        .bind(nickname)
        .bind(is_typing as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        self.notify(StoreEvent::PresenceChanged { room_id: room_id.to_string() });
        Ok(())
    }

    async fn active_presence(
        &self,
        room_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActiveUser>, StoreError> {
        let rows = sqlx::query(
            "SELECT nickname, is_typing FROM user_presence WHERE room_id = ? AND last_seen > ?",
        )
        .bind(room_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ActiveUser {
                nickname: row.get::<String, _>("nickname"),
                is_typing: row.get::<i64, _>("is_typing") != 0,
            })
            .collect())
    }

    fn subscribe_messages(&self, room_id: &str) -> Subscription {
        Subscription::filtered(
            room_id.to_string(),
            SubscriptionKind::Messages,
            self.events.subscribe(),
        )
    }

    fn subscribe_presence(&self, room_id: &str) -> Subscription {
        Subscription::filtered(
            room_id.to_string(),
            SubscriptionKind::Presence,
            self.events.subscribe(),
        )
    }
}
