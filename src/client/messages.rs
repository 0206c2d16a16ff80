//! Message pipeline: outgoing sends and the ordered local log the
//! surface renders from.

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::errors::{ChatError, StoreError};
use crate::common::models::{Message, OutgoingMessage};
use crate::store::ChatStore;

/// Pre-encoding cap for image/file payloads.
pub const MAX_ATTACHMENT_BYTES: i64 = 10 * 1024 * 1024;

/// Ordered log of the active room, de-duplicated by message id so a
/// snapshot load racing a live push cannot double-insert.
#[derive(Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    seen: HashSet<String>,
}

impl MessageLog {
    /// Wholesale replacement, used at join time and on manual refresh.
    pub fn replace(&mut self, snapshot: Vec<Message>) {
        self.seen = snapshot.iter().map(|m| m.id.clone()).collect();
        self.entries = snapshot;
    }

    /// Append a pushed message unless its id is already present.
    /// Returns whether the log changed.
    pub fn apply(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.entries.push(message);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }
}

pub struct MessagePipeline {
    store: Arc<dyn ChatStore>,
    log: MessageLog,
    history_limit: u32,
}

impl MessagePipeline {
    pub fn new(store: Arc<dyn ChatStore>, history_limit: u32) -> Self {
        Self { store, log: MessageLog::default(), history_limit }
    }

    /// Snapshot fetch of the most recent messages, oldest first,
    /// replacing the local log wholesale. Callers treat failures as
    /// transient: the log keeps its previous contents.
    pub async fn load(&mut self, room_id: &str) -> Result<(), StoreError> {
        let snapshot = self.store.recent_messages(room_id, self.history_limit).await?;
        self.log.replace(snapshot);
        Ok(())
    }

    /// Validate and insert one message. The local log is NOT updated
    /// here: the sender observes their own message through the realtime
    /// push, the same path every other participant uses.
    pub async fn send(
        &mut self,
        room_id: &str,
        sender: &str,
        outgoing: &OutgoingMessage,
    ) -> Result<(), ChatError> {
        if outgoing.kind().is_attachment() {
            let size = outgoing.file_size.unwrap_or(outgoing.content.len() as i64);
            if size > MAX_ATTACHMENT_BYTES {
                return Err(ChatError::AttachmentTooLarge { size, max: MAX_ATTACHMENT_BYTES });
            }
        }
        self.store
            .insert_message(room_id, sender, outgoing)
            .await
            .map_err(|e| ChatError::from_store(e, ChatError::SendMessage))?;
        Ok(())
    }

    pub fn apply(&mut self, message: Message) -> bool {
        self.log.apply(message)
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn messages(&self) -> &[Message] {
        self.log.entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::MessageType;
    use chrono::Utc;

    fn message(id: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            room_id: "room-1".to_string(),
            sender: "Alice".to_string(),
            content: content.to_string(),
            message_type: MessageType::Text,
            file_name: None,
            file_size: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn apply_deduplicates_by_id() {
        let mut log = MessageLog::default();
        assert!(log.apply(message("m1", "hello")));
        assert!(!log.apply(message("m1", "hello")));
        assert!(log.apply(message("m2", "again")));
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn replace_reseeds_the_seen_set() {
        let mut log = MessageLog::default();
        log.apply(message("m1", "old"));
        log.replace(vec![message("m2", "snap"), message("m3", "shot")]);
        // m1 is forgotten, snapshot ids are deduplicated against pushes.
        assert!(log.apply(message("m1", "old")));
        assert!(!log.apply(message("m2", "snap")));
        assert_eq!(log.entries().len(), 3);
    }
}
