use thiserror::Error;

/// Failures coming out of a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or was never configured. Every operation
    /// on such a store fails with this, it never hangs.
    #[error("chat store is not configured: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// User-facing error taxonomy of the client core. All variants are
/// recoverable at the boundary; none abort the process.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat store is not configured: {0}")]
    Configuration(String),
    #[error("failed to create room: {0}")]
    RoomCreation(String),
    /// Deliberately identical for "never existed" and "expired" so the
    /// error does not leak which PINs were ever valid.
    #[error("Room not found or expired")]
    RoomNotFound,
    #[error("failed to send message: {0}")]
    SendMessage(String),
    #[error("attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: i64, max: i64 },
    #[error("failed to update presence: {0}")]
    PresenceUpdate(String),
}

impl ChatError {
    /// Map a store failure, keeping configuration problems recognizable
    /// across every operation and tagging the rest with `wrap`.
    pub(crate) fn from_store(err: StoreError, wrap: fn(String) -> ChatError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ChatError::Configuration(msg),
            other => wrap(other.to_string()),
        }
    }
}
