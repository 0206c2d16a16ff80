use std::env;

/// Client tunables, read from the environment with sensible defaults.
/// Tests shrink the timers instead of waiting wall-clock seconds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub database_url: String,
    /// Messages fetched on join and on manual refresh.
    pub history_limit: u32,
    /// Trailing window within which a presence row counts as active.
    pub presence_window_secs: u64,
    /// Server-visible typing flag auto-clear.
    pub typing_timeout_ms: u64,
    /// Room lifetime from creation to expiry.
    pub room_ttl_hours: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:data/pinchat.db".to_string(),
            history_limit: 100,
            presence_window_secs: 5 * 60,
            typing_timeout_ms: 3_000,
            room_ttl_hours: 24,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            database_url: env::var("PINCHAT_DATABASE_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            history_limit: env::var("PINCHAT_HISTORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_limit),
            presence_window_secs: env::var("PINCHAT_PRESENCE_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.presence_window_secs),
            typing_timeout_ms: env::var("PINCHAT_TYPING_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.typing_timeout_ms),
            room_ttl_hours: env::var("PINCHAT_ROOM_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.room_ttl_hours),
        }
    }
}
