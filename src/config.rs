//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a `DEFAULT_*` constant and falls back to it when the
//! variable is missing or unparsable, so a bare environment always boots.

use std::time::Duration;

pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_VIEWPORT_SYNC_WINDOW_MS: u64 = 50;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_PORT: u16 = 3000;

/// Parse `key` from the environment, or return `default`.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(v) => v.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Tuning knobs for the client-side sync components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last edit before the auto-save flush fires.
    pub autosave_debounce: Duration,
    /// How soon after one viewport sync a sync in the opposite direction is
    /// treated as an echo and dropped.
    pub viewport_sync_window: Duration,
    /// Per-subscriber inbound buffer on broadcast topics.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_millis(DEFAULT_AUTOSAVE_DEBOUNCE_MS),
            viewport_sync_window: Duration::from_millis(DEFAULT_VIEWPORT_SYNC_WINDOW_MS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Build from environment variables.
    ///
    /// Optional:
    /// - `AUTOSAVE_DEBOUNCE_MS`: default 2000
    /// - `VIEWPORT_SYNC_WINDOW_MS`: default 50
    /// - `CHANNEL_CAPACITY`: default 256
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            autosave_debounce: Duration::from_millis(env_parse("AUTOSAVE_DEBOUNCE_MS", DEFAULT_AUTOSAVE_DEBOUNCE_MS)),
            viewport_sync_window: Duration::from_millis(env_parse(
                "VIEWPORT_SYNC_WINDOW_MS",
                DEFAULT_VIEWPORT_SYNC_WINDOW_MS,
            )),
            channel_capacity: env_parse("CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
        }
    }
}

/// Settings for the relay server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub port: u16,
    /// When set, the relay also runs entity migrations against this database.
    pub database_url: Option<String>,
    pub channel_capacity: usize,
}

impl RelayConfig {
    /// Build from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DATABASE_URL`: no default; persistence is skipped when absent
    /// - `CHANNEL_CAPACITY`: default 256
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .into_iter()
                .find(|url| !url.trim().is_empty()),
            channel_capacity: env_parse("CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY).max(1),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
