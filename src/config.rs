//! Configuration module for Gamewatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

use chrono::Duration;

/// Minimum polling interval accepted from the `query-interval` setting.
pub const MIN_QUERY_INTERVAL_SECS: u64 = 30;
/// Polling interval used when the setting is absent or invalid.
pub const DEFAULT_QUERY_INTERVAL_SECS: u64 = 60;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "gamewatch.db")
    pub db_path: String,
    /// Maximum number of statuses queried concurrently (default: 8)
    pub max_concurrency: usize,
    /// How long a query may keep failing before it is disabled.
    pub dead_after: Duration,
    /// Retention window for history rows.
    pub history_expires_after: Duration,
    /// Retention window for per-row player rosters.
    pub history_players_expires_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "gamewatch.db".to_string(),
            max_concurrency: 8,
            dead_after: Duration::days(1),
            history_expires_after: Duration::days(30),
            history_players_expires_after: Duration::hours(1),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GAMEWATCH_DB_PATH`: Database file path (default: "gamewatch.db")
    /// - `GAMEWATCH_MAX_CONCURRENCY`: Concurrent status queries (default: 8)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("GAMEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(value) = env::var("GAMEWATCH_MAX_CONCURRENCY") {
            if let Ok(n) = value.parse() {
                if n > 0 {
                    cfg.max_concurrency = n;
                }
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.db_path, "gamewatch.db");
        assert_eq!(cfg.max_concurrency, 8);
        assert_eq!(cfg.dead_after, Duration::days(1));
        assert_eq!(cfg.history_expires_after, Duration::days(30));
        assert_eq!(cfg.history_players_expires_after, Duration::hours(1));
    }
}
