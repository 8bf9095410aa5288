use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Tunables for the sync engine. Every field has a default so a partial
/// JSON document or environment is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages per backfill page.
    pub page_size: usize,
    /// Compare-and-set attempts before a transaction gives up.
    pub transact_attempts: u32,
    /// Gateway reconnect attempts before a live subscription is dropped.
    pub resubscribe_attempts: u32,
    /// Base delay of the reconnect backoff, doubled per attempt.
    pub resubscribe_backoff_ms: u64,
    /// Offset from UTC used to decide calendar days.
    pub utc_offset_minutes: i32,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 25,
            transact_attempts: 25,
            resubscribe_attempts: 5,
            resubscribe_backoff_ms: 250,
            utc_offset_minutes: 0,
            request_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Read `PALAVER_*` variables, falling back to defaults for anything
    /// unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
            var(name).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            page_size: parsed(&var, "PALAVER_PAGE_SIZE", defaults.page_size).max(1),
            transact_attempts: parsed(&var, "PALAVER_TRANSACT_ATTEMPTS", defaults.transact_attempts).max(1),
            resubscribe_attempts: parsed(&var, "PALAVER_RESUBSCRIBE_ATTEMPTS", defaults.resubscribe_attempts),
            resubscribe_backoff_ms: parsed(&var, "PALAVER_RESUBSCRIBE_BACKOFF_MS", defaults.resubscribe_backoff_ms),
            utc_offset_minutes: parsed(&var, "PALAVER_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
            request_timeout_ms: parsed(&var, "PALAVER_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
        }
    }

    /// Out-of-range offsets fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn resubscribe_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.resubscribe_backoff_ms.saturating_mul(1 << exp))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::from_lookup(lookup(&[]));
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.page_size, 25);
        assert_eq!(config.utc_offset().local_minus_utc(), 0);
    }

    #[test]
    fn overrides_and_garbage() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("PALAVER_PAGE_SIZE", "5"),
            ("PALAVER_TRANSACT_ATTEMPTS", "lots"),
            ("PALAVER_UTC_OFFSET_MINUTES", "-300"),
        ]));
        assert_eq!(config.page_size, 5);
        assert_eq!(config.transact_attempts, 25);
        assert_eq!(config.utc_offset().local_minus_utc(), -300 * 60);
    }

    #[test]
    fn zero_page_size_is_clamped() {
        let config = SyncConfig::from_lookup(lookup(&[("PALAVER_PAGE_SIZE", "0")]));
        assert_eq!(config.page_size, 1);
    }

    #[test]
    fn backoff_doubles() {
        let config = SyncConfig::default();
        assert_eq!(config.resubscribe_backoff(1), Duration::from_millis(250));
        assert_eq!(config.resubscribe_backoff(3), Duration::from_millis(1000));
    }

    #[test]
    fn partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{ "page_size": 10 }"#).unwrap();
        assert_eq!(config.page_size, 10);
        assert_eq!(config.resubscribe_attempts, 5);
    }
}
