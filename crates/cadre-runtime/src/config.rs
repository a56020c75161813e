//! Environment configuration with explicit defaults.
//!
//! Every knob is defaulted; none is required at boot. The substrate address
//! is taken from `CADRE_REDIS_URL` when present, otherwise assembled from
//! host/port/db/password parts.

use std::env;
use std::time::Duration;

use cadre_store_core::KeySpace;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Runtime configuration shared by every Cadre service.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Substrate connection URL.
    pub redis_url: String,
    /// Main event stream name.
    pub stream: String,
    /// Dead-letter stream name.
    pub dlq_stream: String,
    /// Prefix for persisted keys.
    pub key_prefix: String,
    /// Prefix for idempotence markers.
    pub idempotence_prefix: String,
    /// Consumer group this process joins.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
    /// Max entries fetched per read.
    pub read_count: usize,
    /// Blocking read budget in milliseconds.
    pub block_ms: u64,
    /// Idle time after which a pending entry is reclaimable, in milliseconds.
    pub idle_reclaim_ms: u64,
    /// Max pending entries reclaimed per pass.
    pub pending_reclaim_count: usize,
    /// Delivery attempts before an entry is dead-lettered.
    pub max_attempts: u64,
    /// Idempotence marker lifetime in seconds.
    pub dedupe_ttl_seconds: u64,
    /// Dispatch lock lease in seconds.
    pub lock_ttl_seconds: u64,
    /// Per-handler wall-clock budget in milliseconds; 0 disables it.
    pub handler_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            stream: "audit:events".to_string(),
            dlq_stream: "audit:dlq".to_string(),
            key_prefix: "cadre".to_string(),
            idempotence_prefix: "cadre:idempotence".to_string(),
            group: "orchestrator".to_string(),
            consumer: "consumer-1".to_string(),
            read_count: 16,
            block_ms: 5_000,
            idle_reclaim_ms: 60_000,
            pending_reclaim_count: 16,
            max_attempts: 5,
            dedupe_ttl_seconds: 86_400,
            lock_ttl_seconds: 120,
            handler_timeout_ms: 0,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env::var("CADRE_REDIS_URL").unwrap_or_else(|_| assembled_url()),
            stream: string_var("CADRE_STREAM", defaults.stream),
            dlq_stream: string_var("CADRE_DLQ_STREAM", defaults.dlq_stream),
            key_prefix: string_var("CADRE_KEY_PREFIX", defaults.key_prefix),
            idempotence_prefix: string_var(
                "CADRE_IDEMPOTENCE_PREFIX",
                defaults.idempotence_prefix,
            ),
            group: string_var("CADRE_GROUP", defaults.group),
            consumer: string_var("CADRE_CONSUMER", defaults.consumer),
            read_count: parsed_var("CADRE_READ_COUNT", defaults.read_count),
            block_ms: parsed_var("CADRE_BLOCK_MS", defaults.block_ms),
            idle_reclaim_ms: parsed_var("CADRE_IDLE_RECLAIM_MS", defaults.idle_reclaim_ms),
            pending_reclaim_count: parsed_var(
                "CADRE_PENDING_RECLAIM_COUNT",
                defaults.pending_reclaim_count,
            ),
            max_attempts: parsed_var("CADRE_MAX_ATTEMPTS", defaults.max_attempts),
            dedupe_ttl_seconds: parsed_var(
                "CADRE_DEDUPE_TTL_SECONDS",
                defaults.dedupe_ttl_seconds,
            ),
            lock_ttl_seconds: parsed_var("CADRE_LOCK_TTL_S", defaults.lock_ttl_seconds),
            handler_timeout_ms: parsed_var(
                "CADRE_HANDLER_TIMEOUT_MS",
                defaults.handler_timeout_ms,
            ),
        }
    }

    /// Key space rooted at the configured prefixes.
    pub fn keyspace(&self) -> KeySpace {
        KeySpace::new(&self.key_prefix, &self.idempotence_prefix)
    }

    /// Blocking read budget.
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Reclaim idle threshold.
    pub fn idle_reclaim(&self) -> Duration {
        Duration::from_millis(self.idle_reclaim_ms)
    }

    /// Idempotence marker lifetime.
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_seconds)
    }

    /// Dispatch lock lease.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    /// Per-handler wall-clock budget, when enabled.
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }
}

fn string_var(name: &str, default: String) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn parsed_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Assemble a Redis URL from host/port/db/password parts.
fn assembled_url() -> String {
    let host = string_var("CADRE_REDIS_HOST", "127.0.0.1".to_string());
    let port = string_var("CADRE_REDIS_PORT", "6379".to_string());
    let db = string_var("CADRE_REDIS_DB", "0".to_string());
    match env::var("CADRE_REDIS_PASSWORD").ok().filter(|p| !p.is_empty()) {
        Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
        None => format!("redis://{host}:{port}/{db}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_streams() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stream, "audit:events");
        assert_eq!(config.dlq_stream, "audit:dlq");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.dedupe_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.lock_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn keyspace_uses_the_configured_prefixes() {
        let config = RuntimeConfig {
            key_prefix: "x".to_string(),
            idempotence_prefix: "x:seen".to_string(),
            ..RuntimeConfig::default()
        };
        let keys = config.keyspace();
        assert_eq!(keys.lock("a"), "x:lock:a");
        assert_eq!(keys.idempotence("g", "e"), "x:seen:g:e");
    }
}
