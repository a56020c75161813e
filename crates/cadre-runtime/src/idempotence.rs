//! Per-`(group, event_id)` once-only markers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use cadre_store_core::{KeySpace, Substrate};

/// Once-only marker store keyed by consumer group and event id.
///
/// Presence of a marker means "already processed by this group". The TTL
/// should exceed the longest expected replay window; the default is 24 h.
#[derive(Clone)]
pub struct IdempotenceGuard {
    substrate: Arc<dyn Substrate>,
    keys: KeySpace,
    ttl: Duration,
}

impl IdempotenceGuard {
    /// Create a guard over `substrate` with the given marker lifetime.
    pub fn new(substrate: Arc<dyn Substrate>, keys: KeySpace, ttl: Duration) -> Self {
        Self { substrate, keys, ttl }
    }

    /// Atomically mark `(group, event_id)` as processed.
    ///
    /// Returns `true` when the marker was absent and the caller should
    /// proceed; `false` means another delivery already claimed it.
    pub async fn mark_if_new(&self, group: &str, event_id: &str) -> Result<bool> {
        self.substrate
            .set_nx_ttl(&self.keys.idempotence(group, event_id), "1", self.ttl)
            .await
    }

    /// Remove a marker so a later delivery can pass the guard again.
    ///
    /// Used when a handler fails retryably: the reclaimed entry must reach
    /// the handler once more.
    pub async fn clear(&self, group: &str, event_id: &str) -> Result<()> {
        self.substrate
            .delete(&self.keys.idempotence(group, event_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_store_memory::MemorySubstrate;

    fn guard() -> IdempotenceGuard {
        IdempotenceGuard::new(
            Arc::new(MemorySubstrate::new()),
            KeySpace::default(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn first_marker_wins() {
        let guard = guard();
        assert!(guard.mark_if_new("g", "e1").await.unwrap());
        assert!(!guard.mark_if_new("g", "e1").await.unwrap());
        // Another group is independent.
        assert!(guard.mark_if_new("h", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn clear_reopens_the_marker() {
        let guard = guard();
        assert!(guard.mark_if_new("g", "e1").await.unwrap());
        guard.clear("g", "e1").await.unwrap();
        assert!(guard.mark_if_new("g", "e1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn markers_expire() {
        let guard = guard();
        assert!(guard.mark_if_new("g", "e1").await.unwrap());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(guard.mark_if_new("g", "e1").await.unwrap());
    }
}
