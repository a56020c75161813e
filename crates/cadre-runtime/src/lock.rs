//! Named TTL lock leases.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use cadre_store_core::{KeySpace, Substrate};

/// Advisory lock service over set-if-absent keys.
///
/// A lease is not a mutex: the TTL bounds the exposure window if a holder
/// crashes, and `release` is an unconditional delete. Holders must stay
/// idempotent regardless of whether they still own the lease; the lock is
/// contention reduction, not correctness.
#[derive(Clone)]
pub struct LockService {
    substrate: Arc<dyn Substrate>,
    keys: KeySpace,
    ttl: Duration,
}

impl LockService {
    /// Create a lock service with the given default lease duration.
    pub fn new(substrate: Arc<dyn Substrate>, keys: KeySpace, ttl: Duration) -> Self {
        Self { substrate, keys, ttl }
    }

    /// Try to take the lease named `name`.
    ///
    /// Returns `true` when this caller now holds it.
    pub async fn acquire(&self, name: &str) -> Result<bool> {
        self.substrate
            .set_nx_ttl(&self.keys.lock(name), "1", self.ttl)
            .await
    }

    /// Release the lease named `name` unconditionally.
    pub async fn release(&self, name: &str) -> Result<()> {
        self.substrate.delete(&self.keys.lock(name)).await
    }
}
