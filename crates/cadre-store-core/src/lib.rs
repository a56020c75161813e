#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-store-core** – Core substrate abstraction for Cadre.
//!
//! This crate defines the contract every component uses to talk to the shared
//! key/value + stream store: append-only streams with consumer groups,
//! set-if-absent keys with TTL, counters, sets, and atomic write batches.
//! Concrete drivers (Redis, in-memory) implement the trait in separate crates
//! that depend on this core abstraction; everything above the substrate is
//! driver-agnostic.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

mod keyspace;
pub use keyspace::KeySpace;

//─────────────────────────────
//  Stream entry
//─────────────────────────────

/// One entry read from a stream.
///
/// `id` is the substrate-assigned entry id (monotonic per stream); `fields`
/// are the raw field/value pairs as appended. Consumers must tolerate fields
/// they do not understand.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Substrate-assigned entry id.
    pub id: String,
    /// Raw entry fields.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Build an entry from an id and field pairs.
    pub fn new(id: impl Into<String>, fields: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            id: id.into(),
            fields: fields.into_iter().collect(),
        }
    }
}

//─────────────────────────────
//  Write batches
//─────────────────────────────

/// One key/value mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvWrite {
    /// Set `key` to `value`.
    Set {
        /// Target key.
        key: String,
        /// New value.
        value: String,
    },
    /// Delete `key`.
    Delete {
        /// Target key.
        key: String,
    },
    /// Add `member` to the set at `key`.
    SetAdd {
        /// Target set key.
        key: String,
        /// Member to add.
        member: String,
    },
    /// Remove `member` from the set at `key`.
    SetRemove {
        /// Target set key.
        key: String,
        /// Member to remove.
        member: String,
    },
}

//─────────────────────────────
//  Substrate trait
//─────────────────────────────

/// Thin facade over the shared key/value + stream store.
///
/// All Cadre components depend only on this trait; one production driver
/// (Redis) and one in-memory driver used by tests implement it. Streams are
/// append-only; each entry is delivered to a consumer group at least once and
/// stays pending until acked.
#[async_trait]
pub trait Substrate: Send + Sync {
    //──────── streams ────────

    /// Append an entry to `stream`, returning the assigned entry id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;

    /// Create the consumer group on `stream` if it does not exist yet.
    ///
    /// Idempotent; also creates the stream when absent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` entries not yet delivered to `group`, blocking up
    /// to `block` when none are available.
    ///
    /// Delivered entries become pending for `consumer` until acked.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Transfer ownership of up to `count` pending entries whose idle time is
    /// at least `min_idle` to `consumer`, returning them for reprocessing.
    ///
    /// An entry with idle time exactly equal to `min_idle` is claimable.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry for `group`, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()>;

    //──────── key/value ────────

    /// Set `key` to `value` only if absent, with the given TTL.
    ///
    /// Returns `true` when the key was set by this call.
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a plain key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a plain key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key unconditionally.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment the counter at `key`, (re)arming its TTL, and return the new
    /// value. A missing key counts from zero.
    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<u64>;

    //──────── sets ────────

    /// Add a member to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// Remove a member from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    /// All members of the set at `key`, in no particular order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    //──────── batches ────────

    /// Apply `ops` as a single logical update.
    ///
    /// Readers observe either none or all of the batch. Stores use this for
    /// document-plus-index updates that must never be seen half-applied.
    async fn run_batch(&self, ops: Vec<KvWrite>) -> Result<()>;
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Driver-level substrate failures.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// Could not reach the backing store.
    #[error("substrate connection failed: {0}")]
    Connection(String),
    /// A store command failed.
    #[error("substrate command failed: {0}")]
    Command(String),
    /// A stored value could not be interpreted.
    #[error("malformed substrate reply: {0}")]
    MalformedReply(String),
    /// The named consumer group does not exist.
    #[error("unknown consumer group {group} on stream {stream}")]
    UnknownGroup {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },
}
