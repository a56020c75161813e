#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-store-memory** – In-memory substrate driver for Cadre.
//!
//! This crate provides a fast, non-persistent implementation of the substrate
//! contract suitable for tests and development. All data lives in process
//! memory and is lost on termination. Consumer-group semantics (pending
//! entries, idle times, reclaim) mirror the production driver closely enough
//! that the reliable-consumer runtime can be exercised against it, including
//! idle-boundary cases under paused tokio time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use cadre_store_core::{KvWrite, StreamEntry, Substrate};

//─────────────────────────────
//  Internal state
//─────────────────────────────

#[derive(Debug, Clone)]
struct StoredEntry {
    id: String,
    seq: u64,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingEntry {
    seq: u64,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream's entry vector of the next undelivered entry.
    cursor: usize,
    /// Pending entries by entry id.
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    values: HashMap<String, ValueEntry>,
    sets: HashMap<String, BTreeSet<String>>,
}

//─────────────────────────────
//  Driver
//─────────────────────────────

/// An in-memory, non-persistent substrate.
///
/// Cloning shares the underlying store, so one instance can back several
/// services in a test the way a single server would in production.
#[derive(Debug, Clone, Default)]
pub struct MemorySubstrate {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemorySubstrate {
    /// Create a new, empty substrate.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries of `stream` in append order, for test assertions.
    pub async fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| StreamEntry::new(e.id.clone(), e.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries currently pending for `(stream, group)`.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Drop all streams, keys and sets.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
    }

    fn deliver(
        stream: &mut StreamState,
        group: &str,
        consumer: &str,
        count: usize,
        now: Instant,
    ) -> Vec<StreamEntry> {
        let state = stream.groups.entry(group.to_string()).or_default();
        let mut out = Vec::new();
        while out.len() < count && state.cursor < stream.entries.len() {
            let entry = &stream.entries[state.cursor];
            state.cursor += 1;
            state.pending.insert(
                entry.id.clone(),
                PendingEntry {
                    seq: entry.seq,
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            out.push(StreamEntry::new(entry.id.clone(), entry.fields.clone()));
        }
        out
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        state.entries.push(StoredEntry {
            id: id.clone(),
            seq: state.next_seq,
            fields: fields.iter().cloned().collect(),
        });
        drop(inner);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the await cannot be missed.
            let notified = self.appended.notified();
            {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                if let Some(state) = inner.streams.get_mut(stream) {
                    let batch = MemorySubstrate::deliver(state, group, consumer, count, now);
                    if !batch.is_empty() {
                        return Ok(batch);
                    }
                } else {
                    inner.streams.entry(stream.to_string()).or_default();
                }
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(Vec::new());
            };
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        // Idle time equal to the threshold qualifies.
        let mut claimable: Vec<(u64, String)> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, p)| (p.seq, id.clone()))
            .collect();
        claimable.sort();
        claimable.truncate(count);

        let mut out = Vec::new();
        for (seq, id) in claimable {
            if let Some(pending) = group_state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.delivery_count += 1;
            }
            if let Some(entry) = state.entries.iter().find(|e| e.seq == seq) {
                out.push(StreamEntry::new(entry.id.clone(), entry.fields.clone()));
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if inner.values.get(key).is_some_and(|v| v.live(now)) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .values
            .get(key)
            .filter(|v| v.live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        Ok(())
    }

    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let current = inner
            .values
            .get(key)
            .filter(|v| v.live(now))
            .and_then(|v| v.value.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner.values.insert(
            key.to_string(),
            ValueEntry {
                value: next.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn run_batch(&self, ops: Vec<KvWrite>) -> Result<()> {
        // One lock guard spans the whole batch, so readers see all or nothing.
        let mut inner = self.inner.lock().await;
        for op in ops {
            match op {
                KvWrite::Set { key, value } => {
                    inner.values.insert(
                        key,
                        ValueEntry {
                            value,
                            expires_at: None,
                        },
                    );
                }
                KvWrite::Delete { key } => {
                    inner.values.remove(&key);
                }
                KvWrite::SetAdd { key, member } => {
                    inner.sets.entry(key).or_default().insert(member);
                }
                KvWrite::SetRemove { key, member } => {
                    if let Some(set) = inner.sets.get_mut(&key) {
                        set.remove(&member);
                    }
                }
            }
        }
        Ok(())
    }
}
