#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-store-redis** – Redis substrate driver for Cadre.
//!
//! Maps the substrate contract onto Redis primitives:
//!
//! - streams via `XADD` / `XREADGROUP` / `XAUTOCLAIM` / `XACK`,
//! - once-only keys via `SET NX PX`,
//! - counters via `INCR` + `PEXPIRE`,
//! - indices via `SADD` / `SREM` / `SMEMBERS`,
//! - atomic batches via `MULTI`/`EXEC` pipelines.
//!
//! Requires Redis 6.2+ for `XAUTOCLAIM`. All connections share one
//! multiplexed tokio connection.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tracing::debug;

use cadre_store_core::{KvWrite, StreamEntry, Substrate, SubstrateError};

//─────────────────────────────
//  Driver
//─────────────────────────────

/// Redis-backed substrate.
#[derive(Clone)]
pub struct RedisSubstrate {
    conn: MultiplexedConnection,
}

impl RedisSubstrate {
    /// Connect to the Redis server at `url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SubstrateError::Connection(e.to_string()))
            .context("invalid redis url")?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| SubstrateError::Connection(e.to_string()))
            .context("redis connection failed")?;
        debug!(url, "connected to redis substrate");
        Ok(Self { conn })
    }

    fn command_err(e: redis::RedisError) -> anyhow::Error {
        SubstrateError::Command(e.to_string()).into()
    }
}

//─────────────────────────────
//  Reply parsing
//─────────────────────────────

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse one `[id, [field, value, ...]]` stream entry.
fn parse_entry(value: &Value) -> Result<StreamEntry> {
    let Value::Bulk(parts) = value else {
        return Err(SubstrateError::MalformedReply("stream entry is not an array".into()).into());
    };
    if parts.len() < 2 {
        return Err(SubstrateError::MalformedReply("stream entry too short".into()).into());
    }
    let id = as_string(&parts[0])
        .ok_or_else(|| SubstrateError::MalformedReply("entry id is not a string".into()))?;
    let Value::Bulk(raw_fields) = &parts[1] else {
        return Err(SubstrateError::MalformedReply("entry fields are not an array".into()).into());
    };

    let mut fields = HashMap::new();
    for pair in raw_fields.chunks(2) {
        if let [key, val] = pair {
            if let (Some(key), Some(val)) = (as_string(key), as_string(val)) {
                fields.insert(key, val);
            }
        }
    }
    Ok(StreamEntry { id, fields })
}

/// Parse a `[[id, fields], ...]` list of entries, skipping tombstones.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(items) => items
            .iter()
            .filter(|item| !matches!(item, Value::Nil))
            .map(parse_entry)
            .collect(),
        _ => Err(SubstrateError::MalformedReply("entry list is not an array".into()).into()),
    }
}

/// Parse an `XREADGROUP` reply: `[[stream, [[id, fields], ...]], ...]` or nil.
fn parse_read_reply(value: &Value, stream: &str) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Bulk(streams) => {
            for per_stream in streams {
                let Value::Bulk(parts) = per_stream else { continue };
                if parts.len() < 2 {
                    continue;
                }
                if as_string(&parts[0]).as_deref() == Some(stream) {
                    return parse_entries(&parts[1]);
                }
            }
            Ok(Vec::new())
        }
        _ => Err(SubstrateError::MalformedReply("XREADGROUP reply is not an array".into()).into()),
    }
}

//─────────────────────────────
//  Substrate implementation
//─────────────────────────────

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        cmd.query_async(&mut conn).await.map_err(Self::command_err)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // MKSTREAM creates the stream when absent; BUSYGROUP means the group
        // already exists and is not an error for us.
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::command_err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        parse_read_reply(&reply, stream)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        // Reply is [next-cursor, [[id, fields], ...], [deleted-ids]].
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        match &reply {
            Value::Bulk(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
            Value::Nil => Ok(Vec::new()),
            _ => Err(SubstrateError::MalformedReply("XAUTOCLAIM reply is not an array".into()).into()),
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }

    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (count, _): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(count)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)
    }

    async fn run_batch(&self, ops: Vec<KvWrite>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                KvWrite::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                KvWrite::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvWrite::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                KvWrite::SetRemove { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
            }
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(Self::command_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(values: Vec<Value>) -> Value {
        Value::Bulk(values)
    }

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_a_read_reply() {
        let reply = bulk(vec![bulk(vec![
            data("audit:events"),
            bulk(vec![bulk(vec![
                data("1-0"),
                bulk(vec![data("event"), data("{}")]),
            ])]),
        ])]);

        let entries = parse_read_reply(&reply, "audit:events").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["event"], "{}");
    }

    #[test]
    fn nil_reads_are_empty() {
        assert!(parse_read_reply(&Value::Nil, "audit:events").unwrap().is_empty());
        assert!(parse_entries(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn tombstoned_autoclaim_entries_are_skipped() {
        let entries = parse_entries(&bulk(vec![
            Value::Nil,
            bulk(vec![data("2-0"), bulk(vec![data("event"), data("{}")])]),
        ]))
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "2-0");
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(parse_entry(&data("not-an-entry")).is_err());
        assert!(parse_entries(&data("not-a-list")).is_err());
    }
}
