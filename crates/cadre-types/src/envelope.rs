//! Canonical event envelope and its wire codec.
//!
//! Every message on the main stream is a single stream field named `event`
//! whose value is the UTF-8 JSON encoding of an [`EventEnvelope`]. Decoding
//! tolerates extra fields on the stream entry; producers other than Cadre may
//! attach their own metadata alongside `event`.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventPayload;
use crate::MAX_WIRE_EVENT_LEN;

/// Name of the stream entry field carrying the JSON-encoded envelope.
pub const WIRE_EVENT_FIELD: &str = "event";

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// Canonical wrapper for every event on the main stream.
///
/// All fields except `payload` and `causation_id` are required on the wire.
/// `correlation_id` ties together every event of one business workflow and is
/// propagated unchanged; `causation_id` is the `event_id` whose processing
/// emitted this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique, opaque event identifier.
    pub event_id: String,
    /// Dotted event type identifier, e.g. `WORK.ITEM_DISPATCHED`.
    pub event_type: String,
    /// Payload schema version.
    #[serde(default = "default_event_version")]
    pub event_version: u32,
    /// Commit wall-clock time (UTC, seconds precision on the wire).
    #[serde(with = "rfc3339_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Producer tag.
    pub source: String,
    /// Producer instance tag; defaults to `source`.
    pub instance: String,
    /// Workflow correlation identifier.
    pub correlation_id: String,
    /// Event id that caused this one, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Event payload; schema chosen by `event_type`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_event_version() -> u32 {
    1
}

impl EventEnvelope {
    /// Build an envelope for `event` with a fresh `event_id`, the current
    /// timestamp and a generated correlation id.
    pub fn build(event: &EventPayload, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event.event_type().to_string(),
            event_version: 1,
            timestamp: truncate_to_seconds(Utc::now()),
            instance: source.clone(),
            source,
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            payload: event.to_value(),
        }
    }

    /// Propagate workflow lineage from `parent`: same correlation id,
    /// causation set to the parent's event id.
    pub fn follows(mut self, parent: &EventEnvelope) -> Self {
        self.correlation_id = parent.correlation_id.clone();
        self.causation_id = Some(parent.event_id.clone());
        self
    }

    /// Override the correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Override the causation id.
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Override the producer instance tag.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Serialize to the on-the-wire form: a single `event` field.
    pub fn to_wire_fields(&self) -> Vec<(String, String)> {
        // Envelope serialization cannot fail: every field is a plain value.
        let encoded = serde_json::to_string(self).expect("envelope serializes");
        vec![(WIRE_EVENT_FIELD.to_string(), encoded)]
    }

    /// Parse an envelope out of raw stream entry fields.
    ///
    /// Extra fields on the entry are ignored.
    pub fn decode(raw_fields: &HashMap<String, String>) -> Result<Self, DecodeError> {
        let raw = raw_fields
            .get(WIRE_EVENT_FIELD)
            .ok_or(DecodeError::MissingEventField)?;
        if raw.len() > MAX_WIRE_EVENT_LEN {
            return Err(DecodeError::Oversized(raw.len()));
        }
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))
    }

    /// Serialize the envelope to a JSON value (as validated by the schema
    /// registry).
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("envelope serializes")
    }
}

/// Drop sub-second precision so the wire form round-trips exactly.
fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

//─────────────────────────────
//  Timestamp codec
//─────────────────────────────

mod rfc3339_seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced while decoding a raw stream entry into an envelope.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    /// The entry has no `event` field.
    #[error("stream entry has no `event` field")]
    MissingEventField,
    /// The `event` field is not valid JSON for an envelope.
    #[error("invalid envelope JSON: {0}")]
    InvalidJson(String),
    /// The `event` field exceeds the decoding size bound.
    #[error("wire event field too large: {0} bytes")]
    Oversized(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InitialRequest;

    fn sample_event() -> EventPayload {
        EventPayload::InitialRequestReceived(InitialRequest {
            project_id: "P1".to_string(),
            request_text: "full audit".to_string(),
        })
    }

    #[test]
    fn build_defaults_instance_to_source() {
        let env = EventEnvelope::build(&sample_event(), "gateway");
        assert_eq!(env.source, "gateway");
        assert_eq!(env.instance, "gateway");
        assert_eq!(env.event_version, 1);
        assert_eq!(env.event_type, "PROJECT.INITIAL_REQUEST_RECEIVED");
        assert!(!env.correlation_id.is_empty());
        assert!(env.causation_id.is_none());
    }

    #[test]
    fn wire_round_trip_preserves_lineage() {
        let parent = EventEnvelope::build(&sample_event(), "gateway");
        let env = EventEnvelope::build(&sample_event(), "orchestrator").follows(&parent);

        let fields: HashMap<String, String> = env.to_wire_fields().into_iter().collect();
        let decoded = EventEnvelope::decode(&fields).unwrap();

        assert_eq!(decoded, env);
        assert_eq!(decoded.correlation_id, parent.correlation_id);
        assert_eq!(decoded.causation_id.as_deref(), Some(parent.event_id.as_str()));
        assert_ne!(decoded.event_id, parent.event_id);
        assert!(decoded.timestamp >= parent.timestamp);
    }

    #[test]
    fn decode_tolerates_extra_fields() {
        let env = EventEnvelope::build(&sample_event(), "gateway");
        let mut fields: HashMap<String, String> = env.to_wire_fields().into_iter().collect();
        fields.insert("trace".to_string(), "abc123".to_string());

        assert_eq!(EventEnvelope::decode(&fields).unwrap(), env);
    }

    #[test]
    fn decode_rejects_missing_and_malformed() {
        let empty = HashMap::new();
        assert_eq!(
            EventEnvelope::decode(&empty),
            Err(DecodeError::MissingEventField)
        );

        let mut broken = HashMap::new();
        broken.insert(WIRE_EVENT_FIELD.to_string(), "{not json".to_string());
        assert!(matches!(
            EventEnvelope::decode(&broken),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn timestamp_is_seconds_precision_on_the_wire() {
        let env = EventEnvelope::build(&sample_event(), "gateway");
        let value = env.to_value();
        let raw = value["timestamp"].as_str().unwrap();
        assert!(!raw.contains('.'), "unexpected sub-second precision: {raw}");
    }
}
