//! Dead-letter publishing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::warn;

use cadre_store_core::Substrate;
use cadre_types::WIRE_EVENT_FIELD;

/// Name of the stream entry field carrying a DLQ record.
pub const WIRE_DLQ_FIELD: &str = "dlq";

/// Appends quarantine records to the dead-letter stream.
///
/// A record preserves the original raw fields verbatim plus best-effort
/// metadata extracted from them. Publishing never rejects caller input;
/// only substrate failures surface as errors.
#[derive(Clone)]
pub struct DlqPublisher {
    substrate: Arc<dyn Substrate>,
    dlq_stream: String,
}

impl DlqPublisher {
    /// Create a publisher targeting `dlq_stream`.
    pub fn new(substrate: Arc<dyn Substrate>, dlq_stream: impl Into<String>) -> Self {
        Self {
            substrate,
            dlq_stream: dlq_stream.into(),
        }
    }

    /// Quarantine `original_fields` with the given reason.
    ///
    /// Returns the DLQ entry id.
    pub async fn publish(
        &self,
        reason: &str,
        original_fields: &HashMap<String, String>,
        schema_id: Option<&str>,
    ) -> Result<String> {
        let mut record = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "reason": reason,
            "original_fields": original_fields,
        });

        if let Some(schema_id) = schema_id {
            record["schema_id"] = json!(schema_id);
        }

        // Best effort: surface the envelope and its identity when the raw
        // `event` field still parses.
        if let Some(parsed) = original_fields
            .get(WIRE_EVENT_FIELD)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        {
            if let Some(event_id) = parsed.get("event_id").and_then(Value::as_str) {
                record["event_id"] = json!(event_id);
            }
            if let Some(event_type) = parsed.get("event_type").and_then(Value::as_str) {
                record["event_type"] = json!(event_type);
            }
            record["original_event"] = parsed;
        }

        let entry_id = self
            .substrate
            .append(
                &self.dlq_stream,
                &[(WIRE_DLQ_FIELD.to_string(), record.to_string())],
            )
            .await?;
        warn!(
            reason,
            schema_id = schema_id.unwrap_or(""),
            entry_id = %entry_id,
            "entry dead-lettered"
        );
        Ok(entry_id)
    }
}
