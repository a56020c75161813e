//! The validator service.
//!
//! A consumer loop on the main stream whose handler does nothing: the shared
//! pipeline already decodes, validates and dead-letters, so a distinct group
//! surfaces every contract violation regardless of which other groups
//! process the event. The validator neither locks nor mutates stores.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cadre_schema::SchemaRegistry;
use cadre_store_core::Substrate;
use cadre_types::EventEnvelope;

use crate::consumer::{ConsumerBinding, EventHandler, HandlerError, StreamConsumer};
use crate::dlq::DlqPublisher;
use crate::{RuntimeConfig, VALIDATOR_GROUP};

struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        _raw_fields: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Contract-surfacing service over the main stream.
pub struct Validator {
    consumer: StreamConsumer,
}

impl Validator {
    /// Build the validator for `config`, joining the `validators` group.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        registry: Arc<SchemaRegistry>,
        config: &RuntimeConfig,
    ) -> Self {
        let consumer = StreamConsumer::new(
            substrate.clone(),
            registry,
            Arc::new(NoopHandler),
            DlqPublisher::new(substrate, config.dlq_stream.clone()),
            config.keyspace(),
            ConsumerBinding::new(&config.stream, VALIDATOR_GROUP, &config.consumer),
            config.into(),
        );
        Self { consumer }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.consumer.run(cancel).await
    }

    /// One non-blocking pass, for tests.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        self.consumer.poll_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_store_memory::MemorySubstrate;
    use cadre_types::{EventPayload, ItemStarted};
    use serde_json::Value;

    fn registry() -> Arc<SchemaRegistry> {
        let dir = format!("{}/../../schemas", env!("CARGO_MANIFEST_DIR"));
        Arc::new(SchemaRegistry::load(dir).unwrap())
    }

    #[tokio::test]
    async fn rejected_entries_are_quarantined_with_their_fields() {
        let substrate = Arc::new(MemorySubstrate::new());
        let config = RuntimeConfig::default();
        let validator = Validator::new(substrate.clone(), registry(), &config);

        // One valid event, one broken one.
        let valid = EventEnvelope::build(
            &EventPayload::ItemStarted(ItemStarted {
                project_id: "P1".to_string(),
                backlog_item_id: "B1".to_string(),
            }),
            "worker",
        );
        substrate
            .append(&config.stream, &valid.to_wire_fields())
            .await
            .unwrap();
        substrate
            .append(
                &config.stream,
                &[("event".to_string(), "{not json".to_string())],
            )
            .await
            .unwrap();

        validator.poll_once().await.unwrap();

        let dlq = substrate.entries(&config.dlq_stream).await;
        assert_eq!(dlq.len(), 1);
        let record: Value = serde_json::from_str(&dlq[0].fields["dlq"]).unwrap();
        assert_eq!(record["reason"], "envelope_decode");
        assert_eq!(record["original_fields"]["event"], "{not json");

        // Both entries acked; the validator touched no other state.
        assert_eq!(substrate.pending_count(&config.stream, VALIDATOR_GROUP).await, 0);
    }
}
