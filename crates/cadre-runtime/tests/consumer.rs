//! End-to-end behavior of the reliable consumer loop over the in-memory
//! substrate: dead-lettering of contract violations, duplicate absorption,
//! and retry-until-exhaustion through pending reclaim.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use cadre_runtime::{
    ConsumerBinding, ConsumerOptions, DlqPublisher, EventHandler, HandlerError, StreamConsumer,
};
use cadre_schema::SchemaRegistry;
use cadre_store_core::{KeySpace, Substrate};
use cadre_store_memory::MemorySubstrate;
use cadre_types::{EventEnvelope, EventPayload, ItemStarted, WIRE_EVENT_FIELD};

const STREAM: &str = "audit:events";
const DLQ: &str = "audit:dlq";

fn schemas_dir() -> String {
    format!("{}/../../schemas", env!("CARGO_MANIFEST_DIR"))
}

fn options(max_attempts: u64) -> ConsumerOptions {
    ConsumerOptions {
        read_count: 16,
        block: Duration::ZERO,
        idle_reclaim: Duration::from_secs(60),
        pending_reclaim_count: 16,
        max_attempts,
        dedupe_ttl: Duration::from_secs(86_400),
        handler_timeout: None,
    }
}

/// Handler that counts invocations and fails a configurable number of times.
struct ScriptedHandler {
    calls: AtomicUsize,
    failures: usize,
}

impl ScriptedHandler {
    fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: 0,
        }
    }

    fn failing_forever() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        _raw_fields: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::Retryable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

fn consumer(
    substrate: Arc<MemorySubstrate>,
    handler: Arc<ScriptedHandler>,
    max_attempts: u64,
) -> StreamConsumer {
    let registry = Arc::new(SchemaRegistry::load(schemas_dir()).unwrap());
    StreamConsumer::new(
        substrate.clone(),
        registry,
        handler,
        DlqPublisher::new(substrate, DLQ),
        KeySpace::default(),
        ConsumerBinding::new(STREAM, "workers", "worker-1"),
        options(max_attempts),
    )
}

fn started_event() -> EventEnvelope {
    EventEnvelope::build(
        &EventPayload::ItemStarted(ItemStarted {
            project_id: "P1".to_string(),
            backlog_item_id: "B1".to_string(),
        }),
        "test",
    )
}

async fn dlq_records(substrate: &MemorySubstrate) -> Vec<Value> {
    substrate
        .entries(DLQ)
        .await
        .iter()
        .map(|e| serde_json::from_str(&e.fields["dlq"]).unwrap())
        .collect()
}

#[tokio::test]
async fn valid_entry_reaches_the_handler_once_and_acks() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler::succeeding());
    let consumer = consumer(substrate.clone(), handler.clone(), 5);

    substrate
        .append(STREAM, &started_event().to_wire_fields())
        .await
        .unwrap();

    assert_eq!(consumer.poll_once().await.unwrap(), 1);
    assert_eq!(handler.calls(), 1);
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 0);
    assert!(dlq_records(&substrate).await.is_empty());
}

#[tokio::test]
async fn unparseable_entry_is_dead_lettered_without_side_effects() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler::succeeding());
    let consumer = consumer(substrate.clone(), handler.clone(), 5);

    substrate
        .append(
            STREAM,
            &[(WIRE_EVENT_FIELD.to_string(), "{not json".to_string())],
        )
        .await
        .unwrap();

    consumer.poll_once().await.unwrap();

    assert_eq!(handler.calls(), 0);
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 0);

    let records = dlq_records(&substrate).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["reason"], "envelope_decode");
    assert_eq!(records[0]["original_fields"][WIRE_EVENT_FIELD], "{not json");
}

#[tokio::test]
async fn schema_violation_records_the_schema_id() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler::succeeding());
    let consumer = consumer(substrate.clone(), handler.clone(), 5);

    // Required backlog_item_id removed after building, so the envelope is
    // fine but the payload violates its schema.
    let mut envelope = started_event();
    envelope.payload = serde_json::json!({"project_id": "P1"});
    substrate
        .append(STREAM, &envelope.to_wire_fields())
        .await
        .unwrap();

    consumer.poll_once().await.unwrap();

    assert_eq!(handler.calls(), 0);
    let records = dlq_records(&substrate).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["reason"], "payload_validation");
    assert!(records[0]["schema_id"]
        .as_str()
        .unwrap()
        .contains("item_started"));
    assert_eq!(records[0]["event_id"], envelope.event_id.as_str());
}

#[tokio::test]
async fn replayed_event_id_is_absorbed() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler::succeeding());
    let consumer = consumer(substrate.clone(), handler.clone(), 5);

    let envelope = started_event();
    substrate
        .append(STREAM, &envelope.to_wire_fields())
        .await
        .unwrap();
    substrate
        .append(STREAM, &envelope.to_wire_fields())
        .await
        .unwrap();

    consumer.poll_once().await.unwrap();

    // Both deliveries acked, one handler invocation.
    assert_eq!(handler.calls(), 1);
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 0);
    assert!(dlq_records(&substrate).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_reclaim_until_the_attempt_budget_dead_letters() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler::failing_forever());
    let max_attempts = 3;
    let consumer = consumer(substrate.clone(), handler.clone(), max_attempts);

    substrate
        .append(STREAM, &started_event().to_wire_fields())
        .await
        .unwrap();

    // First delivery fails; the entry stays pending.
    consumer.poll_once().await.unwrap();
    assert_eq!(handler.calls(), 1);
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 1);

    // Each reclaim is a fresh attempt; the attempt that reaches the budget
    // is the one that dead-letters.
    for attempt in 2..=max_attempts as usize {
        tokio::time::advance(Duration::from_secs(60)).await;
        consumer.poll_once().await.unwrap();
        assert_eq!(handler.calls(), attempt);
    }

    let records = dlq_records(&substrate).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["reason"], "max_attempts_exhausted");
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 0);

    // Nothing further happens once the entry is gone.
    tokio::time::advance(Duration::from_secs(60)).await;
    consumer.poll_once().await.unwrap();
    assert_eq!(handler.calls(), max_attempts as usize);
}

/// Handler that hangs far past any reasonable budget.
struct StallingHandler;

#[async_trait]
impl EventHandler for StallingHandler {
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        _raw_fields: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_counts_as_a_transient_failure() {
    let substrate = Arc::new(MemorySubstrate::new());
    let registry = Arc::new(SchemaRegistry::load(schemas_dir()).unwrap());
    let consumer = StreamConsumer::new(
        substrate.clone(),
        registry,
        Arc::new(StallingHandler),
        DlqPublisher::new(substrate.clone(), DLQ),
        KeySpace::default(),
        ConsumerBinding::new(STREAM, "workers", "worker-1"),
        ConsumerOptions {
            handler_timeout: Some(Duration::from_secs(1)),
            ..options(5)
        },
    );

    substrate
        .append(STREAM, &started_event().to_wire_fields())
        .await
        .unwrap();

    consumer.poll_once().await.unwrap();

    // No ack: the entry stays pending for reclaim, nothing dead-lettered.
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 1);
    assert!(dlq_records(&substrate).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_recovery_acks_without_dead_lettering() {
    let substrate = Arc::new(MemorySubstrate::new());
    let handler = Arc::new(ScriptedHandler {
        calls: AtomicUsize::new(0),
        failures: 1,
    });
    let consumer = consumer(substrate.clone(), handler.clone(), 5);

    substrate
        .append(STREAM, &started_event().to_wire_fields())
        .await
        .unwrap();

    consumer.poll_once().await.unwrap();
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    consumer.poll_once().await.unwrap();

    assert_eq!(handler.calls(), 2);
    assert_eq!(substrate.pending_count(STREAM, "workers").await, 0);
    assert!(dlq_records(&substrate).await.is_empty());
}
