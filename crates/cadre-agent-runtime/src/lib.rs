#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-agent-runtime** – Worker execution runtime for Cadre.
//!
//! A worker is a consumer loop bound to the group `{agent_target}s` that
//! filters `WORK.ITEM_DISPATCHED` events for its target and drives the
//! per-dispatch protocol:
//!
//! 1. missing required inputs → `CLARIFICATION.NEEDED`, no transition, ack;
//! 2. otherwise `WORK.ITEM_STARTED`, run the agent computation, then
//!    `DELIVERABLE.PUBLISHED` followed by `WORK.ITEM_COMPLETED`;
//! 3. terminal agent failures → `WORK.ITEM_FAILED` with a taxonomy category;
//!    transient ones retry through pending reclaim.
//!
//! Workers never write backlog state; the orchestrator applies every
//! transition from the events they emit.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use cadre_runtime::{
    ConsumerBinding, DlqPublisher, EventHandler, HandlerError, RuntimeConfig, StreamConsumer,
};
use cadre_schema::SchemaRegistry;
use cadre_store_core::Substrate;
use cadre_types::{
    ClarificationNeeded, DeliverablePublished, EventEnvelope, EventPayload, FailureCategory,
    ItemCompleted, ItemDispatched, ItemFailed, ItemStarted,
};

pub mod agents;

pub use agents::HeuristicAnalyst;

//─────────────────────────────
//  Agent contract
//─────────────────────────────

/// Result of one successful agent computation.
#[derive(Debug, Clone)]
pub struct WorkOutput {
    /// The published deliverable object.
    pub deliverable: Value,
    /// Evidence judged by the Definition of Done.
    pub evidence: Value,
}

/// Failure classification for agent computations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Transient failure calling an external collaborator; retried.
    #[error("tool failure: {0}")]
    Tool(String),
    /// The computation exceeded its wall-clock budget; retried.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Internal contradiction; the item fails.
    #[error("reasoning failure: {0}")]
    Reasoning(String),
}

impl AgentError {
    /// Whether the failure should be retried via reclaim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Tool(_) | AgentError::Timeout(_))
    }

    /// Taxonomy bucket for `WORK.ITEM_FAILED`.
    pub fn category(&self) -> FailureCategory {
        match self {
            AgentError::Tool(_) => FailureCategory::Tool,
            AgentError::Timeout(_) => FailureCategory::Timeout,
            AgentError::Reasoning(_) => FailureCategory::Reasoning,
        }
    }
}

/// The agent-specific computation behind one worker.
#[async_trait]
pub trait WorkAgent: Send + Sync {
    /// Agent target this worker serves, e.g. `cost_analyst`.
    fn target(&self) -> &str;

    /// Work-context fields that must be present before work starts.
    fn required_inputs(&self) -> &[&str] {
        &[]
    }

    /// Produce the deliverable and evidence for one dispatch.
    async fn execute(&self, dispatch: &ItemDispatched) -> Result<WorkOutput, AgentError>;
}

//─────────────────────────────
//  Harness
//─────────────────────────────

/// Event-handler adapter driving one agent through the worker protocol.
pub struct WorkerHarness {
    substrate: Arc<dyn Substrate>,
    agent: Arc<dyn WorkAgent>,
    stream: String,
}

impl WorkerHarness {
    /// Wrap `agent` for the main stream configured in `config`.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        agent: Arc<dyn WorkAgent>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            substrate,
            agent,
            stream: config.stream.clone(),
        }
    }

    /// Consumer group for an agent target.
    pub fn group_for(target: &str) -> String {
        format!("{target}s")
    }

    /// Bind this worker into a consumer loop as `consumer_name` within its
    /// target's group.
    pub fn into_consumer(
        self: Arc<Self>,
        registry: Arc<SchemaRegistry>,
        config: &RuntimeConfig,
        consumer_name: &str,
    ) -> StreamConsumer {
        let group = Self::group_for(self.agent.target());
        StreamConsumer::new(
            self.substrate.clone(),
            registry,
            self.clone(),
            DlqPublisher::new(self.substrate.clone(), config.dlq_stream.clone()),
            config.keyspace(),
            ConsumerBinding::new(&config.stream, group, consumer_name),
            config.into(),
        )
    }

    fn missing_inputs(&self, dispatch: &ItemDispatched) -> Vec<String> {
        let context = dispatch.work_context.as_object();
        self.agent
            .required_inputs()
            .iter()
            .filter(|field| {
                context.map_or(true, |object| {
                    object.get(**field).map_or(true, Value::is_null)
                })
            })
            .map(|field| field.to_string())
            .collect()
    }

    async fn emit(&self, payload: EventPayload, trigger: &EventEnvelope) -> Result<()> {
        let envelope = EventEnvelope::build(&payload, self.agent.target()).follows(trigger);
        self.substrate
            .append(&self.stream, &envelope.to_wire_fields())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for WorkerHarness {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _raw_fields: &HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        // Only dispatches for this worker's target are actionable; everything
        // else on the stream is acked without action.
        let event = match EventPayload::from_value(&envelope.event_type, &envelope.payload) {
            Ok(event) => event,
            Err(_) => return Ok(()),
        };
        let EventPayload::ItemDispatched(dispatch) = event else {
            return Ok(());
        };
        if dispatch.agent_target.as_deref() != Some(self.agent.target()) {
            debug!(
                agent_target = dispatch.agent_target.as_deref().unwrap_or("-"),
                "dispatch for another target ignored"
            );
            return Ok(());
        }

        // Emitting is substrate plumbing, not agent computation: an append
        // that fails (a store blip, say) must leave the dispatch pending so
        // reclaim redelivers it, never dead-letter it.
        let retry = |e: anyhow::Error| HandlerError::Retryable(format!("emit failed: {e:#}"));

        let missing = self.missing_inputs(&dispatch);
        if !missing.is_empty() {
            warn!(
                backlog_item_id = %dispatch.backlog_item_id,
                missing = ?missing,
                "required inputs absent, requesting clarification"
            );
            self.emit(
                EventPayload::ClarificationNeeded(ClarificationNeeded {
                    project_id: dispatch.project_id.clone(),
                    backlog_item_id: dispatch.backlog_item_id.clone(),
                    missing_fields: missing,
                }),
                envelope,
            )
            .await
            .map_err(retry)?;
            return Ok(());
        }

        self.emit(
            EventPayload::ItemStarted(ItemStarted {
                project_id: dispatch.project_id.clone(),
                backlog_item_id: dispatch.backlog_item_id.clone(),
            }),
            envelope,
        )
        .await
        .map_err(retry)?;

        match self.agent.execute(&dispatch).await {
            Ok(output) => {
                self.emit(
                    EventPayload::DeliverablePublished(DeliverablePublished {
                        project_id: dispatch.project_id.clone(),
                        backlog_item_id: dispatch.backlog_item_id.clone(),
                        deliverable: output.deliverable,
                    }),
                    envelope,
                )
                .await
                .map_err(retry)?;
                self.emit(
                    EventPayload::ItemCompleted(ItemCompleted {
                        project_id: dispatch.project_id.clone(),
                        backlog_item_id: dispatch.backlog_item_id.clone(),
                        evidence: output.evidence,
                    }),
                    envelope,
                )
                .await
                .map_err(retry)?;
                info!(
                    backlog_item_id = %dispatch.backlog_item_id,
                    agent_target = self.agent.target(),
                    "work item completed"
                );
                Ok(())
            }
            Err(error) if error.is_retryable() => {
                Err(HandlerError::Retryable(error.to_string()))
            }
            Err(error) => {
                warn!(
                    backlog_item_id = %dispatch.backlog_item_id,
                    error = %error,
                    "agent computation failed terminally"
                );
                self.emit(
                    EventPayload::ItemFailed(ItemFailed {
                        project_id: dispatch.project_id.clone(),
                        backlog_item_id: dispatch.backlog_item_id.clone(),
                        reason: error.to_string(),
                        category: error.category(),
                    }),
                    envelope,
                )
                .await
                .map_err(retry)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_store_memory::MemorySubstrate;
    use serde_json::json;
    use cadre_types::ItemType;

    struct StubAgent;

    #[async_trait]
    impl WorkAgent for StubAgent {
        fn target(&self) -> &str {
            "cost_analyst"
        }

        fn required_inputs(&self) -> &[&str] {
            &["request_text", "period"]
        }

        async fn execute(&self, _dispatch: &ItemDispatched) -> Result<WorkOutput, AgentError> {
            Ok(WorkOutput {
                deliverable: json!({"report": {}}),
                evidence: json!({"summary": "ok"}),
            })
        }
    }

    fn harness() -> WorkerHarness {
        WorkerHarness::new(
            Arc::new(MemorySubstrate::new()),
            Arc::new(StubAgent),
            &RuntimeConfig::default(),
        )
    }

    fn dispatch(context: Value) -> ItemDispatched {
        ItemDispatched {
            project_id: "P1".to_string(),
            backlog_item_id: "B1".to_string(),
            item_type: ItemType::AgentTask,
            agent_target: Some("cost_analyst".to_string()),
            work_context: context,
        }
    }

    #[test]
    fn group_name_pluralizes_the_target() {
        assert_eq!(WorkerHarness::group_for("cost_analyst"), "cost_analysts");
    }

    #[test]
    fn missing_inputs_cover_absent_and_null_fields() {
        let harness = harness();
        assert_eq!(
            harness.missing_inputs(&dispatch(json!({"request_text": "audit", "period": null}))),
            vec!["period"]
        );
        assert!(harness
            .missing_inputs(&dispatch(json!({"request_text": "audit", "period": "Q3"})))
            .is_empty());
        assert_eq!(
            harness.missing_inputs(&dispatch(Value::Null)),
            vec!["request_text", "period"]
        );
    }

    #[test]
    fn agent_error_taxonomy() {
        assert!(AgentError::Tool("x".into()).is_retryable());
        assert!(AgentError::Timeout("x".into()).is_retryable());
        assert!(!AgentError::Reasoning("x".into()).is_retryable());
        assert_eq!(
            AgentError::Reasoning("x".into()).category(),
            FailureCategory::Reasoning
        );
    }
}
