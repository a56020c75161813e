//! Typed event payload union.
//!
//! The wire treats payloads as opaque JSON; inside the runtime events are a
//! tagged union keyed by `event_type`. Decoding dispatches on the tag and
//! surfaces a contract error for unknown types, so a mistyped producer can
//! never reach a handler as a half-parsed value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{AnswerType, ItemType};

//─────────────────────────────
//  Payload structs
//─────────────────────────────

/// `PROJECT.INITIAL_REQUEST_RECEIVED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialRequest {
    /// Project the request opens.
    pub project_id: String,
    /// Free-form intake text.
    pub request_text: String,
}

/// `WORK.ITEM_DISPATCHED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDispatched {
    /// Owning project.
    pub project_id: String,
    /// Dispatched backlog item.
    pub backlog_item_id: String,
    /// Item type from the backlog entity.
    pub item_type: ItemType,
    /// Target worker agent, present for agent tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_target: Option<String>,
    /// Opaque per-type work inputs.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub work_context: Value,
}

/// `WORK.ITEM_STARTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStarted {
    /// Owning project.
    pub project_id: String,
    /// Item the worker picked up.
    pub backlog_item_id: String,
}

/// `WORK.ITEM_COMPLETED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCompleted {
    /// Owning project.
    pub project_id: String,
    /// Completed item.
    pub backlog_item_id: String,
    /// Evidence object evaluated by the Definition of Done.
    pub evidence: Value,
}

/// `WORK.ITEM_FAILED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailed {
    /// Owning project.
    pub project_id: String,
    /// Failed item.
    pub backlog_item_id: String,
    /// Human-readable failure reason.
    pub reason: String,
    /// Failure taxonomy bucket.
    pub category: FailureCategory,
}

/// `DELIVERABLE.PUBLISHED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverablePublished {
    /// Owning project.
    pub project_id: String,
    /// Item the deliverable belongs to.
    pub backlog_item_id: String,
    /// The deliverable object.
    pub deliverable: Value,
}

/// `QUESTION.CREATED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCreated {
    /// Owning project.
    pub project_id: String,
    /// Newly allocated question id.
    pub question_id: String,
    /// Item blocked by the question.
    pub backlog_item_id: String,
    /// Question presented to the human.
    pub question_text: String,
    /// Expected shape of the answer.
    pub expected_answer_type: AnswerType,
}

/// `CLARIFICATION.NEEDED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationNeeded {
    /// Owning project.
    pub project_id: String,
    /// Item that cannot proceed.
    pub backlog_item_id: String,
    /// Names of the absent required inputs.
    pub missing_fields: Vec<String>,
}

/// `USER.ANSWER_SUBMITTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmitted {
    /// Owning project.
    pub project_id: String,
    /// Question being answered.
    pub question_id: String,
    /// Raw answer value as submitted.
    pub answer: Value,
}

/// `BACKLOG.ITEM_UNBLOCKED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUnblocked {
    /// Owning project.
    pub project_id: String,
    /// Item returned to READY.
    pub backlog_item_id: String,
}

//─────────────────────────────
//  Failure taxonomy
//─────────────────────────────

/// Failure taxonomy used in `WORK.ITEM_FAILED.category` and DLQ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Envelope or payload schema violation.
    Contract,
    /// Unparseable raw entry.
    Decode,
    /// Required inputs absent from the work context.
    DataInsufficiency,
    /// Transient failure calling an external collaborator.
    Tool,
    /// Internal contradiction detected by a DoD or sanity check.
    Reasoning,
    /// State machine rejected a status change.
    IllegalTransition,
    /// Handler exceeded its wall-clock budget.
    Timeout,
    /// Retried to exhaustion.
    MaxAttempts,
}

//─────────────────────────────
//  Tagged union
//─────────────────────────────

/// Typed union over every event payload the core understands.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A new intake request opened a project.
    InitialRequestReceived(InitialRequest),
    /// The orchestrator dispatched a READY backlog item.
    ItemDispatched(ItemDispatched),
    /// A worker picked up a dispatch.
    ItemStarted(ItemStarted),
    /// A worker finished an item and published evidence.
    ItemCompleted(ItemCompleted),
    /// A worker gave up on an item.
    ItemFailed(ItemFailed),
    /// A worker published a deliverable.
    DeliverablePublished(DeliverablePublished),
    /// The orchestrator opened a clarification question.
    QuestionCreated(QuestionCreated),
    /// An item cannot proceed without more input.
    ClarificationNeeded(ClarificationNeeded),
    /// A human answered an open question.
    AnswerSubmitted(AnswerSubmitted),
    /// A blocked item returned to READY.
    ItemUnblocked(ItemUnblocked),
}

macro_rules! event_types {
    ($( $variant:ident => $tag:literal ),+ $(,)?) => {
        impl EventPayload {
            /// Dotted `event_type` tag for this payload.
            pub fn event_type(&self) -> &'static str {
                match self {
                    $( EventPayload::$variant(_) => $tag, )+
                }
            }

            /// All event types the core understands, in wire-tag form.
            pub fn known_types() -> &'static [&'static str] {
                &[ $( $tag, )+ ]
            }

            /// Decode a payload value against the schema implied by `event_type`.
            pub fn from_value(event_type: &str, payload: &Value) -> Result<Self, ContractError> {
                match event_type {
                    $(
                        $tag => serde_json::from_value(payload.clone())
                            .map(EventPayload::$variant)
                            .map_err(|e| ContractError::InvalidPayload {
                                event_type: event_type.to_string(),
                                message: e.to_string(),
                            }),
                    )+
                    other => Err(ContractError::UnknownType(other.to_string())),
                }
            }
        }
    };
}

event_types! {
    InitialRequestReceived => "PROJECT.INITIAL_REQUEST_RECEIVED",
    ItemDispatched => "WORK.ITEM_DISPATCHED",
    ItemStarted => "WORK.ITEM_STARTED",
    ItemCompleted => "WORK.ITEM_COMPLETED",
    ItemFailed => "WORK.ITEM_FAILED",
    DeliverablePublished => "DELIVERABLE.PUBLISHED",
    QuestionCreated => "QUESTION.CREATED",
    ClarificationNeeded => "CLARIFICATION.NEEDED",
    AnswerSubmitted => "USER.ANSWER_SUBMITTED",
    ItemUnblocked => "BACKLOG.ITEM_UNBLOCKED",
}

impl EventPayload {
    /// Serialize the payload to its wire JSON object.
    pub fn to_value(&self) -> Value {
        match self {
            EventPayload::InitialRequestReceived(p) => serde_json::to_value(p),
            EventPayload::ItemDispatched(p) => serde_json::to_value(p),
            EventPayload::ItemStarted(p) => serde_json::to_value(p),
            EventPayload::ItemCompleted(p) => serde_json::to_value(p),
            EventPayload::ItemFailed(p) => serde_json::to_value(p),
            EventPayload::DeliverablePublished(p) => serde_json::to_value(p),
            EventPayload::QuestionCreated(p) => serde_json::to_value(p),
            EventPayload::ClarificationNeeded(p) => serde_json::to_value(p),
            EventPayload::AnswerSubmitted(p) => serde_json::to_value(p),
            EventPayload::ItemUnblocked(p) => serde_json::to_value(p),
        }
        .expect("payload serializes")
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Contract violations raised while decoding typed payloads.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContractError {
    /// The event type is not part of the core contract.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// The payload does not match the shape for its event type.
    #[error("invalid payload for {event_type}: {message}")]
    InvalidPayload {
        /// Event type whose shape was expected.
        event_type: String,
        /// Underlying decode failure.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_round_trips_through_the_tag() {
        let event = EventPayload::ItemDispatched(ItemDispatched {
            project_id: "P1".to_string(),
            backlog_item_id: "B1".to_string(),
            item_type: ItemType::AgentTask,
            agent_target: Some("cost_analyst".to_string()),
            work_context: json!({"scope": "full"}),
        });

        let value = event.to_value();
        assert_eq!(value["item_type"], "AGENT_TASK");

        let decoded = EventPayload::from_value(event.event_type(), &value).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_type_is_a_contract_error() {
        let err = EventPayload::from_value("WORK.UNHEARD_OF", &json!({})).unwrap_err();
        assert_eq!(err, ContractError::UnknownType("WORK.UNHEARD_OF".to_string()));
    }

    #[test]
    fn missing_required_field_is_a_contract_error() {
        let err =
            EventPayload::from_value("WORK.ITEM_STARTED", &json!({"project_id": "P1"}))
                .unwrap_err();
        assert!(matches!(err, ContractError::InvalidPayload { .. }));
    }

    #[test]
    fn failure_category_uses_snake_case_tags() {
        assert_eq!(
            serde_json::to_value(FailureCategory::DataInsufficiency).unwrap(),
            json!("data_insufficiency")
        );
        assert_eq!(
            serde_json::to_value(FailureCategory::MaxAttempts).unwrap(),
            json!("max_attempts")
        );
    }

    #[test]
    fn known_types_covers_the_contract() {
        assert_eq!(EventPayload::known_types().len(), 10);
        assert!(EventPayload::known_types().contains(&"USER.ANSWER_SUBMITTED"));
    }
}
