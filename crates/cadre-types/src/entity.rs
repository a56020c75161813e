//! Backlog and clarification entities.
//!
//! These are the persisted documents owned by the backlog and question
//! stores. The structs here define their canonical JSON shape; storage key
//! layout lives with the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::ItemStatus;

//─────────────────────────────
//  Backlog item
//─────────────────────────────

/// Kind of work a backlog item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    /// Untargeted task handled outside the worker fleet.
    GenericTask,
    /// Task dispatched to a specific worker agent.
    AgentTask,
}

/// Unit of work owned by a project.
///
/// Status transitions go through the state machine only; the item itself is
/// never deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogItem {
    /// Owning project.
    pub project_id: String,
    /// Unique item identifier.
    pub item_id: String,
    /// Kind of work.
    pub item_type: ItemType,
    /// Target worker agent; required for agent tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_target: Option<String>,
    /// Current lifecycle status.
    pub status: ItemStatus,
    /// Opaque per-type inputs handed to the worker.
    #[serde(default)]
    pub work_context: Value,
    /// Evidence accumulated by completion.
    #[serde(default)]
    pub evidence: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl BacklogItem {
    /// Create a fresh item in the given status.
    pub fn new(
        project_id: impl Into<String>,
        item_id: impl Into<String>,
        item_type: ItemType,
        status: ItemStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            item_id: item_id.into(),
            item_type,
            agent_target: None,
            status,
            work_context: Value::Null,
            evidence: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the worker agent target.
    pub fn with_agent_target(mut self, target: impl Into<String>) -> Self {
        self.agent_target = Some(target.into());
        self
    }

    /// Set the work context object.
    pub fn with_work_context(mut self, ctx: Value) -> Self {
        self.work_context = ctx;
        self
    }
}

//─────────────────────────────
//  Clarification question
//─────────────────────────────

/// Expected shape of a clarification answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerType {
    /// Free-form text.
    Text,
    /// A numeric value.
    Number,
    /// One of a fixed set of options.
    Choice,
}

impl AnswerType {
    /// Normalize a raw submitted answer into its stored form.
    ///
    /// Text and choice answers normalize to trimmed strings; numeric answers
    /// accept JSON numbers or numeric strings.
    pub fn normalize(self, raw: &Value) -> Result<Value, AnswerError> {
        match self {
            AnswerType::Text | AnswerType::Choice => match raw {
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        Err(AnswerError::Empty)
                    } else {
                        Ok(Value::String(trimmed.to_string()))
                    }
                }
                other => Ok(Value::String(other.to_string())),
            },
            AnswerType::Number => match raw {
                Value::Number(n) => Ok(Value::Number(n.clone())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| AnswerError::NotANumber(s.clone())),
                other => Err(AnswerError::NotANumber(other.to_string())),
            },
        }
    }
}

/// Question status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    /// Awaiting an answer; present in the open index.
    Open,
    /// Answered or withdrawn; removed from the open index.
    Closed,
}

/// A clarification question blocking one backlog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// Owning project.
    pub project_id: String,
    /// Unique question identifier.
    pub question_id: String,
    /// Item blocked by this question.
    pub backlog_item_id: String,
    /// Question presented to the human.
    pub question_text: String,
    /// Expected answer shape.
    pub expected_answer_type: AnswerType,
    /// Open or closed.
    pub status: QuestionStatus,
    /// Workflow correlation id the answer must rejoin.
    pub correlation_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Rejections produced while normalizing an answer.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AnswerError {
    /// The answer was blank.
    #[error("answer is empty")]
    Empty,
    /// A numeric answer could not be parsed.
    #[error("not a number: {0}")]
    NotANumber(String),
}
