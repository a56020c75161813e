//! Reference agents.
//!
//! The runtime treats agent arithmetic as opaque; these implementations
//! exist so a deployment has something to run out of the box and so the
//! scenario tests exercise the full protocol with realistic shapes.

use async_trait::async_trait;
use serde_json::json;

use cadre_types::ItemDispatched;

use crate::{AgentError, WorkAgent, WorkOutput};

/// Deterministic text-review agent.
///
/// Requires `request_text` in the work context and produces a small report
/// plus the `summary` evidence the standard Definition of Done expects.
pub struct HeuristicAnalyst {
    target: String,
}

impl HeuristicAnalyst {
    /// Analyst serving the given agent target.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl WorkAgent for HeuristicAnalyst {
    fn target(&self) -> &str {
        &self.target
    }

    fn required_inputs(&self) -> &[&str] {
        &["request_text"]
    }

    async fn execute(&self, dispatch: &ItemDispatched) -> Result<WorkOutput, AgentError> {
        let request_text = dispatch
            .work_context
            .get("request_text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Reasoning("request_text is not a string".to_string()))?;

        let word_count = request_text.split_whitespace().count();
        let excerpt: String = request_text.chars().take(120).collect();

        Ok(WorkOutput {
            deliverable: json!({
                "report": {
                    "analyst": self.target,
                    "request_excerpt": excerpt,
                    "word_count": word_count,
                }
            }),
            evidence: json!({
                "summary": format!("{} reviewed a {}-word request", self.target, word_count),
                "word_count": word_count,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::ItemType;

    #[tokio::test]
    async fn produces_summary_evidence() {
        let agent = HeuristicAnalyst::new("cost_analyst");
        let output = agent
            .execute(&ItemDispatched {
                project_id: "P1".to_string(),
                backlog_item_id: "B1".to_string(),
                item_type: ItemType::AgentTask,
                agent_target: Some("cost_analyst".to_string()),
                work_context: json!({"request_text": "full audit of onboarding"}),
            })
            .await
            .unwrap();

        assert_eq!(output.evidence["word_count"], 4);
        assert!(output.evidence["summary"].as_str().unwrap().contains("cost_analyst"));
        assert_eq!(output.deliverable["report"]["word_count"], 4);
    }

    #[tokio::test]
    async fn non_string_request_is_a_reasoning_failure() {
        let agent = HeuristicAnalyst::new("cost_analyst");
        let err = agent
            .execute(&ItemDispatched {
                project_id: "P1".to_string(),
                backlog_item_id: "B1".to_string(),
                item_type: ItemType::AgentTask,
                agent_target: Some("cost_analyst".to_string()),
                work_context: json!({"request_text": 7}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Reasoning(_)));
    }
}
