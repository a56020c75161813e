//! Definition-of-Done evaluation.
//!
//! One pluggable component decides what happens to an item whose worker
//! reported completion. The evaluator sees the item and the submitted
//! evidence and returns a verdict; the orchestrator applies the matching
//! transition.

use serde_json::Value;

use cadre_types::{BacklogItem, ItemType};

//─────────────────────────────
//  Evaluator contract
//─────────────────────────────

/// Outcome of a Definition-of-Done check.
#[derive(Debug, Clone, PartialEq)]
pub enum DodVerdict {
    /// Evidence is sufficient; the item is done.
    Done,
    /// Evidence is incomplete; block the item and ask for the named fields.
    Blocked {
        /// Evidence keys still missing.
        missing_fields: Vec<String>,
    },
    /// Evidence reveals the work is unusable; fail the item.
    Failed {
        /// Why the evidence was rejected.
        reason: String,
    },
}

/// Per-item-type predicate over completion evidence.
pub trait DodEvaluator: Send + Sync {
    /// Judge `evidence` for `item`.
    fn evaluate(&self, item: &BacklogItem, evidence: &Value) -> DodVerdict;
}

//─────────────────────────────
//  Standard evaluator
//─────────────────────────────

/// Evidence-key evaluator.
///
/// Agent tasks must report a `summary`; any evidence carrying an `error`
/// marker is treated as an internal contradiction and fails the item.
#[derive(Debug, Default)]
pub struct RequiredEvidenceDod;

impl DodEvaluator for RequiredEvidenceDod {
    fn evaluate(&self, item: &BacklogItem, evidence: &Value) -> DodVerdict {
        let Some(object) = evidence.as_object() else {
            return DodVerdict::Failed {
                reason: "evidence is not an object".to_string(),
            };
        };
        if let Some(error) = object.get("error") {
            return DodVerdict::Failed {
                reason: format!("worker reported an error in evidence: {error}"),
            };
        }

        let required: &[&str] = match item.item_type {
            ItemType::AgentTask => &["summary"],
            ItemType::GenericTask => &[],
        };
        let missing: Vec<String> = required
            .iter()
            .filter(|key| !object.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if missing.is_empty() {
            DodVerdict::Done
        } else {
            DodVerdict::Blocked {
                missing_fields: missing,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::ItemStatus;
    use serde_json::json;

    fn agent_item() -> BacklogItem {
        BacklogItem::new("P1", "B1", ItemType::AgentTask, ItemStatus::InProgress)
    }

    #[test]
    fn summary_satisfies_an_agent_task() {
        let verdict = RequiredEvidenceDod.evaluate(&agent_item(), &json!({"summary": "done"}));
        assert_eq!(verdict, DodVerdict::Done);
    }

    #[test]
    fn missing_summary_blocks() {
        let verdict = RequiredEvidenceDod.evaluate(&agent_item(), &json!({"notes": "partial"}));
        assert_eq!(
            verdict,
            DodVerdict::Blocked {
                missing_fields: vec!["summary".to_string()]
            }
        );
    }

    #[test]
    fn error_marker_fails() {
        let verdict =
            RequiredEvidenceDod.evaluate(&agent_item(), &json!({"error": "contradiction"}));
        assert!(matches!(verdict, DodVerdict::Failed { .. }));
    }

    #[test]
    fn generic_tasks_accept_any_object() {
        let item = BacklogItem::new("P1", "B1", ItemType::GenericTask, ItemStatus::InProgress);
        assert_eq!(RequiredEvidenceDod.evaluate(&item, &json!({})), DodVerdict::Done);
    }
}
