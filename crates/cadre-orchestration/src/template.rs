//! Deterministic backlog templates.

use serde_json::{json, Value};

use cadre_types::{InitialRequest, ItemType};

//─────────────────────────────
//  Planner contract
//─────────────────────────────

/// One backlog item a planner wants created, before ids are allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedItem {
    /// Kind of work.
    pub item_type: ItemType,
    /// Target worker agent for agent tasks.
    pub agent_target: Option<String>,
    /// Inputs handed to the worker.
    pub work_context: Value,
}

/// Turns an actionable intake request into a backlog template.
///
/// Planners must be deterministic: the same request yields the same items in
/// the same order, so two orchestrators racing on one intake produce
/// equivalent backlogs.
pub trait BacklogPlanner: Send + Sync {
    /// Plan the backlog for `request`. At least one item.
    fn plan(&self, request: &InitialRequest) -> Vec<PlannedItem>;
}

//─────────────────────────────
//  Standard template
//─────────────────────────────

/// One agent task per configured analyst target.
pub struct StandardTemplate {
    agent_targets: Vec<String>,
}

impl Default for StandardTemplate {
    fn default() -> Self {
        Self {
            agent_targets: vec![
                "time_analyst".to_string(),
                "cost_analyst".to_string(),
                "friction_analyst".to_string(),
                "scenario_analyst".to_string(),
            ],
        }
    }
}

impl StandardTemplate {
    /// Template dispatching to the given worker targets, in order.
    pub fn new(agent_targets: Vec<String>) -> Self {
        Self { agent_targets }
    }
}

impl BacklogPlanner for StandardTemplate {
    fn plan(&self, request: &InitialRequest) -> Vec<PlannedItem> {
        self.agent_targets
            .iter()
            .map(|target| PlannedItem {
                item_type: ItemType::AgentTask,
                agent_target: Some(target.clone()),
                work_context: json!({
                    "request_text": request.request_text,
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_template_is_deterministic() {
        let request = InitialRequest {
            project_id: "P1".to_string(),
            request_text: "full audit".to_string(),
        };
        let template = StandardTemplate::default();
        let first = template.plan(&request);
        let second = template.plan(&request);

        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|p| p.item_type == ItemType::AgentTask));
        assert_eq!(first[0].agent_target.as_deref(), Some("time_analyst"));
        assert_eq!(first[0].work_context["request_text"], "full audit");
    }
}
