//! Canonical key layout.
//!
//! Every persisted key the core touches is derived here so the layout has a
//! single source of truth. The prefix is configurable per deployment.

/// Key builder rooted at a configurable prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    idempotence_prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("cadre", "cadre:idempotence")
    }
}

impl KeySpace {
    /// Create a key space rooted at `prefix`, with a separate prefix for
    /// idempotence markers.
    pub fn new(prefix: impl Into<String>, idempotence_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            idempotence_prefix: idempotence_prefix.into(),
        }
    }

    /// Backlog item document.
    pub fn backlog_item(&self, project_id: &str, item_id: &str) -> String {
        format!("{}:backlog:{project_id}:{item_id}", self.prefix)
    }

    /// All-items index for a project.
    pub fn backlog_index(&self, project_id: &str) -> String {
        format!("{}:backlog_index:{project_id}", self.prefix)
    }

    /// Per-status index for a project.
    pub fn backlog_status(&self, project_id: &str, status: &str) -> String {
        format!("{}:backlog_status:{project_id}:{status}", self.prefix)
    }

    /// Registry of projects with at least one item.
    pub fn project_registry(&self) -> String {
        format!("{}:projects:index", self.prefix)
    }

    /// Question document.
    pub fn question(&self, project_id: &str, question_id: &str) -> String {
        format!("{}:question:{project_id}:{question_id}", self.prefix)
    }

    /// Per-project question index.
    pub fn question_index(&self, project_id: &str) -> String {
        format!("{}:question_index:{project_id}", self.prefix)
    }

    /// Per-project open-question index.
    pub fn question_open(&self, project_id: &str) -> String {
        format!("{}:question_open:{project_id}", self.prefix)
    }

    /// Stored answer for a question.
    pub fn question_answer(&self, question_id: &str) -> String {
        format!("{}:question_answer:{question_id}", self.prefix)
    }

    /// Idempotence marker for one event within one consumer group.
    pub fn idempotence(&self, group: &str, event_id: &str) -> String {
        format!("{}:{group}:{event_id}", self.idempotence_prefix)
    }

    /// Named TTL lease.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }

    /// Delivery attempt counter for one event within one consumer group.
    pub fn attempts(&self, group: &str, event_id: &str) -> String {
        format!("{}:attempts:{group}:{event_id}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_documented_scheme() {
        let keys = KeySpace::new("audit", "audit:seen");
        assert_eq!(keys.backlog_item("P1", "B1"), "audit:backlog:P1:B1");
        assert_eq!(keys.backlog_index("P1"), "audit:backlog_index:P1");
        assert_eq!(keys.backlog_status("P1", "READY"), "audit:backlog_status:P1:READY");
        assert_eq!(keys.project_registry(), "audit:projects:index");
        assert_eq!(keys.question("P1", "Q1"), "audit:question:P1:Q1");
        assert_eq!(keys.question_open("P1"), "audit:question_open:P1");
        assert_eq!(keys.question_answer("Q1"), "audit:question_answer:Q1");
        assert_eq!(keys.idempotence("orchestrator", "E1"), "audit:seen:orchestrator:E1");
        assert_eq!(keys.lock("dispatch:backlog:B1"), "audit:lock:dispatch:backlog:B1");
        assert_eq!(keys.attempts("validators", "E1"), "audit:attempts:validators:E1");
    }
}
