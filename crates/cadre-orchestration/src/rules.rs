//! Ambiguity detection rules.
//!
//! The policy decides whether an intake request carries everything the
//! backlog template needs. It is deliberately pluggable: the rule set below
//! is data, not intent-guessing, and deployments swap in their own policy
//! when the template changes.

use cadre_types::{AnswerType, InitialRequest};

//─────────────────────────────
//  Policy contract
//─────────────────────────────

/// Verdict for an ambiguous request.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguityReview {
    /// Template-required fields absent from the request, in rule order.
    pub missing_fields: Vec<String>,
    /// Question to put to the human for the first missing field.
    pub question_text: String,
    /// Expected answer shape for that question.
    pub expected_answer_type: AnswerType,
}

/// Decides whether an intake request is ambiguous.
pub trait AmbiguityPolicy: Send + Sync {
    /// Return `Some` with the missing fields when the request cannot seed a
    /// backlog; `None` when it is actionable as-is.
    fn review(&self, request: &InitialRequest) -> Option<AmbiguityReview>;
}

//─────────────────────────────
//  Rule-based policy
//─────────────────────────────

/// One required field with the evidence that satisfies it.
#[derive(Debug, Clone)]
pub struct IntakeRule {
    /// Field the backlog template requires.
    pub field: String,
    /// Question asked when the field is missing.
    pub question: String,
    /// Expected answer shape.
    pub answer_type: AnswerType,
    /// Lower-case keywords; any one of them present satisfies the rule.
    pub keywords: Vec<String>,
}

impl IntakeRule {
    fn satisfied_by(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Keyword-based ambiguity policy.
///
/// A request is ambiguous when it is blank, too short to carry any intent,
/// or fails one of the configured rules.
pub struct RuleBasedPolicy {
    rules: Vec<IntakeRule>,
    min_request_len: usize,
}

/// Shortest request the standard policy treats as carrying intent.
const MIN_REQUEST_LEN: usize = 8;

impl RuleBasedPolicy {
    /// Policy with an explicit rule set.
    pub fn new(rules: Vec<IntakeRule>) -> Self {
        Self {
            rules,
            min_request_len: MIN_REQUEST_LEN,
        }
    }

    /// The repo-standard rule set: the request must name a review scope.
    pub fn standard() -> Self {
        Self::new(vec![IntakeRule {
            field: "scope".to_string(),
            question: "What should this engagement review (e.g. audit, cost, time, friction)?"
                .to_string(),
            answer_type: AnswerType::Text,
            keywords: vec![
                "audit".to_string(),
                "review".to_string(),
                "assessment".to_string(),
                "cost".to_string(),
                "time".to_string(),
                "friction".to_string(),
                "scenario".to_string(),
            ],
        }])
    }
}

impl AmbiguityPolicy for RuleBasedPolicy {
    fn review(&self, request: &InitialRequest) -> Option<AmbiguityReview> {
        let text = request.request_text.trim();
        if text.len() < self.min_request_len {
            return Some(AmbiguityReview {
                missing_fields: vec!["request_text".to_string()],
                question_text: "Describe what you would like reviewed.".to_string(),
                expected_answer_type: AnswerType::Text,
            });
        }

        let failed: Vec<&IntakeRule> = self
            .rules
            .iter()
            .filter(|rule| !rule.satisfied_by(text))
            .collect();
        let first = failed.first()?;
        Some(AmbiguityReview {
            missing_fields: failed.iter().map(|r| r.field.clone()).collect(),
            question_text: first.question.clone(),
            expected_answer_type: first.answer_type,
        })
    }
}
