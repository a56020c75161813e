//! Backlog status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Status enumeration
//─────────────────────────────

/// Lifecycle status of a backlog item.
///
/// Dispatch moves items `READY → IN_PROGRESS`; `WORK.ITEM_DISPATCHED` is an
/// event type, not a status. `DONE` and `FAILED` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Item exists but is not yet eligible for dispatch.
    Created,
    /// Item is eligible for dispatch.
    Ready,
    /// Item is waiting on a clarification answer.
    Blocked,
    /// Item has been dispatched to a worker.
    InProgress,
    /// Item completed and its evidence passed the Definition of Done.
    Done,
    /// Item failed terminally.
    Failed,
}

impl ItemStatus {
    /// Whether the status is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed)
    }

    /// Check a proposed transition against the allowed table.
    pub fn assert_transition(from: ItemStatus, to: ItemStatus) -> Result<(), IllegalTransition> {
        use ItemStatus::*;
        let allowed = matches!(
            (from, to),
            (Created, Ready)
                | (Created, Blocked)
                | (Created, Failed)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (Ready, Failed)
                | (Blocked, Ready)
                | (Blocked, Failed)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Blocked)
        );
        if allowed {
            Ok(())
        } else {
            Err(IllegalTransition {
                from,
                to,
                reason: if from.is_terminal() {
                    "terminal states are absorbing"
                } else {
                    "transition not in the allowed table"
                },
            })
        }
    }

    /// All statuses, for index enumeration.
    pub fn all() -> &'static [ItemStatus] {
        use ItemStatus::*;
        &[Created, Ready, Blocked, InProgress, Done, Failed]
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ItemStatus::Created => "CREATED",
            ItemStatus::Ready => "READY",
            ItemStatus::Blocked => "BLOCKED",
            ItemStatus::InProgress => "IN_PROGRESS",
            ItemStatus::Done => "DONE",
            ItemStatus::Failed => "FAILED",
        };
        f.write_str(tag)
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(ItemStatus::Created),
            "READY" => Ok(ItemStatus::Ready),
            "BLOCKED" => Ok(ItemStatus::Blocked),
            "IN_PROGRESS" => Ok(ItemStatus::InProgress),
            "DONE" => Ok(ItemStatus::Done),
            "FAILED" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown backlog status: {other}")),
        }
    }
}

//─────────────────────────────
//  Error type
//─────────────────────────────

/// A status change the state machine rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}: {reason}")]
pub struct IllegalTransition {
    /// Status the item was in.
    pub from: ItemStatus,
    /// Status the caller asked for.
    pub to: ItemStatus,
    /// Why the table rejects it.
    pub reason: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_path_is_legal() {
        use ItemStatus::*;
        for (from, to) in [(Created, Ready), (Ready, InProgress), (InProgress, Done)] {
            ItemStatus::assert_transition(from, to).unwrap();
        }
    }

    #[test]
    fn clarification_loop_is_legal() {
        use ItemStatus::*;
        for (from, to) in [
            (Created, Blocked),
            (Blocked, Ready),
            (Ready, Blocked),
            (InProgress, Blocked),
        ] {
            ItemStatus::assert_transition(from, to).unwrap();
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        use ItemStatus::*;
        for from in [Done, Failed] {
            for to in ItemStatus::all() {
                let err = ItemStatus::assert_transition(from, *to).unwrap_err();
                assert_eq!(err.from, from);
                assert_eq!(err.reason, "terminal states are absorbing");
            }
        }
    }

    #[test]
    fn skipping_ready_is_rejected() {
        let err =
            ItemStatus::assert_transition(ItemStatus::Created, ItemStatus::InProgress).unwrap_err();
        assert_eq!(err.to, ItemStatus::InProgress);
    }

    #[test]
    fn wire_tags_round_trip() {
        for status in ItemStatus::all() {
            let parsed: ItemStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, *status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::Value::String(status.to_string()));
        }
    }
}
