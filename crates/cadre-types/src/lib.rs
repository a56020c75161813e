#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-types** – Shared primitive data structures for Cadre.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the canonical event envelope and its wire codec, the typed
//! event payload union, the backlog and clarification entities, and the
//! backlog status state machine. It makes no assumptions about I/O or
//! storage.

//─────────────────────────────
//  Modules
//─────────────────────────────

pub mod envelope;
pub mod event;
pub mod entity;
pub mod status;

pub use envelope::{DecodeError, EventEnvelope, WIRE_EVENT_FIELD};
pub use event::{
    AnswerSubmitted, ClarificationNeeded, ContractError, DeliverablePublished, EventPayload,
    FailureCategory, InitialRequest, ItemCompleted, ItemDispatched, ItemFailed, ItemStarted,
    ItemUnblocked, QuestionCreated,
};
pub use entity::{
    AnswerError, AnswerType, BacklogItem, ClarificationQuestion, ItemType, QuestionStatus,
};
pub use status::{IllegalTransition, ItemStatus};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum accepted size for a raw `event` wire field, to bound decoding work
/// on hostile stream entries.
pub const MAX_WIRE_EVENT_LEN: usize = 1_048_576; // 1MB

/// Maximum accepted length for a request text on intake.
pub const MAX_REQUEST_TEXT_LEN: usize = 65_536;
