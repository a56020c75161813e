#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-state** – Entity stores for Cadre.
//!
//! Two stores own the persisted workflow state: the backlog store (items,
//! per-project and per-status indices, project registry) and the question
//! store (clarification questions, open-question index, answers). Both sit on
//! the substrate facade and keep their document-plus-index updates inside one
//! atomic batch, so readers never observe a half-reindexed entity.
//!
//! The orchestrator is the only writer of both stores; everything else reads.

pub mod backlog;
pub mod question;

pub use backlog::BacklogStore;
pub use question::QuestionStore;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors raised by the entity stores.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The requested entity does not exist.
    #[error("{kind} {id} not found in project {project_id}")]
    NotFound {
        /// Entity kind (`backlog item` or `question`).
        kind: &'static str,
        /// Owning project.
        project_id: String,
        /// Entity id.
        id: String,
    },
    /// A stored document could not be decoded.
    #[error("corrupt {kind} document at {key}: {message}")]
    Corrupt {
        /// Entity kind.
        kind: &'static str,
        /// Substrate key holding the document.
        key: String,
        /// Decode failure.
        message: String,
    },
    /// The substrate failed.
    #[error(transparent)]
    Substrate(#[from] anyhow::Error),
}
