//! Clarification question store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use cadre_store_core::{KeySpace, KvWrite, Substrate};
use cadre_types::{AnswerType, ClarificationQuestion, QuestionStatus};

use crate::StateError;

//─────────────────────────────
//  Store
//─────────────────────────────

/// Persists clarification questions and their answers.
///
/// Invariant: a question has `status = OPEN` iff its id is in the project's
/// open-question index; closing removes it there. Answers are stored
/// separately under the question id.
#[derive(Clone)]
pub struct QuestionStore {
    substrate: Arc<dyn Substrate>,
    keys: KeySpace,
}

impl QuestionStore {
    /// Create a store over `substrate` with the given key space.
    pub fn new(substrate: Arc<dyn Substrate>, keys: KeySpace) -> Self {
        Self { substrate, keys }
    }

    /// Allocate and persist a new OPEN question blocking `backlog_item_id`.
    pub async fn create(
        &self,
        project_id: &str,
        backlog_item_id: &str,
        question_text: &str,
        answer_type: AnswerType,
        correlation_id: &str,
    ) -> Result<ClarificationQuestion, StateError> {
        let question = ClarificationQuestion {
            project_id: project_id.to_string(),
            question_id: Uuid::new_v4().to_string(),
            backlog_item_id: backlog_item_id.to_string(),
            question_text: question_text.to_string(),
            expected_answer_type: answer_type,
            status: QuestionStatus::Open,
            correlation_id: correlation_id.to_string(),
            created_at: Utc::now(),
        };
        self.persist(&question).await?;
        debug!(
            project_id,
            question_id = %question.question_id,
            backlog_item_id,
            "question opened"
        );
        Ok(question)
    }

    /// Close a question and remove it from the open index.
    ///
    /// Closing an already-closed question is a no-op.
    pub async fn close(&self, project_id: &str, question_id: &str) -> Result<(), StateError> {
        let mut question = self.require(project_id, question_id).await?;
        if question.status == QuestionStatus::Closed {
            return Ok(());
        }
        question.status = QuestionStatus::Closed;
        self.persist(&question).await
    }

    /// Store the normalized answer for a question and close it.
    pub async fn set_answer(
        &self,
        project_id: &str,
        question_id: &str,
        normalized_answer: &Value,
    ) -> Result<(), StateError> {
        let mut question = self.require(project_id, question_id).await?;
        question.status = QuestionStatus::Closed;

        let doc_key = self.keys.question(project_id, question_id);
        let doc = encode(&doc_key, &question)?;
        self.substrate
            .run_batch(vec![
                KvWrite::Set {
                    key: self.keys.question_answer(question_id),
                    value: normalized_answer.to_string(),
                },
                KvWrite::Set {
                    key: doc_key,
                    value: doc,
                },
                KvWrite::SetRemove {
                    key: self.keys.question_open(project_id),
                    member: question_id.to_string(),
                },
            ])
            .await?;
        Ok(())
    }

    /// Read a question, if present.
    pub async fn get_question(
        &self,
        project_id: &str,
        question_id: &str,
    ) -> Result<Option<ClarificationQuestion>, StateError> {
        let key = self.keys.question(project_id, question_id);
        match self.substrate.get(&key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    kind: "question",
                    key,
                    message: e.to_string(),
                }),
        }
    }

    /// Read a question, erroring when absent.
    pub async fn require(
        &self,
        project_id: &str,
        question_id: &str,
    ) -> Result<ClarificationQuestion, StateError> {
        self.get_question(project_id, question_id)
            .await?
            .ok_or_else(|| StateError::NotFound {
                kind: "question",
                project_id: project_id.to_string(),
                id: question_id.to_string(),
            })
    }

    /// Read the stored answer for a question, if any.
    pub async fn get_answer(&self, question_id: &str) -> Result<Option<Value>, StateError> {
        let key = self.keys.question_answer(question_id);
        match self.substrate.get(&key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    kind: "answer",
                    key,
                    message: e.to_string(),
                }),
        }
    }

    /// Ids of open questions in a project, sorted.
    pub async fn list_open(&self, project_id: &str) -> Result<Vec<String>, StateError> {
        let mut ids = self
            .substrate
            .set_members(&self.keys.question_open(project_id))
            .await?;
        ids.sort();
        Ok(ids)
    }

    /// Ids of all questions in a project, sorted.
    pub async fn list_all(&self, project_id: &str) -> Result<Vec<String>, StateError> {
        let mut ids = self
            .substrate
            .set_members(&self.keys.question_index(project_id))
            .await?;
        ids.sort();
        Ok(ids)
    }

    async fn persist(&self, question: &ClarificationQuestion) -> Result<(), StateError> {
        let doc_key = self.keys.question(&question.project_id, &question.question_id);
        let doc = encode(&doc_key, question)?;
        let open_key = self.keys.question_open(&question.project_id);

        let mut batch = vec![
            KvWrite::Set {
                key: doc_key,
                value: doc,
            },
            KvWrite::SetAdd {
                key: self.keys.question_index(&question.project_id),
                member: question.question_id.clone(),
            },
        ];
        batch.push(match question.status {
            QuestionStatus::Open => KvWrite::SetAdd {
                key: open_key,
                member: question.question_id.clone(),
            },
            QuestionStatus::Closed => KvWrite::SetRemove {
                key: open_key,
                member: question.question_id.clone(),
            },
        });
        self.substrate.run_batch(batch).await?;
        Ok(())
    }
}

fn encode(key: &str, question: &ClarificationQuestion) -> Result<String, StateError> {
    serde_json::to_string(question).map_err(|e| StateError::Corrupt {
        kind: "question",
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_store_memory::MemorySubstrate;
    use serde_json::json;

    fn store() -> QuestionStore {
        QuestionStore::new(Arc::new(MemorySubstrate::new()), KeySpace::default())
    }

    #[tokio::test]
    async fn create_opens_and_indexes() {
        let store = store();
        let q = store
            .create("P1", "B1", "Which period?", AnswerType::Text, "corr-1")
            .await
            .unwrap();

        assert_eq!(q.status, QuestionStatus::Open);
        assert_eq!(store.list_open("P1").await.unwrap(), vec![q.question_id.clone()]);
        assert_eq!(store.list_all("P1").await.unwrap(), vec![q.question_id.clone()]);

        let loaded = store.get_question("P1", &q.question_id).await.unwrap().unwrap();
        assert_eq!(loaded, q);
    }

    #[tokio::test]
    async fn answer_closes_and_stores_value() {
        let store = store();
        let q = store
            .create("P1", "B1", "How many sites?", AnswerType::Number, "corr-1")
            .await
            .unwrap();

        store
            .set_answer("P1", &q.question_id, &json!(4))
            .await
            .unwrap();

        assert!(store.list_open("P1").await.unwrap().is_empty());
        assert_eq!(store.get_answer(&q.question_id).await.unwrap(), Some(json!(4)));
        assert_eq!(
            store
                .get_question("P1", &q.question_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            QuestionStatus::Closed
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let store = store();
        let q = store
            .create("P1", "B1", "Which period?", AnswerType::Text, "corr-1")
            .await
            .unwrap();

        store.close("P1", &q.question_id).await.unwrap();
        store.close("P1", &q.question_id).await.unwrap();

        assert!(store.list_open("P1").await.unwrap().is_empty());
        assert_eq!(store.list_all("P1").await.unwrap(), vec![q.question_id]);
    }

    #[tokio::test]
    async fn missing_question_is_not_found() {
        let store = store();
        let err = store.close("P1", "ghost").await.unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
        assert!(store.get_question("P1", "ghost").await.unwrap().is_none());
        assert!(store.get_answer("ghost").await.unwrap().is_none());
    }
}
