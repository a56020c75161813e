#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cadre-orchestration** – Orchestration layer for Cadre.
//!
//! The orchestrator is the single writer of workflow state. It consumes the
//! main stream in the `orchestrator` group and:
//!
//! - turns intake requests into a backlog (or into a clarification question
//!   when the request is ambiguous),
//! - dispatches READY items under per-item lock leases,
//! - applies answers, unblocking the items they free,
//! - judges completion evidence through the Definition-of-Done evaluator,
//! - records worker failures and worker-raised clarifications.
//!
//! Workers never write backlog state; they emit events and the orchestrator
//! applies every transition through the state machine.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadre_runtime::{
    ConsumerBinding, DlqPublisher, EventHandler, HandlerError, RuntimeConfig, StreamConsumer,
    LockService, ORCHESTRATOR_GROUP,
};
use cadre_schema::SchemaRegistry;
use cadre_state::{BacklogStore, QuestionStore};
use cadre_store_core::Substrate;
use cadre_types::{
    AnswerSubmitted, AnswerType, BacklogItem, ClarificationNeeded, EventEnvelope, EventPayload,
    InitialRequest, ItemCompleted, ItemDispatched, ItemFailed, ItemStatus, ItemType,
    ItemUnblocked, QuestionCreated, QuestionStatus,
};

pub mod dod;
pub mod rules;
pub mod template;

pub use dod::{DodEvaluator, DodVerdict, RequiredEvidenceDod};
pub use rules::{AmbiguityPolicy, AmbiguityReview, IntakeRule, RuleBasedPolicy};
pub use template::{BacklogPlanner, PlannedItem, StandardTemplate};

/// Producer tag on every orchestrator-emitted event.
pub const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// DLQ reason for orchestrator handler failures. Poison intakes must never
/// stall the loop, so these are dead-lettered instead of retried.
const HANDLER_ERROR_REASON: &str = "orchestrator_handler_error";

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Central coordinator over the backlog and question stores.
pub struct Orchestrator {
    substrate: Arc<dyn Substrate>,
    backlog: BacklogStore,
    questions: QuestionStore,
    locks: LockService,
    ambiguity: Arc<dyn AmbiguityPolicy>,
    planner: Arc<dyn BacklogPlanner>,
    dod: Arc<dyn DodEvaluator>,
    stream: String,
}

impl Orchestrator {
    /// Create an orchestrator with the standard policy, template and DoD.
    pub fn new(substrate: Arc<dyn Substrate>, config: &RuntimeConfig) -> Self {
        let keys = config.keyspace();
        Self {
            backlog: BacklogStore::new(substrate.clone(), keys.clone()),
            questions: QuestionStore::new(substrate.clone(), keys.clone()),
            locks: LockService::new(substrate.clone(), keys, config.lock_ttl()),
            ambiguity: Arc::new(RuleBasedPolicy::standard()),
            planner: Arc::new(StandardTemplate::default()),
            dod: Arc::new(RequiredEvidenceDod),
            stream: config.stream.clone(),
            substrate,
        }
    }

    /// Swap the ambiguity policy.
    pub fn with_ambiguity_policy(mut self, policy: Arc<dyn AmbiguityPolicy>) -> Self {
        self.ambiguity = policy;
        self
    }

    /// Swap the backlog planner.
    pub fn with_planner(mut self, planner: Arc<dyn BacklogPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Swap the Definition-of-Done evaluator.
    pub fn with_dod(mut self, dod: Arc<dyn DodEvaluator>) -> Self {
        self.dod = dod;
        self
    }

    /// The backlog store, for read-side callers.
    pub fn backlog(&self) -> &BacklogStore {
        &self.backlog
    }

    /// The question store, for read-side callers.
    pub fn questions(&self) -> &QuestionStore {
        &self.questions
    }

    /// Bind this orchestrator into a consumer loop on the `orchestrator`
    /// group.
    pub fn into_consumer(
        self: Arc<Self>,
        registry: Arc<SchemaRegistry>,
        config: &RuntimeConfig,
    ) -> StreamConsumer {
        StreamConsumer::new(
            self.substrate.clone(),
            registry,
            self.clone(),
            DlqPublisher::new(self.substrate.clone(), config.dlq_stream.clone()),
            config.keyspace(),
            ConsumerBinding::new(&config.stream, ORCHESTRATOR_GROUP, &config.consumer),
            config.into(),
        )
    }

    //───────────────────── intake ─────────────────────

    async fn on_intake(&self, envelope: &EventEnvelope, request: InitialRequest) -> Result<()> {
        if let Some(review) = self.ambiguity.review(&request) {
            info!(
                project_id = %request.project_id,
                missing = ?review.missing_fields,
                "intake is ambiguous, opening clarification"
            );
            let item_id = Uuid::new_v4().to_string();
            let field = review
                .missing_fields
                .first()
                .cloned()
                .unwrap_or_else(|| "input".to_string());
            let question = self
                .questions
                .create(
                    &request.project_id,
                    &item_id,
                    &review.question_text,
                    review.expected_answer_type,
                    &envelope.correlation_id,
                )
                .await?;

            let mut item = BacklogItem::new(
                &request.project_id,
                &item_id,
                ItemType::GenericTask,
                ItemStatus::Blocked,
            )
            .with_work_context(json!({ "request_text": request.request_text }));
            record_awaiting(&mut item.work_context, &question.question_id, &field);
            self.backlog.put_item(&item).await?;

            self.emit(
                EventPayload::QuestionCreated(QuestionCreated {
                    project_id: request.project_id.clone(),
                    question_id: question.question_id.clone(),
                    backlog_item_id: item_id.clone(),
                    question_text: question.question_text.clone(),
                    expected_answer_type: question.expected_answer_type,
                }),
                envelope,
            )
            .await?;
            self.emit(
                EventPayload::ClarificationNeeded(ClarificationNeeded {
                    project_id: request.project_id,
                    backlog_item_id: item_id,
                    missing_fields: review.missing_fields,
                }),
                envelope,
            )
            .await?;
            return Ok(());
        }

        let planned = self.planner.plan(&request);
        if planned.is_empty() {
            bail!("backlog planner produced no items for {}", request.project_id);
        }
        for plan in planned {
            let mut item = BacklogItem::new(
                &request.project_id,
                Uuid::new_v4().to_string(),
                plan.item_type,
                ItemStatus::Ready,
            )
            .with_work_context(plan.work_context);
            item.agent_target = plan.agent_target;
            self.backlog.put_item(&item).await?;
        }

        let dispatched = self
            .dispatch_ready(Some(&request.project_id), envelope)
            .await?;
        info!(
            project_id = %request.project_id,
            dispatched,
            "backlog generated from intake"
        );
        Ok(())
    }

    //───────────────────── answers ─────────────────────

    async fn on_answer(&self, envelope: &EventEnvelope, answer: AnswerSubmitted) -> Result<()> {
        let question = self
            .questions
            .get_question(&answer.project_id, &answer.question_id)
            .await?
            .ok_or_else(|| anyhow!("answer for unknown question {}", answer.question_id))?;
        if question.status == QuestionStatus::Closed {
            debug!(question_id = %answer.question_id, "answer for closed question ignored");
            return Ok(());
        }

        let normalized = question
            .expected_answer_type
            .normalize(&answer.answer)
            .with_context(|| format!("answer for question {}", answer.question_id))?;
        self.questions
            .set_answer(&answer.project_id, &answer.question_id, &normalized)
            .await?;

        let item = self
            .backlog
            .require(&answer.project_id, &question.backlog_item_id)
            .await?;
        if item.status == ItemStatus::Blocked {
            ItemStatus::assert_transition(item.status, ItemStatus::Ready)?;
            let mut item = item;
            apply_answer(&mut item.work_context, &question.question_id, &normalized);
            item.status = ItemStatus::Ready;
            item.updated_at = Utc::now();
            self.backlog.put_item(&item).await?;
            self.emit(
                EventPayload::ItemUnblocked(ItemUnblocked {
                    project_id: answer.project_id.clone(),
                    backlog_item_id: question.backlog_item_id.clone(),
                }),
                envelope,
            )
            .await?;
            info!(
                project_id = %answer.project_id,
                backlog_item_id = %question.backlog_item_id,
                "item unblocked by answer"
            );
        }

        self.dispatch_ready(Some(&answer.project_id), envelope).await?;
        Ok(())
    }

    //───────────────────── dispatch ─────────────────────

    /// Dispatch every READY item, per project or across all projects.
    ///
    /// Each item is dispatched under its own lock lease: the transition is
    /// checked, the event emitted and the status persisted before the lease
    /// is released. Returns the number of items dispatched.
    pub async fn dispatch_ready(
        &self,
        project_id: Option<&str>,
        trigger: &EventEnvelope,
    ) -> Result<usize> {
        let projects = match project_id {
            Some(project) => vec![project.to_string()],
            None => self.backlog.list_project_ids().await?,
        };

        let mut dispatched = 0;
        for project in &projects {
            for item_id in self
                .backlog
                .list_item_ids_by_status(project, ItemStatus::Ready)
                .await?
            {
                let lock_name = format!("dispatch:backlog:{item_id}");
                if !self.locks.acquire(&lock_name).await? {
                    debug!(item_id = %item_id, "dispatch lock held elsewhere, skipping");
                    continue;
                }

                let item = self.backlog.require(project, &item_id).await?;
                if let Err(rejected) =
                    ItemStatus::assert_transition(item.status, ItemStatus::InProgress)
                {
                    warn!(item_id = %item_id, %rejected, "dispatch skipped");
                    self.locks.release(&lock_name).await?;
                    continue;
                }

                self.emit(
                    EventPayload::ItemDispatched(ItemDispatched {
                        project_id: project.clone(),
                        backlog_item_id: item_id.clone(),
                        item_type: item.item_type,
                        agent_target: item.agent_target.clone(),
                        work_context: item.work_context.clone(),
                    }),
                    trigger,
                )
                .await?;
                self.backlog
                    .set_status(project, &item_id, ItemStatus::InProgress)
                    .await?;
                self.locks.release(&lock_name).await?;
                dispatched += 1;
                info!(
                    project_id = %project,
                    item_id = %item_id,
                    agent_target = item.agent_target.as_deref().unwrap_or("-"),
                    "item dispatched"
                );
            }
        }
        Ok(dispatched)
    }

    //───────────────────── completion ─────────────────────

    async fn on_completed(&self, envelope: &EventEnvelope, done: ItemCompleted) -> Result<()> {
        let item = self
            .backlog
            .require(&done.project_id, &done.backlog_item_id)
            .await?;
        if item.status != ItemStatus::InProgress {
            warn!(
                backlog_item_id = %done.backlog_item_id,
                status = %item.status,
                "completion for item not in progress ignored"
            );
            return Ok(());
        }

        match self.dod.evaluate(&item, &done.evidence) {
            DodVerdict::Done => {
                ItemStatus::assert_transition(item.status, ItemStatus::Done)?;
                let mut item = item;
                item.evidence = done.evidence;
                item.status = ItemStatus::Done;
                item.updated_at = Utc::now();
                self.backlog.put_item(&item).await?;
                info!(
                    project_id = %done.project_id,
                    backlog_item_id = %done.backlog_item_id,
                    "item done"
                );
            }
            DodVerdict::Blocked { missing_fields } => {
                warn!(
                    backlog_item_id = %done.backlog_item_id,
                    missing = ?missing_fields,
                    "evidence incomplete, blocking item"
                );
                self.block_with_question(item, &missing_fields, envelope, true)
                    .await?;
            }
            DodVerdict::Failed { reason } => {
                warn!(
                    backlog_item_id = %done.backlog_item_id,
                    reason = %reason,
                    "evidence rejected, failing item"
                );
                ItemStatus::assert_transition(item.status, ItemStatus::Failed)?;
                let mut item = item;
                item.evidence = done.evidence;
                item.status = ItemStatus::Failed;
                item.updated_at = Utc::now();
                self.backlog.put_item(&item).await?;
            }
        }
        Ok(())
    }

    async fn on_failed(&self, failed: ItemFailed) -> Result<()> {
        let item = self
            .backlog
            .require(&failed.project_id, &failed.backlog_item_id)
            .await?;
        match ItemStatus::assert_transition(item.status, ItemStatus::Failed) {
            Ok(()) => {
                self.backlog
                    .set_status(&failed.project_id, &failed.backlog_item_id, ItemStatus::Failed)
                    .await?;
                warn!(
                    project_id = %failed.project_id,
                    backlog_item_id = %failed.backlog_item_id,
                    category = ?failed.category,
                    reason = %failed.reason,
                    "item failed"
                );
            }
            Err(rejected) => {
                // Other items must still make progress.
                warn!(
                    backlog_item_id = %failed.backlog_item_id,
                    %rejected,
                    "failure transition skipped"
                );
            }
        }
        Ok(())
    }

    //───────────────────── clarifications ─────────────────────

    async fn on_clarification(
        &self,
        envelope: &EventEnvelope,
        clarification: ClarificationNeeded,
    ) -> Result<()> {
        let Some(item) = self
            .backlog
            .get_item(&clarification.project_id, &clarification.backlog_item_id)
            .await?
        else {
            bail!(
                "clarification for unknown item {}",
                clarification.backlog_item_id
            );
        };
        // Only worker-raised clarifications act here: the intake and DoD
        // paths block the item before their event hits the stream, so it
        // comes back already BLOCKED.
        if item.status != ItemStatus::InProgress {
            debug!(
                backlog_item_id = %clarification.backlog_item_id,
                status = %item.status,
                "clarification for non-running item ignored"
            );
            return Ok(());
        }
        self.block_with_question(item, &clarification.missing_fields, envelope, false)
            .await
    }

    /// Block `item` behind a fresh question about its missing fields.
    async fn block_with_question(
        &self,
        item: BacklogItem,
        missing_fields: &[String],
        trigger: &EventEnvelope,
        emit_clarification: bool,
    ) -> Result<()> {
        ItemStatus::assert_transition(item.status, ItemStatus::Blocked)?;

        let field = missing_fields
            .first()
            .map(String::as_str)
            .unwrap_or("input");
        let question_text = format!("Provide a value for `{field}`.");
        let question = self
            .questions
            .create(
                &item.project_id,
                &item.item_id,
                &question_text,
                AnswerType::Text,
                &trigger.correlation_id,
            )
            .await?;

        let mut item = item;
        record_awaiting(&mut item.work_context, &question.question_id, field);
        item.status = ItemStatus::Blocked;
        item.updated_at = Utc::now();
        self.backlog.put_item(&item).await?;

        self.emit(
            EventPayload::QuestionCreated(QuestionCreated {
                project_id: item.project_id.clone(),
                question_id: question.question_id.clone(),
                backlog_item_id: item.item_id.clone(),
                question_text,
                expected_answer_type: question.expected_answer_type,
            }),
            trigger,
        )
        .await?;
        if emit_clarification {
            self.emit(
                EventPayload::ClarificationNeeded(ClarificationNeeded {
                    project_id: item.project_id.clone(),
                    backlog_item_id: item.item_id.clone(),
                    missing_fields: missing_fields.to_vec(),
                }),
                trigger,
            )
            .await?;
        }
        Ok(())
    }

    //───────────────────── emission ─────────────────────

    async fn emit(&self, payload: EventPayload, trigger: &EventEnvelope) -> Result<()> {
        let envelope = EventEnvelope::build(&payload, ORCHESTRATOR_SOURCE).follows(trigger);
        self.substrate
            .append(&self.stream, &envelope.to_wire_fields())
            .await?;
        Ok(())
    }
}

//─────────────────────────────
//  Handler binding
//─────────────────────────────

#[async_trait]
impl EventHandler for Orchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _raw_fields: &std::collections::HashMap<String, String>,
    ) -> Result<(), HandlerError> {
        let event = EventPayload::from_value(&envelope.event_type, &envelope.payload)
            .map_err(|e| HandlerError::fatal(HANDLER_ERROR_REASON, e.to_string()))?;

        let outcome = match event {
            EventPayload::InitialRequestReceived(request) => {
                self.on_intake(envelope, request).await
            }
            EventPayload::AnswerSubmitted(answer) => self.on_answer(envelope, answer).await,
            EventPayload::ItemCompleted(done) => self.on_completed(envelope, done).await,
            EventPayload::ItemFailed(failed) => self.on_failed(failed).await,
            EventPayload::ClarificationNeeded(clarification) => {
                self.on_clarification(envelope, clarification).await
            }
            // Everything else on the stream is not orchestrator input.
            _ => Ok(()),
        };
        outcome.map_err(|e| HandlerError::fatal(HANDLER_ERROR_REASON, format!("{e:#}")))
    }
}

//─────────────────────────────
//  Work-context bookkeeping
//─────────────────────────────

/// Remember which context field a question's answer will fill.
fn record_awaiting(work_context: &mut Value, question_id: &str, field: &str) {
    if !work_context.is_object() {
        *work_context = json!({});
    }
    let awaiting = work_context
        .as_object_mut()
        .expect("work context is an object")
        .entry("awaiting")
        .or_insert_with(|| json!({}));
    awaiting[question_id] = json!(field);
}

/// Fold a normalized answer back into the work context.
fn apply_answer(work_context: &mut Value, question_id: &str, answer: &Value) {
    if !work_context.is_object() {
        *work_context = json!({});
    }
    let object = work_context
        .as_object_mut()
        .expect("work context is an object");

    let field = object
        .get_mut("awaiting")
        .and_then(Value::as_object_mut)
        .and_then(|awaiting| awaiting.remove(question_id))
        .and_then(|v| v.as_str().map(str::to_string));
    match field {
        Some(field) => {
            object.insert(field, answer.clone());
        }
        None => {
            let clarifications = object
                .entry("clarifications")
                .or_insert_with(|| json!({}));
            clarifications[question_id] = answer.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_fill_the_awaited_field() {
        let mut ctx = json!({"request_text": "audit"});
        record_awaiting(&mut ctx, "Q1", "scope");
        assert_eq!(ctx["awaiting"]["Q1"], "scope");

        apply_answer(&mut ctx, "Q1", &json!("cost"));
        assert_eq!(ctx["scope"], "cost");
        assert!(ctx["awaiting"].as_object().unwrap().is_empty());
    }

    #[test]
    fn unexpected_answers_are_kept_by_question_id() {
        let mut ctx = json!({});
        apply_answer(&mut ctx, "Q9", &json!(42));
        assert_eq!(ctx["clarifications"]["Q9"], 42);
    }

    #[test]
    fn null_context_is_promoted_to_an_object() {
        let mut ctx = Value::Null;
        record_awaiting(&mut ctx, "Q1", "scope");
        assert_eq!(ctx["awaiting"]["Q1"], "scope");
    }
}
