//! The generic reliable stream processor.
//!
//! Every Cadre service (validator, orchestrator, workers) is an instance of
//! [`StreamConsumer`] bound to a `(stream, group, consumer, handler)` tuple.
//! The loop reads new entries, falls back to reclaiming stale pending
//! entries, and pushes each entry through the fixed pipeline:
//!
//! decode → envelope schema → payload schema → idempotence guard → handler.
//!
//! Contract violations are dead-lettered and acked; duplicates are acked
//! without a handler call; retryable handler failures leave the entry
//! pending so reclaim redelivers it, up to the attempt budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadre_schema::{SchemaRegistry, ValidationFailure};
use cadre_store_core::{KeySpace, StreamEntry, Substrate};
use cadre_types::{DecodeError, EventEnvelope};

use crate::dlq::DlqPublisher;
use crate::idempotence::IdempotenceGuard;
use crate::RuntimeConfig;

//─────────────────────────────
//  Handler contract
//─────────────────────────────

/// Outcome classification for handler failures.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure: do not ack, let reclaim redeliver the entry.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Permanent failure: dead-letter under `reason` and ack.
    #[error("{reason}: {message}")]
    Fatal {
        /// DLQ reason tag.
        reason: String,
        /// Failure detail.
        message: String,
    },
}

impl HandlerError {
    /// Convenience constructor for fatal failures.
    pub fn fatal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Fatal {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Application logic invoked once per valid, non-duplicate entry.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one decoded, schema-valid envelope.
    ///
    /// `raw_fields` carries the original stream entry for handlers that need
    /// producer-attached metadata beyond the envelope.
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        raw_fields: &HashMap<String, String>,
    ) -> Result<(), HandlerError>;
}

//─────────────────────────────
//  Consumer binding
//─────────────────────────────

/// Identity of one consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerBinding {
    /// Stream to consume.
    pub stream: String,
    /// Consumer group to join.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
}

impl ConsumerBinding {
    /// Bind to `stream` as `consumer` within `group`.
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Tunables of the consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Max entries fetched per read.
    pub read_count: usize,
    /// Blocking read budget.
    pub block: Duration,
    /// Idle time after which pending entries are reclaimed.
    pub idle_reclaim: Duration,
    /// Max pending entries reclaimed per pass.
    pub pending_reclaim_count: usize,
    /// Delivery attempts before dead-lettering.
    pub max_attempts: u64,
    /// Attempt counter and idempotence marker lifetime.
    pub dedupe_ttl: Duration,
    /// Per-handler wall-clock budget; a timeout counts as a transient
    /// failure so the entry reclaims. `None` disables the limit.
    pub handler_timeout: Option<Duration>,
}

impl From<&RuntimeConfig> for ConsumerOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            read_count: config.read_count,
            block: config.block(),
            idle_reclaim: config.idle_reclaim(),
            pending_reclaim_count: config.pending_reclaim_count,
            max_attempts: config.max_attempts,
            dedupe_ttl: config.dedupe_ttl(),
            handler_timeout: config.handler_timeout(),
        }
    }
}

//─────────────────────────────
//  Consumer
//─────────────────────────────

/// Generic reliable processor bound to one consumer group.
pub struct StreamConsumer {
    substrate: Arc<dyn Substrate>,
    registry: Arc<SchemaRegistry>,
    handler: Arc<dyn EventHandler>,
    dlq: DlqPublisher,
    guard: IdempotenceGuard,
    keys: KeySpace,
    binding: ConsumerBinding,
    opts: ConsumerOptions,
}

impl StreamConsumer {
    /// Assemble a consumer from its parts.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        registry: Arc<SchemaRegistry>,
        handler: Arc<dyn EventHandler>,
        dlq: DlqPublisher,
        keys: KeySpace,
        binding: ConsumerBinding,
        opts: ConsumerOptions,
    ) -> Self {
        let guard = IdempotenceGuard::new(substrate.clone(), keys.clone(), opts.dedupe_ttl);
        Self {
            substrate,
            registry,
            handler,
            dlq,
            guard,
            keys,
            binding,
            opts,
        }
    }

    /// Consumer group this loop belongs to.
    pub fn group(&self) -> &str {
        &self.binding.group
    }

    /// Run the consumer loop until `cancel` fires.
    ///
    /// A graceful stop finishes the entry currently in the handler but never
    /// acks on its behalf; anything unacked is redelivered and absorbed by
    /// the idempotence guard.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.substrate
            .ensure_group(&self.binding.stream, &self.binding.group)
            .await?;
        info!(
            stream = %self.binding.stream,
            group = %self.binding.group,
            consumer = %self.binding.consumer,
            "consumer loop started"
        );

        while !cancel.is_cancelled() {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.substrate.read_group(
                    &self.binding.stream,
                    &self.binding.group,
                    &self.binding.consumer,
                    self.opts.read_count,
                    self.opts.block,
                ) => read?,
            };

            let batch = if batch.is_empty() {
                self.substrate
                    .claim_idle(
                        &self.binding.stream,
                        &self.binding.group,
                        &self.binding.consumer,
                        self.opts.idle_reclaim,
                        self.opts.pending_reclaim_count,
                    )
                    .await?
            } else {
                batch
            };

            for entry in &batch {
                if let Err(e) = self.process_entry(entry).await {
                    // Substrate trouble; the entry stays pending and will be
                    // reclaimed, so log and keep the loop alive.
                    error!(entry_id = %entry.id, error = %e, "entry processing failed");
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        info!(
            group = %self.binding.group,
            consumer = %self.binding.consumer,
            "consumer loop stopped"
        );
        Ok(())
    }

    /// One non-blocking pass: read, fall back to reclaim, process.
    ///
    /// Returns the number of entries taken from the stream. Used by tests
    /// and by callers that drive the loop themselves.
    pub async fn poll_once(&self) -> Result<usize> {
        self.substrate
            .ensure_group(&self.binding.stream, &self.binding.group)
            .await?;
        let batch = self
            .substrate
            .read_group(
                &self.binding.stream,
                &self.binding.group,
                &self.binding.consumer,
                self.opts.read_count,
                Duration::ZERO,
            )
            .await?;
        let batch = if batch.is_empty() {
            self.substrate
                .claim_idle(
                    &self.binding.stream,
                    &self.binding.group,
                    &self.binding.consumer,
                    self.opts.idle_reclaim,
                    self.opts.pending_reclaim_count,
                )
                .await?
        } else {
            batch
        };
        for entry in &batch {
            self.process_entry(entry).await?;
        }
        Ok(batch.len())
    }

    //───────────────────── pipeline ─────────────────────

    async fn process_entry(&self, entry: &StreamEntry) -> Result<()> {
        // 1. Decode.
        let envelope = match EventEnvelope::decode(&entry.fields) {
            Ok(envelope) => envelope,
            Err(DecodeError::MissingEventField) | Err(DecodeError::InvalidJson(_))
            | Err(DecodeError::Oversized(_)) => {
                self.dlq
                    .publish("envelope_decode", &entry.fields, None)
                    .await?;
                return self.ack(entry).await;
            }
        };

        // 2. Envelope contract.
        if let Err(failure) = self.registry.validate_envelope(&envelope.to_value()) {
            self.dlq
                .publish("envelope_validation", &entry.fields, failure.schema_id())
                .await?;
            return self.ack(entry).await;
        }

        // 3. Payload contract.
        if let Err(failure) = self
            .registry
            .validate_payload(&envelope.event_type, &envelope.payload)
        {
            let reason = match &failure {
                ValidationFailure::UnknownType(_) => "unknown_event_type",
                ValidationFailure::Violation { .. } => "payload_validation",
            };
            self.dlq
                .publish(reason, &entry.fields, failure.schema_id())
                .await?;
            return self.ack(entry).await;
        }

        // 4. Idempotence.
        if !self
            .guard
            .mark_if_new(&self.binding.group, &envelope.event_id)
            .await?
        {
            debug!(
                group = %self.binding.group,
                event_id = %envelope.event_id,
                "duplicate delivery absorbed"
            );
            return self.ack(entry).await;
        }

        // 5. Handler, under the optional wall-clock budget.
        let outcome = match self.opts.handler_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.handler.handle(&envelope, &entry.fields))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(HandlerError::Retryable(format!(
                        "handler exceeded {}ms",
                        limit.as_millis()
                    ))),
                }
            }
            None => self.handler.handle(&envelope, &entry.fields).await,
        };
        match outcome {
            Ok(()) => {
                // Attempt bookkeeping is only needed while the entry fails.
                let _ = self
                    .substrate
                    .delete(&self.keys.attempts(&self.binding.group, &envelope.event_id))
                    .await;
                self.ack(entry).await
            }
            Err(HandlerError::Retryable(message)) => {
                let attempts = self
                    .substrate
                    .incr_ttl(
                        &self.keys.attempts(&self.binding.group, &envelope.event_id),
                        self.opts.dedupe_ttl,
                    )
                    .await?;
                if attempts >= self.opts.max_attempts {
                    warn!(
                        group = %self.binding.group,
                        event_id = %envelope.event_id,
                        attempts,
                        "attempt budget exhausted"
                    );
                    self.dlq
                        .publish("max_attempts_exhausted", &entry.fields, None)
                        .await?;
                    return self.ack(entry).await;
                }
                // Reopen the guard so the reclaimed delivery reaches the
                // handler again.
                self.guard
                    .clear(&self.binding.group, &envelope.event_id)
                    .await?;
                warn!(
                    group = %self.binding.group,
                    event_id = %envelope.event_id,
                    attempts,
                    max_attempts = self.opts.max_attempts,
                    message = %message,
                    "handler failed, awaiting reclaim"
                );
                Ok(())
            }
            Err(HandlerError::Fatal { reason, message }) => {
                error!(
                    group = %self.binding.group,
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    reason = %reason,
                    message = %message,
                    "handler failed terminally"
                );
                self.dlq.publish(&reason, &entry.fields, None).await?;
                self.ack(entry).await
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<()> {
        self.substrate
            .ack(&self.binding.stream, &self.binding.group, &entry.id)
            .await
    }
}
