//! Webhook intake: validate, dedup, enqueue.

pub mod payload;
pub mod signature;

use std::sync::Arc;

use dispatch_common::{BOARD_CARD_KEY, Job, JobEvent, JobEventKind, JobId};
use serde_json::Value;

use crate::board::BoardListMapping;
use crate::errors::{IntakeError, ValidationError};
use crate::events::EventBus;
use crate::queue::JobQueue;

pub use payload::ParsedEvent;
pub use signature::{SIGNATURE_HEADER, sign, verify_signature};

/// Sources whose jobs may be created without a delivery id.
const SYNTHETIC_SOURCES: &[&str] = &["manual"];

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub source: String,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    Enqueued(JobId),
    /// The delivery was already accepted once. Not an error.
    DuplicateIgnored,
    /// A known event that does not create work.
    Skipped { reason: String },
}

/// Turns webhook deliveries into queued jobs for one workspace.
pub struct WebhookProcessor {
    workspace_id: String,
    queue: Arc<dyn JobQueue>,
    events: EventBus,
    board: BoardListMapping,
}

impl WebhookProcessor {
    pub fn new(
        workspace_id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        events: EventBus,
        board: BoardListMapping,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            queue,
            events,
            board,
        }
    }

    /// The delivery id is marked processed only after `enqueue` returns,
    /// so a crash in between leaves a redelivery that enqueue dedups on
    /// its own rather than a lost job.
    pub async fn process(&self, request: WebhookRequest) -> Result<IntakeOutcome, IntakeError> {
        let delivery_id = request
            .delivery_id
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        if delivery_id.is_none() && !SYNTHETIC_SOURCES.contains(&request.source.as_str()) {
            return Err(ValidationError::MissingDeliveryId {
                source_name: request.source,
            }
            .into());
        }

        let (payload, card_ref) = match payload::parse(
            &request.source,
            &request.event_type,
            &request.payload,
            &self.board,
        )? {
            ParsedEvent::Job { payload, card_ref } => (payload, card_ref),
            ParsedEvent::Skip { reason } => {
                tracing::debug!(
                    workspace = %self.workspace_id,
                    source = %request.source,
                    event_type = %request.event_type,
                    reason = %reason,
                    "Webhook skipped"
                );
                return Ok(IntakeOutcome::Skipped { reason });
            }
        };

        if let Some(delivery_id) = &delivery_id
            && self.queue.exists_by_delivery(delivery_id).await?
        {
            tracing::info!(
                workspace = %self.workspace_id,
                delivery_id = %delivery_id,
                "Duplicate delivery ignored"
            );
            return Ok(IntakeOutcome::DuplicateIgnored);
        }

        let mut job = Job::new(&request.source, &request.event_type, payload);
        if let Some(delivery_id) = &delivery_id {
            job = job.with_delivery_id(delivery_id);
        }
        if let Some(card) = &card_ref {
            job = job.with_metadata(BOARD_CARD_KEY, card);
        }
        let new_id = job.id;

        let job_id = self.queue.enqueue(job).await?;
        if let Some(delivery_id) = &delivery_id {
            self.queue.mark_delivery_processed(delivery_id).await?;
        }

        // Enqueue dedups on delivery id; a different id means a redelivery
        // raced past `exists_by_delivery`.
        if job_id != new_id {
            return Ok(IntakeOutcome::DuplicateIgnored);
        }

        tracing::info!(
            workspace = %self.workspace_id,
            job_id = %job_id,
            source = %request.source,
            event_type = %request.event_type,
            delivery_id = delivery_id.as_deref().unwrap_or("-"),
            "Job enqueued"
        );
        self.events.publish(
            JobEvent::new(&self.workspace_id, job_id, JobEventKind::Created).with_card_ref(card_ref),
        );
        Ok(IntakeOutcome::Enqueued(job_id))
    }
}
