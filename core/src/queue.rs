//! Persistent Queue (C1, spec §4.1). Per-topic durable FIFO with
//! at-least-once delivery, visibility timeout, retry with backoff, and
//! expiration/archival. Mirrors the teacher's `ProcessStore` trait shape:
//! a narrow async trait, organized by concern, implemented by both an
//! in-memory and a Postgres backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{DepResults, OperationKind};

/// Internal queue topics, in addition to one topic per `OperationKind`.
pub const TOPIC_WEBHOOK_DELIVERY: &str = "webhook-delivery";
pub const TOPIC_JOB_WEBHOOK_DELIVERY: &str = "job-webhook-delivery";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
}

/// The job payload carried by an operation-topic ticket (spec §3
/// "QueueTicket"). Webhook-delivery tickets carry a `WebhookDeliveryPayload`
/// instead — see `webhook.rs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobPayload {
    pub execution_id: Uuid,
    pub job_record_id: Uuid,
    pub job_id: String,
    pub operation: OperationKind,
    pub params: serde_json::Value,
    pub dependencies: DepResults,
}

/// Discriminates the payload shapes a ticket can carry. Keeping this as a
/// single enum (rather than one queue-per-payload-type) mirrors the
/// teacher's single `ProcessStore` trait covering heterogeneous concerns
/// behind one interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TicketPayload {
    Job(JobPayload),
    ExecutionWebhook { execution_id: Uuid },
    JobWebhook { execution_id: Uuid, job_id: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueTicket {
    pub id: Uuid,
    pub topic: String,
    pub payload: TicketPayload,
    pub state: TicketState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// How long a `pull` makes this ticket invisible to other workers
    /// (spec §4.1(b)), carried from the `send` call's `SendOptions` so
    /// `pull` can apply the caller's configured window rather than a
    /// hardcoded one.
    pub visibility_timeout_secs: i64,
    pub visible_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct SendOptions {
    pub visibility_timeout_secs: i64,
    pub max_attempts: u32,
    pub expire_in_hours: i64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_attempts: 5,
            expire_in_hours: 24,
        }
    }
}

/// Computes the next retry delay for a failed ticket. Exponential backoff,
/// base 2s, capped at 5 minutes — matches the "configurable retry limit
/// with exponential backoff" requirement of spec §4.1(c) without
/// introducing unbounded waits.
pub fn backoff_delay_secs(attempt: u32) -> i64 {
    let capped_attempt = attempt.min(8);
    (2i64.saturating_pow(capped_attempt)).min(300)
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a new ticket. Fails only on backing-store unavailability
    /// (spec §4.1 "Errors").
    async fn send(
        &self,
        topic: &str,
        payload: TicketPayload,
        opts: SendOptions,
    ) -> Result<Uuid, CoreError>;

    /// Pull one visible ticket from `topic` and mark it invisible until
    /// `visible_at` (the visibility timeout). Returns `None` if nothing is
    /// currently visible.
    async fn pull(&self, topic: &str) -> Result<Option<QueueTicket>, CoreError>;

    /// Mark a ticket delivered successfully.
    async fn complete(&self, ticket_id: Uuid) -> Result<(), CoreError>;

    /// Mark a delivery attempt failed. Retries (by becoming visible again
    /// after a backoff delay) until `max_attempts` is exhausted, at which
    /// point the ticket is marked `Failed` terminally.
    async fn fail(&self, ticket_id: Uuid, reason: &str) -> Result<(), CoreError>;

    /// Explicitly release a ticket back to visible immediately, without
    /// counting as a failed attempt (used when a worker finds the
    /// underlying job already terminal — a duplicate delivery, spec §4.5
    /// step 2 — and just wants to ack without side effects).
    async fn release(&self, ticket_id: Uuid) -> Result<(), CoreError>;

    async fn get(&self, ticket_id: Uuid) -> Result<Option<QueueTicket>, CoreError>;

    /// Archive any ticket older than its `expires_at` that never
    /// completed. Returns the number archived.
    async fn archive_expired(&self) -> Result<u64, CoreError>;
}
