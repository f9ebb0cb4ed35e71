//! Execution Store (C2, spec §4.2, §3). Transactional read/write access to
//! Execution and JobNode rows. Every state-machine transition in the
//! orchestrator is a single guarded write here, so the VM and engine of
//! the teacher's design — "operate exclusively through this trait,
//! enabling pluggable backends" — carries over directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{Execution, ExecutionStatus, JobNode, JobProgress, JobResult, WaitingStrategy};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ── Execution ──

    async fn save_execution(&self, execution: &Execution, jobs: &[JobNode]) -> Result<(), CoreError>;
    async fn load_execution(&self, id: Uuid) -> Result<Option<Execution>, CoreError>;

    /// CAS: `pending -> processing` (spec §3 "status transitions follow
    /// {pending -> processing -> completed|failed}"). Returns `false` if
    /// the execution was not `pending` (already advanced by a racing
    /// emit).
    async fn try_mark_execution_processing(&self, id: Uuid) -> Result<bool, CoreError>;

    /// CAS: only writes if the execution is still non-terminal. Returns
    /// `true` if this call performed the transition.
    async fn finalize_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<JobResult>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// CAS on `webhook_delivered_at IS NULL` (spec §4.8 dedup rule).
    /// Returns `true` if this call set it.
    async fn mark_execution_webhook_delivered(&self, id: Uuid) -> Result<bool, CoreError>;

    /// Executions whose status is non-terminal — the recovery bootstrap
    /// scans this on startup (spec §4.4 "Recovery").
    async fn list_non_terminal_executions(&self) -> Result<Vec<Uuid>, CoreError>;

    // ── Job nodes ──

    async fn load_job_node(&self, execution_id: Uuid, job_id: &str) -> Result<Option<JobNode>, CoreError>;

    /// Looked up by the worker loop via the internal `record_id` carried
    /// in the queue ticket payload (spec §4.5 step 2).
    async fn load_job_node_by_record_id(
        &self,
        record_id: Uuid,
    ) -> Result<Option<(Uuid, JobNode)>, CoreError>;

    async fn load_job_nodes(&self, execution_id: Uuid) -> Result<Vec<JobNode>, CoreError>;

    /// CAS: `pending -> processing`, setting `queue_ticket_id` and
    /// `started_at` in the same write as the caller's queue `send` (spec
    /// §4.4 "Emit": "in the same transaction"). Returns `false` if the
    /// job was not `pending` (already emitted by a racing reaction).
    async fn try_mark_processing(
        &self,
        execution_id: Uuid,
        job_id: &str,
        queue_ticket_id: Uuid,
    ) -> Result<bool, CoreError>;

    /// CAS: `processing -> completed`. Returns `false` if the job was
    /// already terminal (duplicate completion, spec §8 idempotence).
    async fn complete_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        result: JobResult,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// CAS: `pending|processing -> failed`. Returns `false` if already terminal.
    async fn fail_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        error: String,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn update_job_async_state(
        &self,
        execution_id: Uuid,
        job_id: &str,
        waiting_strategy: WaitingStrategy,
        provider_job_id: Option<String>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    async fn update_job_progress(
        &self,
        execution_id: Uuid,
        job_id: &str,
        progress: JobProgress,
        stage: String,
    ) -> Result<(), CoreError>;

    /// CAS on `action_logged = false` (spec §4.5 step 4). Returns `true`
    /// if this call performed the transition (i.e. the usage-log write
    /// should proceed).
    async fn mark_action_logged(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError>;

    /// CAS on `webhook_delivered_at IS NULL` for a job row.
    async fn mark_job_webhook_delivered(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError>;

    /// Processing jobs with `waiting_strategy = polling` and
    /// `next_poll_at <= now`, across all executions — feeds the poller
    /// (spec §4.7 "Poller").
    async fn list_pollable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, JobNode)>, CoreError>;
}
