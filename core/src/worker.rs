//! Pipeline Worker (C5, spec §4.5). One loop instance per operation topic;
//! run N instances of `run_once`/`run` concurrently for parallelism, the
//! same "N instances of the same loop per topic" model the teacher uses
//! for its own bytecode-fiber dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::handlers::{HandlerContext, HandlerOutcome, OperationHandler};
use crate::orchestrator::Orchestrator;
use crate::queue::{JobPayload, Queue, SendOptions, TicketPayload, TOPIC_JOB_WEBHOOK_DELIVERY};
use crate::store::ExecutionStore;
use crate::types::JobProgress;

/// How long the worker sleeps between empty pulls before trying again.
const IDLE_BACKOFF: Duration = Duration::from_millis(250);

pub struct PipelineWorker {
    topic: String,
    queue: Arc<dyn Queue>,
    store: Arc<dyn ExecutionStore>,
    orchestrator: Arc<Orchestrator>,
    handler: Arc<dyn OperationHandler>,
}

impl PipelineWorker {
    pub fn new(
        topic: impl Into<String>,
        queue: Arc<dyn Queue>,
        store: Arc<dyn ExecutionStore>,
        orchestrator: Arc<Orchestrator>,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            topic: topic.into(),
            queue,
            store,
            orchestrator,
            handler,
        }
    }

    /// Runs until the process is shut down. Intended to be spawned as its
    /// own task; spawn several for parallelism within a topic (spec §4.5
    /// "Concurrency model").
    pub async fn run(&self) -> ! {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_BACKOFF).await,
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "pipeline worker iteration failed");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }
    }

    /// One pull-process-ack cycle. Returns `Ok(true)` if a ticket was
    /// pulled (whether or not it did useful work), `Ok(false)` if the
    /// topic was empty.
    pub async fn run_once(&self) -> Result<bool, CoreError> {
        let Some(ticket) = self.queue.pull(&self.topic).await? else {
            return Ok(false);
        };

        let TicketPayload::Job(payload) = ticket.payload.clone() else {
            tracing::warn!(ticket_id = %ticket.id, "non-job ticket pulled on operation topic");
            self.queue.complete(ticket.id).await?;
            return Ok(true);
        };

        if let Err(e) = self.process(&payload).await {
            tracing::error!(
                job_id = %payload.job_id,
                execution_id = %payload.execution_id,
                error = %e,
                "job processing failed"
            );
            // The JobNode status is the authority (spec §4.5 step 4): once
            // `fail_job` has written `failed`, we ack the ticket rather
            // than let the queue retry a dead job.
            self.queue.complete(ticket.id).await?;
            return Ok(true);
        }

        self.queue.complete(ticket.id).await?;
        Ok(true)
    }

    async fn process(&self, payload: &JobPayload) -> Result<(), CoreError> {
        let Some((execution_id, node)) = self.store.load_job_node_by_record_id(payload.job_record_id).await? else {
            tracing::warn!(job_record_id = %payload.job_record_id, "job record vanished before processing");
            return Ok(());
        };

        if node.status != crate::types::JobStatus::Processing {
            // Duplicate delivery: already handled by another worker, or
            // raced with a cascade failure.
            return Ok(());
        }

        let store = self.store.clone();
        let progress_execution_id = execution_id;
        let progress_job_id = payload.job_id.clone();
        let progress = move |stage: String, pct: f32| {
            let store = store.clone();
            let job_id = progress_job_id.clone();
            tokio::spawn(async move {
                let (stage, progress) = JobProgress::new(stage, pct);
                let _ = store
                    .update_job_progress(progress_execution_id, &job_id, progress, stage)
                    .await;
            });
        };

        let ctx = HandlerContext {
            execution_id,
            job_id: payload.job_id.clone(),
            params: payload.params.clone(),
            dependencies: payload.dependencies.clone(),
            progress: Box::new(progress),
        };

        match self.handler.handle(ctx).await {
            Ok(HandlerOutcome::Completed(result)) => {
                self.on_completed(execution_id, &payload.job_id, result).await
            }
            Ok(HandlerOutcome::AsyncStarted {
                waiting_strategy,
                provider_job_id,
                next_poll_at,
            }) => {
                self.store
                    .update_job_async_state(execution_id, &payload.job_id, waiting_strategy, Some(provider_job_id), next_poll_at)
                    .await?;
                Ok(())
            }
            Err(e) => self.on_failed(execution_id, &payload.job_id, e.job_error_message()).await,
        }
    }

    async fn on_completed(
        &self,
        execution_id: Uuid,
        job_id: &str,
        result: crate::types::JobResult,
    ) -> Result<(), CoreError> {
        let completed = self
            .store
            .complete_job(execution_id, job_id, result, Utc::now())
            .await?;
        if !completed {
            return Ok(());
        }

        self.orchestrator
            .check_and_emit_dependent_jobs(execution_id, job_id)
            .await?;

        let node = self
            .store
            .load_job_node(execution_id, job_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;

        if node.send_job_webhook() {
            if let Some(execution) = self.store.load_execution(execution_id).await? {
                if execution.webhook.is_some() {
                    self.queue
                        .send(
                            TOPIC_JOB_WEBHOOK_DELIVERY,
                            TicketPayload::JobWebhook {
                                execution_id,
                                job_id: job_id.to_string(),
                            },
                            SendOptions::default(),
                        )
                        .await?;
                }
            }
        }

        if self.store.mark_action_logged(execution_id, job_id).await? {
            tracing::info!(execution_id = %execution_id, job_id, "job usage logged");
        }

        Ok(())
    }

    async fn on_failed(&self, execution_id: Uuid, job_id: &str, message: String) -> Result<(), CoreError> {
        self.store
            .fail_job(execution_id, job_id, message, Utc::now())
            .await?;
        self.orchestrator
            .check_and_emit_dependent_jobs(execution_id, job_id)
            .await?;
        Ok(())
    }
}
