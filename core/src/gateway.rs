//! Async Completion Gateway (C7, spec §4.7). Two ingresses — a webhook
//! callback parsed by the HTTP layer (server crate) and the poller below
//! — both funnel into `complete`/`fail`, which are idempotent on
//! JobNode id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::orchestrator::Orchestrator;
use crate::provider::{job_output_path, ProviderAdapter, ProviderJobStatus, Storage, UploadOptions};
use crate::queue::{Queue, TicketPayload, TOPIC_JOB_WEBHOOK_DELIVERY};
use crate::store::ExecutionStore;
use crate::types::{JobResult, MediaOutput, MediaType, WaitingStrategy};

const POLL_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const POLL_REQUEUE_SECS: i64 = 5;

pub struct CompletionGateway {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn Queue>,
    orchestrator: Arc<Orchestrator>,
    storage: Arc<dyn Storage>,
}

impl CompletionGateway {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn Queue>,
        orchestrator: Arc<Orchestrator>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            storage,
        }
    }

    /// Completion action (spec §4.7 "Completion action"): download each
    /// provider-hosted output to CDN, write the terminal transition, then
    /// react. Idempotent: a second call on an already-completed job is a
    /// no-op.
    pub async fn complete(&self, job_record_id: Uuid, outputs: Vec<MediaOutput>) -> Result<(), CoreError> {
        let Some((execution_id, node)) = self.store.load_job_node_by_record_id(job_record_id).await? else {
            tracing::warn!(job_record_id = %job_record_id, "completion for unknown job record");
            return Ok(());
        };
        if node.status != crate::types::JobStatus::Processing {
            return Ok(());
        }

        let mut final_outputs = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.into_iter().enumerate() {
            let ext = extension_for(output.kind, output.mime_type.as_deref());
            let path = if i == 0 {
                job_output_path(execution_id, &node.id, &ext)
            } else {
                format!("executions/{execution_id}/{}/output-{i}.{ext}", node.id)
            };
            let cdn_url = self
                .storage
                .upload_from_url(
                    &path,
                    &output.url,
                    UploadOptions {
                        content_type: output.mime_type.clone(),
                        organization_id: None,
                    },
                )
                .await?;
            final_outputs.push(MediaOutput {
                kind: output.kind,
                url: cdn_url,
                mime_type: output.mime_type,
            });
        }

        let result = JobResult::completed(final_outputs);
        let changed = self
            .store
            .complete_job(execution_id, &node.id, result, Utc::now())
            .await?;
        if !changed {
            return Ok(());
        }

        self.orchestrator
            .check_and_emit_dependent_jobs(execution_id, &node.id)
            .await?;

        if node.send_job_webhook() {
            if let Some(execution) = self.store.load_execution(execution_id).await? {
                if execution.webhook.is_some() {
                    self.queue
                        .send(
                            TOPIC_JOB_WEBHOOK_DELIVERY,
                            TicketPayload::JobWebhook {
                                execution_id,
                                job_id: node.id.clone(),
                            },
                            crate::queue::SendOptions::default(),
                        )
                        .await?;
                }
            }
        }

        if self.store.mark_action_logged(execution_id, &node.id).await? {
            tracing::info!(execution_id = %execution_id, job_id = %node.id, "job usage logged");
        }
        Ok(())
    }

    /// Failure action (spec §4.7 "Failure action").
    pub async fn fail(&self, job_record_id: Uuid, error: String) -> Result<(), CoreError> {
        let Some((execution_id, node)) = self.store.load_job_node_by_record_id(job_record_id).await? else {
            tracing::warn!(job_record_id = %job_record_id, "failure callback for unknown job record");
            return Ok(());
        };
        if node.status != crate::types::JobStatus::Processing {
            return Ok(());
        }
        let changed = self.store.fail_job(execution_id, &node.id, error, Utc::now()).await?;
        if changed {
            self.orchestrator
                .check_and_emit_dependent_jobs(execution_id, &node.id)
                .await?;
        }
        Ok(())
    }

    /// Background poller (spec §4.7 "Poller"). Runs until shut down.
    pub async fn run_poller(&self, provider: Arc<dyn ProviderAdapter>) -> ! {
        loop {
            if let Err(e) = self.poll_once(provider.as_ref()).await {
                tracing::error!(error = %e, "poller sweep failed");
            }
            tokio::time::sleep(POLL_SWEEP_INTERVAL).await;
        }
    }

    pub async fn poll_once(&self, provider: &dyn ProviderAdapter) -> Result<(), CoreError> {
        let now = Utc::now();
        let pollable = self.store.list_pollable_jobs(now).await?;
        for (execution_id, node) in pollable {
            let Some(provider_job_id) = node.provider_job_id.clone() else {
                continue;
            };
            match provider.get_job_status(&provider_job_id).await {
                Ok(report) => match report.status {
                    ProviderJobStatus::Completed => {
                        let raw = provider.get_raw_job_response(&provider_job_id).await?;
                        let outputs = normalize_provider_outputs(&raw)?;
                        self.complete(node.record_id, outputs).await?;
                    }
                    ProviderJobStatus::Failed => {
                        self.fail(
                            node.record_id,
                            report.error.unwrap_or_else(|| "provider reported failure".to_string()),
                        )
                        .await?;
                    }
                    ProviderJobStatus::Processing => {
                        self.store
                            .update_job_async_state(
                                execution_id,
                                &node.id,
                                WaitingStrategy::Polling,
                                Some(provider_job_id),
                                Some(now + chrono::Duration::seconds(POLL_REQUEUE_SECS)),
                            )
                            .await?;
                    }
                },
                Err(e) => {
                    tracing::warn!(job_id = %node.id, error = %e, "poll attempt failed, will retry");
                }
            }
        }
        Ok(())
    }
}

fn extension_for(kind: MediaType, mime_type: Option<&str>) -> String {
    if let Some(mime) = mime_type {
        if let Some(ext) = mime.split('/').nth(1) {
            return ext.to_string();
        }
    }
    match kind {
        MediaType::Video => "mp4",
        MediaType::Audio => "mp3",
        MediaType::Image => "png",
        MediaType::Transcript => "json",
    }
    .to_string()
}

/// Normalizes a provider's raw completion payload into `MediaOutput[]`
/// (spec §4.7: "fetches raw response, normalizes to outputs"). Accepts
/// the common shapes providers in this space use: an explicit
/// `outputs[]`, a singular `output`, or a bare `url`.
pub fn normalize_provider_outputs(raw: &serde_json::Value) -> Result<Vec<MediaOutput>, CoreError> {
    if let Some(outputs) = raw.get("outputs").and_then(|v| v.as_array()) {
        return outputs.iter().map(parse_output_object).collect();
    }
    if let Some(output) = raw.get("output") {
        return Ok(vec![parse_output_value(output)?]);
    }
    if let Some(url) = raw.get("url").and_then(|v| v.as_str()) {
        return Ok(vec![MediaOutput {
            kind: MediaType::Video,
            url: url.to_string(),
            mime_type: None,
        }]);
    }
    Err(CoreError::Provider(
        "provider response had no recognizable output shape".to_string(),
    ))
}

fn parse_output_value(value: &serde_json::Value) -> Result<MediaOutput, CoreError> {
    if let Some(url) = value.as_str() {
        return Ok(MediaOutput {
            kind: MediaType::Video,
            url: url.to_string(),
            mime_type: None,
        });
    }
    parse_output_object(value)
}

fn parse_output_object(value: &serde_json::Value) -> Result<MediaOutput, CoreError> {
    let url = value
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Provider("output object missing url".to_string()))?
        .to_string();
    let kind = match value.get("type").and_then(|v| v.as_str()) {
        Some("audio") => MediaType::Audio,
        Some("image") => MediaType::Image,
        Some("transcript") => MediaType::Transcript,
        _ => MediaType::Video,
    };
    let mime_type = value.get("mimeType").and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(MediaOutput { kind, url, mime_type })
}
