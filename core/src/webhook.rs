//! Webhook Dispatcher (C8, spec §4.8). Consumes the `webhook-delivery`
//! and `job-webhook-delivery` topics and POSTs HMAC-signed bodies to the
//! execution's declared webhook URL, deduplicated by the store's
//! `webhookDeliveredAt` markers.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CoreError;
use crate::queue::{Queue, TicketPayload};
use crate::store::ExecutionStore;
use crate::types::{ExecutionStatus, JobStatus};

type HmacSha256 = Hmac<Sha256>;

const IDLE_BACKOFF: Duration = Duration::from_millis(250);

pub struct WebhookDispatcher {
    topic: String,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn Queue>,
    http: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(topic: impl Into<String>, store: Arc<dyn ExecutionStore>, queue: Arc<dyn Queue>) -> Self {
        Self {
            topic: topic.into(),
            store,
            queue,
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(&self) -> ! {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_BACKOFF).await,
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "webhook dispatcher iteration failed");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<bool, CoreError> {
        let Some(ticket) = self.queue.pull(&self.topic).await? else {
            return Ok(false);
        };

        let outcome = match ticket.payload.clone() {
            TicketPayload::ExecutionWebhook { execution_id } => self.deliver_execution(execution_id).await,
            TicketPayload::JobWebhook { execution_id, job_id } => self.deliver_job(execution_id, &job_id).await,
            TicketPayload::Job(_) => {
                tracing::warn!(ticket_id = %ticket.id, "job ticket pulled on webhook topic");
                Ok(())
            }
        };

        match outcome {
            Ok(()) => self.queue.complete(ticket.id).await?,
            Err(e) => self.queue.fail(ticket.id, &e.to_string()).await?,
        }
        Ok(true)
    }

    async fn deliver_execution(&self, execution_id: uuid::Uuid) -> Result<(), CoreError> {
        let Some(execution) = self.store.load_execution(execution_id).await? else {
            return Ok(());
        };
        let Some(url) = &execution.webhook else {
            return Ok(());
        };
        if execution.webhook_delivered_at.is_some() {
            return Ok(());
        }
        if execution.status != ExecutionStatus::Completed && execution.status != ExecutionStatus::Failed {
            return Ok(());
        }

        let body = serde_json::json!({
            "executionId": execution.id,
            "status": execution.status,
            "result": execution.result,
            "error": execution.error,
            "completedAt": execution.completed_at,
        });

        self.post(url, &body, execution.webhook_secret.as_deref()).await?;
        self.store.mark_execution_webhook_delivered(execution_id).await?;
        Ok(())
    }

    async fn deliver_job(&self, execution_id: uuid::Uuid, job_id: &str) -> Result<(), CoreError> {
        let Some(execution) = self.store.load_execution(execution_id).await? else {
            return Ok(());
        };
        let Some(url) = &execution.webhook else {
            return Ok(());
        };
        let Some(node) = self.store.load_job_node(execution_id, job_id).await? else {
            return Ok(());
        };
        if node.webhook_delivered_at.is_some() {
            return Ok(());
        }
        if node.status != JobStatus::Completed && node.status != JobStatus::Failed {
            return Ok(());
        }

        let body = serde_json::json!({
            "executionId": execution_id,
            "jobId": node.id,
            "operation": node.operation,
            "status": node.status,
            "result": node.result,
            "error": node.error,
            "completedAt": node.completed_at,
        });

        self.post(url, &body, execution.webhook_secret.as_deref()).await?;
        self.store.mark_job_webhook_delivered(execution_id, job_id).await?;
        Ok(())
    }

    async fn post(&self, url: &str, body: &serde_json::Value, secret: Option<&str>) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| CoreError::HandlerBug(format!("failed to serialize webhook body: {e}")))?;

        let mut request = self.http.post(url).header("Content-Type", "application/json");
        if let Some(secret) = secret {
            request = request.header("X-Signature", format!("sha256={}", sign(secret, &payload)));
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| CoreError::TransientInfra(format!("webhook POST to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::TransientInfra(format!(
                "webhook POST to {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// HMAC-SHA256 over the raw body bytes, hex-encoded (spec §4.8:
/// "the POST carries an HMAC-SHA256 signature over the body").
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_keyed() {
        let a = sign("secret-one", b"{\"a\":1}");
        let b = sign("secret-one", b"{\"a\":1}");
        let c = sign("secret-two", b"{\"a\":1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
