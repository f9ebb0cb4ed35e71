//! `generate` / `generateImage` / `generateAudio` (spec §4.6, async
//! shape): validate params, start the provider job, and report a waiting
//! strategy without completing. Completion is driven later by the Async
//! Completion Gateway (C7) when the provider calls back or is polled.

use async_trait::async_trait;

use super::{poll_in, HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::types::WaitingStrategy;

pub struct GenerateHandler {
    pub deps: HandlerDeps,
    pub webhook_base_url: Option<String>,
}

fn require_model_id(params: &serde_json::Value) -> Result<&str, CoreError> {
    params
        .get("modelId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::ParamValidation("modelId is required".to_string()))
}

#[async_trait]
impl OperationHandler for GenerateHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let model_id = require_model_id(&ctx.params)?;
        ctx.report("validating", 5.0);

        let capability = self.deps.provider.model_capability(model_id);

        let webhook_url = if capability.supports_webhooks {
            self.webhook_base_url
                .as_ref()
                .map(|base| format!("{base}/jobs/{}/callback", ctx.job_id))
        } else {
            None
        };

        ctx.report("starting provider job", 15.0);
        let provider_job_id = self
            .deps
            .provider
            .start_generation(model_id, &ctx.params, webhook_url.as_deref())
            .await?;

        let waiting_strategy = if capability.supports_webhooks {
            WaitingStrategy::Webhook
        } else {
            WaitingStrategy::Polling
        };

        let next_poll_at = match waiting_strategy {
            WaitingStrategy::Polling => Some(poll_in(5)),
            _ => None,
        };

        Ok(HandlerOutcome::AsyncStarted {
            waiting_strategy,
            provider_job_id,
            next_poll_at,
        })
    }
}
