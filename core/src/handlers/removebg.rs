//! `removeBackground` / `removeImageBackground` (spec §4.6: "always
//! async (provider-bound)"). Same shape as the generation handlers, kept
//! separate because the spec calls it out as a distinct, non-optional
//! behavior rather than a provider capability choice.

use async_trait::async_trait;

use super::{poll_in, HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::types::WaitingStrategy;

pub struct RemoveBackgroundHandler {
    pub deps: HandlerDeps,
    pub webhook_base_url: Option<String>,
}

#[async_trait]
impl OperationHandler for RemoveBackgroundHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let model_id = ctx
            .params
            .get("modelId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParamValidation("modelId is required".to_string()))?;

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
        let next_poll_at = matches!(waiting_strategy, WaitingStrategy::Polling).then(|| poll_in(5));

        Ok(HandlerOutcome::AsyncStarted {
            waiting_strategy,
            provider_job_id,
            next_poll_at,
        })
    }
}
