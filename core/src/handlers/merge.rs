//! `merge` (spec §4.6, sync shape): classify `items[]` into visual and
//! audio-overlay groups, probe the first visual item for target
//! resolution, and delegate the actual concatenation/mixing to the media
//! service — the spec treats FFmpeg as a black-box HTTP collaborator, so
//! this handler's job is request assembly, not filter-graph construction.

use async_trait::async_trait;

use super::{HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::provider::{job_output_path, MergeRequest, UploadOptions};
use crate::types::{JobResult, MediaOutput, MediaType};

pub struct MergeHandler {
    pub deps: HandlerDeps,
}

#[async_trait]
impl OperationHandler for MergeHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let items = ctx
            .params
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::ParamValidation("items is required".to_string()))?;

        let mut visual = Vec::new();
        let mut audio_overlays = Vec::new();
        for item in items {
            match item.get("type").and_then(|v| v.as_str()) {
                Some("audio") => audio_overlays.push(item.clone()),
                _ => visual.push(item.clone()),
            }
        }
        if visual.is_empty() {
            return Err(CoreError::ParamValidation(
                "merge requires at least one visual item".to_string(),
            ));
        }

        ctx.report("probing target resolution", 10.0);
        let first_url = visual[0]
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParamValidation("visual item missing url".to_string()))?;
        let (width, height) = self.deps.media.probe_dimensions(first_url).await?;

        ctx.report("merging", 40.0);
        let req = MergeRequest {
            items: serde_json::json!({
                "visual": visual,
                "audioOverlays": audio_overlays,
                "targetWidth": width,
                "targetHeight": height,
            }),
        };
        let response = self.deps.media.merge(req).await?;
        let media_url = response
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Provider("merge response missing url".to_string()))?;

        ctx.report("uploading", 85.0);
        let path = job_output_path(ctx.execution_id, &ctx.job_id, "mp4");
        let final_url = self
            .deps
            .storage
            .upload_from_url(
                &path,
                media_url,
                UploadOptions {
                    content_type: Some("video/mp4".to_string()),
                    organization_id: None,
                },
            )
            .await?;

        Ok(HandlerOutcome::Completed(JobResult::completed(vec![MediaOutput {
            kind: MediaType::Video,
            url: final_url,
            mime_type: Some("video/mp4".to_string()),
        }])))
    }
}
