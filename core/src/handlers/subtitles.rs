//! `addSubtitles` (spec §4.6, sync shape): fetch the transcript (inline
//! or by URL), render ASS subtitle text through the media service, burn
//! it into the video, upload the result.

use async_trait::async_trait;

use super::{HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::provider::{job_output_path, BurnSubtitlesRequest, UploadOptions};
use crate::types::{JobResult, MediaOutput, MediaType};

pub struct AddSubtitlesHandler {
    pub deps: HandlerDeps,
    pub http: reqwest::Client,
}

#[async_trait]
impl OperationHandler for AddSubtitlesHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let video_url = ctx
            .params
            .get("video")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParamValidation("video is required".to_string()))?;

        ctx.report("fetching transcript", 10.0);
        let transcript = match ctx.params.get("transcript") {
            Some(serde_json::Value::String(url)) => self.fetch_transcript_json(url).await?,
            Some(inline) => inline.clone(),
            None => {
                return Err(CoreError::ParamValidation(
                    "transcript (inline or url) is required".to_string(),
                ))
            }
        };

        ctx.report("rendering subtitle track", 35.0);
        let ass = self.deps.media.generate_subtitles(transcript).await?;

        ctx.report("burning subtitles", 60.0);
        let response = self
            .deps
            .media
            .burn_subtitles(BurnSubtitlesRequest {
                video_url: video_url.to_string(),
                transcript: ass,
            })
            .await?;
        let media_url = response
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Provider("burn-subtitles response missing url".to_string()))?;

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

impl AddSubtitlesHandler {
    async fn fetch_transcript_json(&self, url: &str) -> Result<serde_json::Value, CoreError> {
        self.http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::TransientInfra(format!("fetching transcript {url}: {e}")))?
            .json()
            .await
            .map_err(|e| CoreError::TransientInfra(format!("parsing transcript {url}: {e}")))
    }
}
