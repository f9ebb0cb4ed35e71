//! `transcribe` (spec §4.6): two-phase, driven synchronously within the
//! handler rather than through the async-completion gateway — extract
//! audio, hand it to the transcription provider, poll inline (capped at
//! 60 × 2s, spec §5 "Cancellation/timeouts"), normalize, upload, return.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::provider::{ProviderJobStatus, UploadOptions};
use crate::types::{JobResult, MediaOutput, MediaType};

const MAX_POLL_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct TranscriptWord {
    word: String,
    start: f64,
    end: f64,
}

pub struct TranscribeHandler {
    pub deps: HandlerDeps,
}

#[async_trait]
impl OperationHandler for TranscribeHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let video_url = ctx
            .params
            .get("video")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParamValidation("video is required".to_string()))?;
        let model_id = ctx
            .params
            .get("modelId")
            .and_then(|v| v.as_str())
            .unwrap_or("default-transcription");

        ctx.report("extracting audio", 10.0);
        let audio_bytes = self.deps.media.extract_audio(video_url).await?;

        let audio_path = format!("audio/{}.mp3", ctx.job_id);
        let audio_url = self
            .deps
            .storage
            .upload_bytes(
                &audio_path,
                audio_bytes,
                UploadOptions {
                    content_type: Some("audio/mpeg".to_string()),
                    organization_id: None,
                },
            )
            .await?;

        ctx.report("transcribing", 25.0);
        let params = serde_json::json!({ "audioUrl": audio_url });
        let provider_job_id = self.deps.provider.start_generation(model_id, &params, None).await?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > MAX_POLL_ATTEMPTS {
                return Err(CoreError::Provider(
                    "transcription timed out after 60 poll attempts".to_string(),
                ));
            }
            let status = self.deps.provider.get_job_status(&provider_job_id).await?;
            match status.status {
                ProviderJobStatus::Completed => break,
                ProviderJobStatus::Failed => {
                    return Err(CoreError::Provider(
                        status.error.unwrap_or_else(|| "transcription failed".to_string()),
                    ));
                }
                ProviderJobStatus::Processing => {
                    let pct = 25.0 + (attempts as f32 / MAX_POLL_ATTEMPTS as f32) * 60.0;
                    ctx.report("transcribing", pct);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        let raw = self.deps.provider.get_raw_job_response(&provider_job_id).await?;
        let words = normalize_transcript(&raw)?;

        ctx.report("uploading transcript", 90.0);
        let transcript_path = format!("transcripts/{}.json", ctx.job_id);
        let transcript_bytes = serde_json::to_vec(&words)
            .map_err(|e| CoreError::HandlerBug(format!("failed to serialize transcript: {e}")))?;
        let transcript_url = self
            .deps
            .storage
            .upload_bytes(
                &transcript_path,
                transcript_bytes,
                UploadOptions {
                    content_type: Some("application/json".to_string()),
                    organization_id: None,
                },
            )
            .await?;

        Ok(HandlerOutcome::Completed(JobResult::completed(vec![MediaOutput {
            kind: MediaType::Transcript,
            url: transcript_url,
            mime_type: Some("application/json".to_string()),
        }])))
    }
}

/// Normalizes the provider's diverse raw shapes to `[{word, start, end}]`
/// (spec §4.6 "Normalize the provider's diverse result shapes"). Accepts
/// either a top-level array or a `{words: [...]}` / `{segments: [...]}`
/// wrapper, the two shapes speech-to-text providers commonly return.
fn normalize_transcript(raw: &serde_json::Value) -> Result<Vec<TranscriptWord>, CoreError> {
    let items = if let Some(arr) = raw.as_array() {
        arr.clone()
    } else if let Some(arr) = raw.get("words").and_then(|v| v.as_array()) {
        arr.clone()
    } else if let Some(arr) = raw.get("segments").and_then(|v| v.as_array()) {
        arr.clone()
    } else {
        return Err(CoreError::Provider(
            "transcription response had no recognizable word/segment array".to_string(),
        ));
    };

    items
        .into_iter()
        .map(|item| {
            let word = item
                .get("word")
                .or_else(|| item.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let start = item.get("start").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let end = item.get("end").and_then(|v| v.as_f64()).unwrap_or(start);
            Ok(TranscriptWord { word, start, end })
        })
        .collect()
}
