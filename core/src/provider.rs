//! Abstract external-collaborator contracts (spec §6). The core depends
//! only on these traits; concrete provider adapters, the CDN, and the
//! FFmpeg microservice are out of scope and are supplied by the binary
//! that wires a deployment together.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderJobStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ProviderJobStatusReport {
    pub status: ProviderJobStatus,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultStrategy {
    Webhook,
    Polling,
    Sync,
}

#[derive(Clone, Debug)]
pub struct ModelCapability {
    pub supports_webhooks: bool,
    pub default_strategy: DefaultStrategy,
}

/// A single external generation provider (Replicate/FAL/etc.), abstracted
/// to the three calls the core actually drives (spec §6 "Provider adapter
/// contract"). Parameter validation/result parsing beyond `MediaOutput[]`
/// is the adapter's concern, not the core's.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn start_generation(
        &self,
        model_id: &str,
        params: &serde_json::Value,
        webhook_url: Option<&str>,
    ) -> Result<String, CoreError>;

    async fn get_job_status(&self, provider_job_id: &str) -> Result<ProviderJobStatusReport, CoreError>;

    async fn get_raw_job_response(&self, provider_job_id: &str) -> Result<serde_json::Value, CoreError>;

    fn model_capability(&self, model_id: &str) -> ModelCapability;
}

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub organization_id: Option<String>,
}

/// CDN/object-storage contract (spec §6 "Storage contract"). Paths are
/// deterministic: handlers build them, this trait just moves bytes.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upload_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        opts: UploadOptions,
    ) -> Result<String, CoreError>;

    async fn upload_from_url(
        &self,
        path: &str,
        source_url: &str,
        opts: UploadOptions,
    ) -> Result<String, CoreError>;
}

pub fn job_output_path(execution_id: uuid::Uuid, job_id: &str, ext: &str) -> String {
    format!("executions/{execution_id}/{job_id}/output.{ext}")
}

#[derive(Clone, Debug, Serialize)]
pub struct MergeRequest {
    pub items: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct LayerRequest {
    pub base: serde_json::Value,
    pub overlays: serde_json::Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct BurnSubtitlesRequest {
    pub video_url: String,
    pub transcript: serde_json::Value,
}

/// The FFmpeg microservice (spec §6 "Media service"): treated as a
/// black-box HTTP collaborator. Handlers call through this trait rather
/// than shelling out to `ffmpeg` directly, matching the spec's explicit
/// non-goal of reimplementing media composition in-process.
#[async_trait]
pub trait MediaService: Send + Sync {
    async fn merge(&self, req: MergeRequest) -> Result<serde_json::Value, CoreError>;
    async fn layer(&self, req: LayerRequest) -> Result<serde_json::Value, CoreError>;
    async fn burn_subtitles(&self, req: BurnSubtitlesRequest) -> Result<serde_json::Value, CoreError>;
    async fn generate_subtitles(&self, transcript: serde_json::Value) -> Result<serde_json::Value, CoreError>;
    async fn extract_audio(&self, video_url: &str) -> Result<Vec<u8>, CoreError>;
    async fn probe_dimensions(&self, media_url: &str) -> Result<(u32, u32), CoreError>;
    async fn probe_duration(&self, media_url: &str) -> Result<f64, CoreError>;
}

/// Thin `reqwest`-backed `MediaService` client, the shape a deployment
/// wires in by default. Response parsing is left to the concrete
/// microservice's contract (spec: "implementation-level but stable").
pub struct HttpMediaService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMediaService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, CoreError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CoreError::TransientInfra(format!("media service request to {path} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::Provider(format!(
                "media service {path} returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| CoreError::TransientInfra(format!("media service {path} response parse failed: {e}")))
    }
}

#[async_trait]
impl MediaService for HttpMediaService {
    async fn merge(&self, req: MergeRequest) -> Result<serde_json::Value, CoreError> {
        self.post_json("/merge", &serde_json::to_value(req.items).unwrap_or_default())
            .await
    }

    async fn layer(&self, req: LayerRequest) -> Result<serde_json::Value, CoreError> {
        let body = serde_json::json!({ "base": req.base, "overlays": req.overlays });
        self.post_json("/layer", &body).await
    }

    async fn burn_subtitles(&self, req: BurnSubtitlesRequest) -> Result<serde_json::Value, CoreError> {
        let body = serde_json::json!({ "videoUrl": req.video_url, "transcript": req.transcript });
        self.post_json("/burn-subtitles", &body).await
    }

    async fn generate_subtitles(&self, transcript: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.post_json("/generate-subtitles", &transcript).await
    }

    async fn extract_audio(&self, video_url: &str) -> Result<Vec<u8>, CoreError> {
        let body = serde_json::json!({ "videoUrl": video_url });
        let value = self.post_json("/convert", &body).await?;
        let url = value
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Provider("convert response missing url".to_string()))?;
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| CoreError::TransientInfra(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn probe_dimensions(&self, media_url: &str) -> Result<(u32, u32), CoreError> {
        let body = serde_json::json!({ "mediaUrl": media_url });
        let value = self.post_json("/probe", &body).await?;
        let width = value.get("width").and_then(|v| v.as_u64()).unwrap_or(1920) as u32;
        let height = value.get("height").and_then(|v| v.as_u64()).unwrap_or(1080) as u32;
        Ok((width, height))
    }

    async fn probe_duration(&self, media_url: &str) -> Result<f64, CoreError> {
        let body = serde_json::json!({ "mediaUrl": media_url });
        let value = self.post_json("/probe", &body).await?;
        Ok(value.get("durationSecs").and_then(|v| v.as_f64()).unwrap_or(0.0))
    }
}
