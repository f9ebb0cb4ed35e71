use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of work a job performs. Maps 1:1 onto a queue topic name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Generate,
    GenerateImage,
    GenerateAudio,
    Transcribe,
    Merge,
    Layer,
    AddSubtitles,
    Reframe,
    LipSync,
    RemoveBackground,
    RemoveImageBackground,
}

impl OperationKind {
    /// The queue topic a job of this operation is dispatched to. Same
    /// string in both directions: workers subscribe to `topic()`.
    pub fn topic(&self) -> &'static str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::GenerateImage => "generateImage",
            OperationKind::GenerateAudio => "generateAudio",
            OperationKind::Transcribe => "transcribe",
            OperationKind::Merge => "merge",
            OperationKind::Layer => "layer",
            OperationKind::AddSubtitles => "addSubtitles",
            OperationKind::Reframe => "reframe",
            OperationKind::LipSync => "lipSync",
            OperationKind::RemoveBackground => "removeBackground",
            OperationKind::RemoveImageBackground => "removeImageBackground",
        }
    }

    /// True for operations whose handler always runs async/provider-bound
    /// (§4.6: "removeBackground: always async").
    pub fn always_async(&self) -> bool {
        matches!(
            self,
            OperationKind::RemoveBackground | OperationKind::RemoveImageBackground
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitingStrategy {
    Sync,
    Webhook,
    Polling,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Image,
    Transcript,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaOutput {
    #[serde(rename = "type")]
    pub kind: MediaType,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Operation output. The current shape is `{status, outputs[], metadata?}`;
/// the legacy `{url, type?, duration?, mimeType?, size?}` shape is accepted
/// on read (older rows, some provider responses) but never emitted fresh —
/// see spec §3 "Result shape".
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<MediaOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    // Legacy fields, read-only in practice (never populated by this crate's
    // own writers, but present on rows/provider payloads written before the
    // outputs[] shape existed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub legacy_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl JobResult {
    pub fn completed(outputs: Vec<MediaOutput>) -> Self {
        Self {
            status: Some("completed".to_string()),
            outputs,
            ..Default::default()
        }
    }

    /// `outputs[0].url` if present, else the legacy top-level `url`.
    pub fn primary_url(&self) -> Option<&str> {
        self.outputs
            .first()
            .map(|o| o.url.as_str())
            .or(self.url.as_deref())
    }

    pub fn output_of_type(&self, kind: MediaType) -> Option<&MediaOutput> {
        self.outputs.iter().find(|o| o.kind == kind)
    }

    /// Normalize to `{url, status: "completed"}` for the execution-level
    /// result, per spec §4.4 "Execution terminal state".
    pub fn normalized_url_result(&self) -> Option<JobResult> {
        self.primary_url().map(|url| JobResult {
            status: Some("completed".to_string()),
            url: Some(url.to_string()),
            ..Default::default()
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: f32,
}

impl JobProgress {
    pub fn new(stage: impl Into<String>, percent: f32) -> (String, Self) {
        (stage.into(), Self { percent })
    }
}

/// One vertex of the DAG. `record_id` is the internal, store-assigned
/// identity used for queue-ticket addressing (`jobRecordId` in spec §4.5);
/// `id` is the client-supplied id used as a dependency reference target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobNode {
    pub record_id: Uuid,
    pub id: String,
    pub operation: OperationKind,
    pub params: serde_json::Value,
    pub dependencies: Vec<String>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub status: JobStatus,
    pub provider_job_id: Option<String>,
    pub waiting_strategy: Option<WaitingStrategy>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub progress_stage: Option<String>,
    pub progress_percent: Option<f32>,
    pub attempts: u32,
    pub action_logged: bool,
    pub queue_ticket_id: Option<Uuid>,
    pub webhook_delivered_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobNode {
    pub fn send_job_webhook(&self) -> bool {
        self.params
            .get("sendJobWebhook")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Immutable plan snapshot, as admitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub jobs: Vec<PlanJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_execution_id: Option<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanJob {
    pub id: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Options accompanying `createExecution` (spec §4.4, §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_api_keys: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_execution_id: Option<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub status: ExecutionStatus,
    pub plan: Plan,
    pub base_execution_id: Option<Uuid>,
    pub webhook: Option<String>,
    pub webhook_secret: Option<String>,
    pub organization_id: Option<String>,
    pub api_key_id: Option<String>,
    pub provider_api_keys: Option<serde_json::Value>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub webhook_delivered_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by the status endpoint's boundary (spec §6).
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionStatusView {
    pub id: Uuid,
    pub status: ExecutionStatus,
    pub jobs: Vec<JobStatusView>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStatusView {
    pub id: String,
    pub operation: OperationKind,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

impl From<&Execution> for ExecutionStatusView {
    fn from(e: &Execution) -> Self {
        Self {
            id: e.id,
            status: e.status,
            jobs: Vec::new(),
            result: e.result.clone(),
            error: e.error.clone(),
            created_at: e.created_at,
            completed_at: e.completed_at,
        }
    }
}

/// Resolved dependency results keyed by the producer job's client-supplied id.
pub type DepResults = BTreeMap<String, JobResult>;
