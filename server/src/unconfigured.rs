//! Placeholder implementations of the external-collaborator traits
//! (spec §1 "out of scope"). A real deployment supplies its own
//! `ProviderAdapter` (Replicate/FAL/etc. clients) and `Storage` (CDN
//! upload) — these stand in so the binary links and runs end-to-end in
//! a dev environment, failing loudly rather than silently no-opping.

use async_trait::async_trait;

use mediaforge_core::error::CoreError;
use mediaforge_core::provider::{ModelCapability, ProviderAdapter, ProviderJobStatusReport, Storage, UploadOptions};

pub struct UnconfiguredProvider;

#[async_trait]
impl ProviderAdapter for UnconfiguredProvider {
    async fn start_generation(
        &self,
        model_id: &str,
        _params: &serde_json::Value,
        _webhook_url: Option<&str>,
    ) -> Result<String, CoreError> {
        Err(CoreError::Provider(format!(
            "no ProviderAdapter configured for model '{model_id}' — wire a real adapter in main.rs"
        )))
    }

    async fn get_job_status(&self, _provider_job_id: &str) -> Result<ProviderJobStatusReport, CoreError> {
        Err(CoreError::Provider("no ProviderAdapter configured".to_string()))
    }

    async fn get_raw_job_response(&self, _provider_job_id: &str) -> Result<serde_json::Value, CoreError> {
        Err(CoreError::Provider("no ProviderAdapter configured".to_string()))
    }

    fn model_capability(&self, _model_id: &str) -> ModelCapability {
        ModelCapability {
            supports_webhooks: false,
            default_strategy: mediaforge_core::provider::DefaultStrategy::Polling,
        }
    }
}

pub struct UnconfiguredStorage;

#[async_trait]
impl Storage for UnconfiguredStorage {
    async fn upload_bytes(&self, path: &str, _bytes: Vec<u8>, _opts: UploadOptions) -> Result<String, CoreError> {
        Err(CoreError::TransientInfra(format!(
            "no Storage backend configured, cannot upload to '{path}'"
        )))
    }

    async fn upload_from_url(&self, path: &str, _source_url: &str, _opts: UploadOptions) -> Result<String, CoreError> {
        Err(CoreError::TransientInfra(format!(
            "no Storage backend configured, cannot upload to '{path}'"
        )))
    }
}
