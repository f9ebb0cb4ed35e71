//! Operation Handlers (C6, spec §4.6). Two handler shapes, sync and
//! async, behind one contract: `OperationHandler::handle` always returns
//! a `HandlerOutcome`, and only the discriminant differs.

mod dispatch;
mod generate;
mod layer;
mod merge;
mod removebg;
mod subtitles;
mod transcribe;

pub use dispatch::Dispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::provider::{MediaService, ProviderAdapter, Storage};
use crate::types::{DepResults, JobResult, WaitingStrategy};
use std::sync::Arc;
use uuid::Uuid;

/// Reports a stage label and a 0-100 completion percentage; updates are
/// fire-and-forget from the handler's perspective (spec §4.5 step 3:
/// "a `progress(stage, pct)` callback which updates JobNode.progress").
pub type ProgressFn = Box<dyn Fn(String, f32) + Send + Sync>;

pub struct HandlerContext {
    pub execution_id: Uuid,
    pub job_id: String,
    pub params: serde_json::Value,
    pub dependencies: DepResults,
    pub progress: ProgressFn,
}

impl HandlerContext {
    pub fn report(&self, stage: impl Into<String>, pct: f32) {
        (self.progress)(stage.into(), pct);
    }
}

pub enum HandlerOutcome {
    Completed(JobResult),
    AsyncStarted {
        waiting_strategy: WaitingStrategy,
        provider_job_id: String,
        next_poll_at: Option<DateTime<Utc>>,
    },
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError>;
}

/// Shared collaborators every concrete handler closes over.
#[derive(Clone)]
pub struct HandlerDeps {
    pub provider: Arc<dyn ProviderAdapter>,
    pub storage: Arc<dyn Storage>,
    pub media: Arc<dyn MediaService>,
}

pub(crate) fn poll_in(secs: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(secs)
}
