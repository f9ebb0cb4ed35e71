use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::store::ExecutionStore;
use crate::types::{Execution, ExecutionStatus, JobNode, JobProgress, JobResult, JobStatus, WaitingStrategy};

struct Inner {
    executions: HashMap<Uuid, Execution>,
    jobs: HashMap<Uuid, HashMap<String, JobNode>>,
    record_index: HashMap<Uuid, (Uuid, String)>,
}

/// In-memory implementation of `ExecutionStore`, for tests and single-
/// process dev runs. Same shape as the teacher's `MemoryStore`: one
/// `RwLock`-guarded inner struct, no cross-row coordination beyond the
/// lock (good enough for single-process; Postgres provides the real
/// cross-process guarantees).
pub struct MemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                executions: HashMap::new(),
                jobs: HashMap::new(),
                record_index: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_execution(&self, execution: &Execution, jobs: &[JobNode]) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        w.executions.insert(execution.id, execution.clone());
        let mut by_id = HashMap::new();
        for job in jobs {
            w.record_index
                .insert(job.record_id, (execution.id, job.id.clone()));
            by_id.insert(job.id.clone(), job.clone());
        }
        w.jobs.insert(execution.id, by_id);
        Ok(())
    }

    async fn load_execution(&self, id: Uuid) -> Result<Option<Execution>, CoreError> {
        let r = self.inner.read().await;
        Ok(r.executions.get(&id).cloned())
    }

    async fn try_mark_execution_processing(&self, id: Uuid) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(execution) = w.executions.get_mut(&id) else {
            return Err(CoreError::NotFound(format!("execution {id}")));
        };
        if execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }
        execution.status = ExecutionStatus::Processing;
        Ok(true)
    }

    async fn finalize_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<JobResult>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(execution) = w.executions.get_mut(&id) else {
            return Err(CoreError::NotFound(format!("execution {id}")));
        };
        if matches!(execution.status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
            return Ok(false);
        }
        execution.status = status;
        execution.result = result;
        execution.error = error;
        execution.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn mark_execution_webhook_delivered(&self, id: Uuid) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(execution) = w.executions.get_mut(&id) else {
            return Err(CoreError::NotFound(format!("execution {id}")));
        };
        if execution.webhook_delivered_at.is_some() {
            return Ok(false);
        }
        execution.webhook_delivered_at = Some(Utc::now());
        Ok(true)
    }

    async fn list_non_terminal_executions(&self) -> Result<Vec<Uuid>, CoreError> {
        let r = self.inner.read().await;
        Ok(r.executions
            .values()
            .filter(|e| matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Processing))
            .map(|e| e.id)
            .collect())
    }

    async fn load_job_node(&self, execution_id: Uuid, job_id: &str) -> Result<Option<JobNode>, CoreError> {
        let r = self.inner.read().await;
        Ok(r.jobs.get(&execution_id).and_then(|m| m.get(job_id)).cloned())
    }

    async fn load_job_node_by_record_id(
        &self,
        record_id: Uuid,
    ) -> Result<Option<(Uuid, JobNode)>, CoreError> {
        let r = self.inner.read().await;
        let Some((execution_id, job_id)) = r.record_index.get(&record_id) else {
            return Ok(None);
        };
        let node = r.jobs.get(execution_id).and_then(|m| m.get(job_id)).cloned();
        Ok(node.map(|n| (*execution_id, n)))
    }

    async fn load_job_nodes(&self, execution_id: Uuid) -> Result<Vec<JobNode>, CoreError> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .get(&execution_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn try_mark_processing(
        &self,
        execution_id: Uuid,
        job_id: &str,
        queue_ticket_id: Uuid,
    ) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        if node.status != JobStatus::Pending {
            return Ok(false);
        }
        node.status = JobStatus::Processing;
        node.queue_ticket_id = Some(queue_ticket_id);
        node.started_at = Some(Utc::now());
        node.attempts += 1;
        Ok(true)
    }

    async fn complete_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        result: JobResult,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        if node.status != JobStatus::Processing {
            return Ok(false);
        }
        node.status = JobStatus::Completed;
        node.result = Some(result);
        node.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn fail_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        error: String,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        if matches!(node.status, JobStatus::Completed | JobStatus::Failed) {
            return Ok(false);
        }
        node.status = JobStatus::Failed;
        node.error = Some(error);
        node.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn update_job_async_state(
        &self,
        execution_id: Uuid,
        job_id: &str,
        waiting_strategy: WaitingStrategy,
        provider_job_id: Option<String>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        node.waiting_strategy = Some(waiting_strategy);
        node.provider_job_id = provider_job_id;
        node.next_poll_at = next_poll_at;
        Ok(())
    }

    async fn update_job_progress(
        &self,
        execution_id: Uuid,
        job_id: &str,
        progress: JobProgress,
        stage: String,
    ) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        node.progress_percent = Some(progress.percent);
        node.progress_stage = Some(stage);
        Ok(())
    }

    async fn mark_action_logged(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        if node.action_logged {
            return Ok(false);
        }
        node.action_logged = true;
        Ok(true)
    }

    async fn mark_job_webhook_delivered(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError> {
        let mut w = self.inner.write().await;
        let Some(node) = w.jobs.get_mut(&execution_id).and_then(|m| m.get_mut(job_id)) else {
            return Err(CoreError::NotFound(format!("job {job_id} in execution {execution_id}")));
        };
        if node.webhook_delivered_at.is_some() {
            return Ok(false);
        }
        node.webhook_delivered_at = Some(Utc::now());
        Ok(true)
    }

    async fn list_pollable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, JobNode)>, CoreError> {
        let r = self.inner.read().await;
        let mut out = Vec::new();
        for (execution_id, jobs) in r.jobs.iter() {
            for job in jobs.values() {
                if job.status == JobStatus::Processing
                    && job.waiting_strategy == Some(WaitingStrategy::Polling)
                    && job.next_poll_at.map(|t| t <= now).unwrap_or(false)
                {
                    out.push((*execution_id, job.clone()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, Plan};

    fn fixture(execution_id: Uuid, job_id: &str) -> (Execution, JobNode) {
        let now = Utc::now();
        let execution = Execution {
            id: execution_id,
            status: ExecutionStatus::Pending,
            plan: Plan {
                jobs: Vec::new(),
                base_execution_id: None,
            },
            base_execution_id: None,
            webhook: None,
            webhook_secret: None,
            organization_id: None,
            api_key_id: None,
            provider_api_keys: None,
            result: None,
            error: None,
            created_at: now,
            completed_at: None,
            webhook_delivered_at: None,
        };
        let job = JobNode {
            record_id: Uuid::new_v4(),
            id: job_id.to_string(),
            operation: OperationKind::Generate,
            params: serde_json::json!({}),
            dependencies: Vec::new(),
            result: None,
            error: None,
            status: JobStatus::Pending,
            provider_job_id: None,
            waiting_strategy: None,
            next_poll_at: None,
            progress_stage: None,
            progress_percent: None,
            attempts: 0,
            action_logged: false,
            queue_ticket_id: None,
            webhook_delivered_at: None,
            started_at: None,
            completed_at: None,
        };
        (execution, job)
    }

    #[tokio::test]
    async fn try_mark_processing_is_guarded_against_double_pull() {
        let store = MemoryExecutionStore::new();
        let (execution, job) = fixture(Uuid::new_v4(), "job-1");
        store.save_execution(&execution, &[job.clone()]).await.unwrap();

        let ticket = Uuid::new_v4();
        assert!(store
            .try_mark_processing(execution.id, "job-1", ticket)
            .await
            .unwrap());
        // Second attempt on the same (already-processing) job must lose the race.
        assert!(!store
            .try_mark_processing(execution.id, "job-1", Uuid::new_v4())
            .await
            .unwrap());

        let node = store.load_job_node(execution.id, "job-1").await.unwrap().unwrap();
        assert_eq!(node.status, JobStatus::Processing);
        assert_eq!(node.attempts, 1);
    }

    #[tokio::test]
    async fn complete_job_rejects_transition_from_non_processing() {
        let store = MemoryExecutionStore::new();
        let (execution, job) = fixture(Uuid::new_v4(), "job-1");
        store.save_execution(&execution, &[job.clone()]).await.unwrap();

        let result = JobResult {
            status: Some("completed".to_string()),
            outputs: Vec::new(),
            metadata: None,
            url: None,
            legacy_type: None,
            duration: None,
            mime_type: None,
            size: None,
        };
        // Job is still Pending, not Processing: completion must be refused.
        assert!(!store
            .complete_job(execution.id, "job-1", result.clone(), Utc::now())
            .await
            .unwrap());

        store.try_mark_processing(execution.id, "job-1", Uuid::new_v4()).await.unwrap();
        assert!(store
            .complete_job(execution.id, "job-1", result, Utc::now())
            .await
            .unwrap());
        // Already terminal: a second completion write must be a no-op.
        let node = store.load_job_node(execution.id, "job-1").await.unwrap().unwrap();
        assert_eq!(node.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn mark_action_logged_and_webhook_delivered_are_one_shot() {
        let store = MemoryExecutionStore::new();
        let (execution, job) = fixture(Uuid::new_v4(), "job-1");
        store.save_execution(&execution, &[job]).await.unwrap();

        assert!(store.mark_action_logged(execution.id, "job-1").await.unwrap());
        assert!(!store.mark_action_logged(execution.id, "job-1").await.unwrap());

        assert!(store
            .mark_job_webhook_delivered(execution.id, "job-1")
            .await
            .unwrap());
        assert!(!store
            .mark_job_webhook_delivered(execution.id, "job-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn load_job_node_by_record_id_resolves_through_the_index() {
        let store = MemoryExecutionStore::new();
        let (execution, job) = fixture(Uuid::new_v4(), "job-1");
        let record_id = job.record_id;
        store.save_execution(&execution, &[job]).await.unwrap();

        let (found_execution_id, node) = store
            .load_job_node_by_record_id(record_id)
            .await
            .unwrap()
            .expect("record should resolve");
        assert_eq!(found_execution_id, execution.id);
        assert_eq!(node.id, "job-1");

        assert!(store
            .load_job_node_by_record_id(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_non_terminal_executions_excludes_finalized_ones() {
        let store = MemoryExecutionStore::new();
        let (execution_a, job_a) = fixture(Uuid::new_v4(), "job-1");
        let (execution_b, job_b) = fixture(Uuid::new_v4(), "job-1");
        store.save_execution(&execution_a, &[job_a]).await.unwrap();
        store.save_execution(&execution_b, &[job_b]).await.unwrap();

        store
            .finalize_execution(execution_b.id, ExecutionStatus::Completed, None, None, Utc::now())
            .await
            .unwrap();

        let non_terminal = store.list_non_terminal_executions().await.unwrap();
        assert_eq!(non_terminal, vec![execution_a.id]);
    }
}
