//! Orchestrator (C4, spec §4.4). Owns the DAG state machine. Exposes
//! exactly three operations; every other module calls into these rather
//! than touching JobNode status directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::CoreError;
use crate::queue::{JobPayload, Queue, SendOptions, TicketPayload, TOPIC_WEBHOOK_DELIVERY};
use crate::resolver::resolve_params;
use crate::store::ExecutionStore;
use crate::types::{
    DepResults, ExecuteOptions, Execution, ExecutionStatus, JobNode, JobStatus, Plan, PlanJob,
};

const DEPENDENCY_FAILURE_MESSAGE: &str = "Dependency job failed";

pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn Queue>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ExecutionStore>, queue: Arc<dyn Queue>) -> Self {
        Self { store, queue }
    }

    /// `createExecution(plan, options) -> executionId` (spec §4.4 "Plan
    /// admission"). `plan` is assumed already structurally validated
    /// (`plan::parse_plan`); this only checks the cross-execution
    /// dependency precondition that requires store access.
    pub async fn create_execution(
        &self,
        plan: Plan,
        options: ExecuteOptions,
    ) -> Result<Uuid, CoreError> {
        if plan.jobs.is_empty() {
            return Err(CoreError::PlanValidation("plan has no jobs".to_string()));
        }
        let base_execution_id = options.base_execution_id.or(plan.base_execution_id);
        self.check_base_execution_dependencies(&plan, base_execution_id).await?;

        let execution_id = Uuid::new_v4();
        let now = Utc::now();
        let execution = Execution {
            id: execution_id,
            status: ExecutionStatus::Pending,
            plan: Plan {
                jobs: plan.jobs.clone(),
                base_execution_id,
            },
            base_execution_id,
            webhook: options.webhook,
            webhook_secret: options.webhook_secret,
            organization_id: options.organization_id,
            api_key_id: options.api_key_id,
            provider_api_keys: options.provider_api_keys,
            result: None,
            error: None,
            created_at: now,
            completed_at: None,
            webhook_delivered_at: None,
        };

        let nodes: Vec<JobNode> = plan.jobs.iter().map(plan_job_to_node).collect();
        self.store.save_execution(&execution, &nodes).await?;

        self.emit_ready_jobs(execution_id, base_execution_id).await?;
        Ok(execution_id)
    }

    async fn check_base_execution_dependencies(
        &self,
        plan: &Plan,
        base_execution_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        let local_ids: std::collections::HashSet<&str> =
            plan.jobs.iter().map(|j| j.id.as_str()).collect();
        let dangling: Vec<&str> = plan
            .jobs
            .iter()
            .flat_map(|j| j.dependencies.iter())
            .map(|d| d.as_str())
            .filter(|d| !local_ids.contains(d))
            .collect();
        if dangling.is_empty() {
            return Ok(());
        }
        let Some(base_id) = base_execution_id else {
            return Err(CoreError::PlanValidation(format!(
                "job depends on unknown id '{}' and no baseExecutionId was given",
                dangling[0]
            )));
        };
        let base_nodes = self.store.load_job_nodes(base_id).await?;
        let base_ids: std::collections::HashSet<&str> =
            base_nodes.iter().map(|n| n.id.as_str()).collect();
        for dep in dangling {
            if !base_ids.contains(dep) {
                return Err(CoreError::PlanValidation(format!(
                    "job depends on unknown id '{dep}', not found in this plan or base execution {base_id}"
                )));
            }
        }
        Ok(())
    }

    /// `emitReadyJobs(executionId, baseExecutionId?)` — used on admission
    /// and recovery. Emits every ready job with no queue ticket yet.
    pub async fn emit_ready_jobs(
        &self,
        execution_id: Uuid,
        base_execution_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        let nodes = self.store.load_job_nodes(execution_id).await?;
        let base_nodes = match base_execution_id {
            Some(base_id) => self.store.load_job_nodes(base_id).await?,
            None => Vec::new(),
        };

        let by_id: HashMap<&str, &JobNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let base_by_id: HashMap<&str, &JobNode> =
            base_nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let ready: Vec<&JobNode> = nodes
            .iter()
            .filter(|n| n.status == JobStatus::Pending && n.queue_ticket_id.is_none())
            .filter(|n| is_ready(n, &by_id, &base_by_id))
            .collect();

        for node in ready {
            self.emit(execution_id, node, &by_id, &base_by_id).await?;
        }
        Ok(())
    }

    /// `checkAndEmitDependentJobs(executionId, completedJobId)` (spec §4.4
    /// "Reaction"). Invoked after any terminal job transition. Evaluates
    /// the full pending set once per call; cascades converge because a
    /// newly-failed job becomes a `completedJobId` candidate for the next
    /// invocation made by its own terminal-transition caller.
    pub async fn check_and_emit_dependent_jobs(
        &self,
        execution_id: Uuid,
        _completed_job_id: &str,
    ) -> Result<(), CoreError> {
        loop {
            let nodes = self.store.load_job_nodes(execution_id).await?;
            let execution = self
                .store
                .load_execution(execution_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("execution {execution_id}")))?;
            let base_nodes = match execution.base_execution_id {
                Some(base_id) => self.store.load_job_nodes(base_id).await?,
                None => Vec::new(),
            };
            let by_id: HashMap<&str, &JobNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
            let base_by_id: HashMap<&str, &JobNode> =
                base_nodes.iter().map(|n| (n.id.as_str(), n)).collect();

            let mut progressed = false;

            for node in nodes.iter().filter(|n| n.status == JobStatus::Pending) {
                let dep_statuses: Vec<Option<JobStatus>> = node
                    .dependencies
                    .iter()
                    .map(|d| {
                        by_id
                            .get(d.as_str())
                            .map(|n| n.status)
                            .or_else(|| base_by_id.get(d.as_str()).map(|n| n.status))
                    })
                    .collect();

                if dep_statuses.iter().any(|s| *s == Some(JobStatus::Failed)) {
                    let changed = self
                        .store
                        .fail_job(
                            execution_id,
                            &node.id,
                            DEPENDENCY_FAILURE_MESSAGE.to_string(),
                            Utc::now(),
                        )
                        .await?;
                    if changed {
                        progressed = true;
                    }
                } else if !dep_statuses.is_empty()
                    && dep_statuses.iter().all(|s| *s == Some(JobStatus::Completed))
                {
                    self.emit(execution_id, node, &by_id, &base_by_id).await?;
                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }

        self.maybe_finalize(execution_id).await?;
        Ok(())
    }

    /// `emit` (spec §4.4): compute depResults, resolve params, write the
    /// queue ticket and mark the job processing in the same logical step.
    async fn emit(
        &self,
        execution_id: Uuid,
        node: &JobNode,
        by_id: &HashMap<&str, &JobNode>,
        base_by_id: &HashMap<&str, &JobNode>,
    ) -> Result<(), CoreError> {
        let mut dep_results = DepResults::new();
        for dep in &node.dependencies {
            let producer = by_id.get(dep.as_str()).or_else(|| base_by_id.get(dep.as_str()));
            if let Some(producer) = producer {
                if let Some(result) = &producer.result {
                    dep_results.insert(dep.clone(), result.clone());
                }
            }
        }

        let effective_params = match resolve_params(&node.params, &dep_results) {
            Ok(params) => params,
            Err(e) => {
                self.store
                    .fail_job(execution_id, &node.id, e.to_string(), Utc::now())
                    .await?;
                return Ok(());
            }
        };

        let payload = TicketPayload::Job(JobPayload {
            execution_id,
            job_record_id: node.record_id,
            job_id: node.id.clone(),
            operation: node.operation,
            params: effective_params,
            dependencies: dep_results,
        });

        let ticket_id = self
            .queue
            .send(node.operation.topic(), payload, SendOptions::default())
            .await?;

        let marked = self
            .store
            .try_mark_processing(execution_id, &node.id, ticket_id)
            .await?;
        if marked {
            // First job to start moves the execution off `pending` (spec §3
            // "pending -> processing -> completed|failed"); a racing emit
            // for a sibling job just finds the CAS already flipped.
            self.store.try_mark_execution_processing(execution_id).await?;
        }
        Ok(())
    }

    /// Computes and writes execution terminal state if every JobNode is
    /// terminal (spec §4.4 "Execution terminal state"), then enqueues the
    /// execution webhook if one was declared.
    async fn maybe_finalize(&self, execution_id: Uuid) -> Result<(), CoreError> {
        let nodes = self.store.load_job_nodes(execution_id).await?;
        if nodes.is_empty() || !nodes.iter().all(|n| is_terminal(n.status)) {
            return Ok(());
        }

        let failed: Vec<&JobNode> = nodes.iter().filter(|n| n.status == JobStatus::Failed).collect();

        let (status, result, error) = if !failed.is_empty() {
            let root_failures: Vec<&&JobNode> = failed
                .iter()
                .filter(|n| n.error.as_deref() != Some(DEPENDENCY_FAILURE_MESSAGE))
                .collect();
            let message = match root_failures.len() {
                0 => "Execution failed due to dependency errors".to_string(),
                1 => {
                    let n = root_failures[0];
                    format!(
                        "Job '{}' failed: {}",
                        n.operation.topic(),
                        n.error.as_deref().unwrap_or("unknown error")
                    )
                }
                n_roots => {
                    let parts: Vec<String> = root_failures
                        .iter()
                        .map(|n| {
                            format!(
                                "{} ({})",
                                n.operation.topic(),
                                n.error.as_deref().unwrap_or("unknown error")
                            )
                        })
                        .collect();
                    format!("{n_roots} jobs failed: {}", parts.join(", "))
                }
            };
            (ExecutionStatus::Failed, None, Some(message))
        } else {
            let leaf_ids = leaf_job_ids(&nodes);
            let leaf_result = nodes
                .iter()
                .filter(|n| leaf_ids.contains(n.id.as_str()) && n.status == JobStatus::Completed)
                .max_by_key(|n| n.completed_at)
                .and_then(|n| n.result.clone());
            let normalized = leaf_result
                .as_ref()
                .and_then(|r| r.normalized_url_result())
                .or(leaf_result);
            (ExecutionStatus::Completed, normalized, None)
        };

        let changed = self
            .store
            .finalize_execution(execution_id, status, result, error, Utc::now())
            .await?;

        if changed {
            if let Some(execution) = self.store.load_execution(execution_id).await? {
                if execution.webhook.is_some() {
                    self.queue
                        .send(
                            TOPIC_WEBHOOK_DELIVERY,
                            TicketPayload::ExecutionWebhook { execution_id },
                            SendOptions::default(),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

fn is_terminal(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed)
}

fn is_ready(node: &JobNode, by_id: &HashMap<&str, &JobNode>, base_by_id: &HashMap<&str, &JobNode>) -> bool {
    node.dependencies.iter().all(|d| {
        by_id
            .get(d.as_str())
            .or_else(|| base_by_id.get(d.as_str()))
            .map(|n| n.status == JobStatus::Completed)
            .unwrap_or(false)
    })
}

/// A leaf job is one that no other job in the execution depends on.
fn leaf_job_ids(nodes: &[JobNode]) -> std::collections::HashSet<&str> {
    let mut depended_on: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for node in nodes {
        for dep in &node.dependencies {
            depended_on.insert(dep.as_str());
        }
    }
    nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !depended_on.contains(id))
        .collect()
}

fn plan_job_to_node(job: &PlanJob) -> JobNode {
    JobNode {
        record_id: Uuid::new_v4(),
        id: job.id.clone(),
        operation: job.operation,
        params: job.params.clone(),
        dependencies: job.dependencies.clone(),
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_memory::MemoryQueue;
    use crate::store_memory::MemoryExecutionStore;
    use crate::types::OperationKind;
    use serde_json::json;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(MemoryQueue::new()),
        )
    }

    fn plan_job(id: &str, operation: OperationKind, deps: &[&str]) -> PlanJob {
        PlanJob {
            id: id.to_string(),
            operation,
            params: json!({}),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn create_execution_emits_root_jobs_only() {
        let orch = orchestrator();
        let plan = Plan {
            jobs: vec![
                plan_job("a", OperationKind::GenerateImage, &[]),
                plan_job("b", OperationKind::Generate, &["a"]),
            ],
            base_execution_id: None,
        };
        let execution_id = orch.create_execution(plan, ExecuteOptions::default()).await.unwrap();
        let nodes = orch.store.load_job_nodes(execution_id).await.unwrap();
        let a = nodes.iter().find(|n| n.id == "a").unwrap();
        let b = nodes.iter().find(|n| n.id == "b").unwrap();
        assert_eq!(a.status, JobStatus::Processing);
        assert_eq!(b.status, JobStatus::Pending);

        let execution = orch.store.load_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Processing);
    }

    #[tokio::test]
    async fn dependency_failure_cascades() {
        let orch = orchestrator();
        let plan = Plan {
            jobs: vec![
                plan_job("a", OperationKind::GenerateImage, &[]),
                plan_job("b", OperationKind::Generate, &["a"]),
                plan_job("c", OperationKind::Merge, &["b"]),
            ],
            base_execution_id: None,
        };
        let execution_id = orch.create_execution(plan, ExecuteOptions::default()).await.unwrap();
        orch.store
            .fail_job(execution_id, "a", "provider exploded".to_string(), Utc::now())
            .await
            .unwrap();
        orch.check_and_emit_dependent_jobs(execution_id, "a").await.unwrap();

        let nodes = orch.store.load_job_nodes(execution_id).await.unwrap();
        let b = nodes.iter().find(|n| n.id == "b").unwrap();
        let c = nodes.iter().find(|n| n.id == "c").unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert_eq!(b.error.as_deref(), Some(DEPENDENCY_FAILURE_MESSAGE));
        assert_eq!(c.status, JobStatus::Failed);

        let execution = orch.store.load_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.error.as_deref(),
            Some("Job 'generateImage' failed: provider exploded")
        );
    }

    #[tokio::test]
    async fn completion_emits_dependents_and_finalizes_on_last_job() {
        let orch = orchestrator();
        let plan = Plan {
            jobs: vec![
                plan_job("a", OperationKind::GenerateImage, &[]),
                plan_job("b", OperationKind::Generate, &["a"]),
            ],
            base_execution_id: None,
        };
        let execution_id = orch.create_execution(plan, ExecuteOptions::default()).await.unwrap();

        let result = crate::types::JobResult::completed(vec![crate::types::MediaOutput {
            kind: crate::types::MediaType::Image,
            url: "https://cdn/a.png".to_string(),
            mime_type: None,
        }]);
        orch.store.complete_job(execution_id, "a", result, Utc::now()).await.unwrap();
        orch.check_and_emit_dependent_jobs(execution_id, "a").await.unwrap();

        let nodes = orch.store.load_job_nodes(execution_id).await.unwrap();
        let b = nodes.iter().find(|n| n.id == "b").unwrap();
        assert_eq!(b.status, JobStatus::Processing);

        let result_b = crate::types::JobResult::completed(vec![crate::types::MediaOutput {
            kind: crate::types::MediaType::Video,
            url: "https://cdn/b.mp4".to_string(),
            mime_type: None,
        }]);
        orch.store.complete_job(execution_id, "b", result_b, Utc::now()).await.unwrap();
        orch.check_and_emit_dependent_jobs(execution_id, "b").await.unwrap();

        let execution = orch.store.load_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.result.unwrap().primary_url(), Some("https://cdn/b.mp4"));
    }
}
