use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use uuid::Uuid;

use crate::error::CoreError;
use crate::store::ExecutionStore;
use crate::types::{
    Execution, ExecutionStatus, JobNode, JobProgress, JobResult, JobStatus, WaitingStrategy,
};

fn infra_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::TransientInfra(e.to_string())
}

fn execution_status_str(s: ExecutionStatus) -> &'static str {
    match s {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Processing => "processing",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
    }
}

fn parse_execution_status(s: &str) -> ExecutionStatus {
    match s {
        "processing" => ExecutionStatus::Processing,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        _ => ExecutionStatus::Pending,
    }
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

fn waiting_strategy_str(s: WaitingStrategy) -> &'static str {
    match s {
        WaitingStrategy::Sync => "sync",
        WaitingStrategy::Webhook => "webhook",
        WaitingStrategy::Polling => "polling",
        WaitingStrategy::None => "none",
    }
}

fn parse_waiting_strategy(s: &str) -> WaitingStrategy {
    match s {
        "sync" => WaitingStrategy::Sync,
        "webhook" => WaitingStrategy::Webhook,
        "polling" => WaitingStrategy::Polling,
        _ => WaitingStrategy::None,
    }
}

/// PostgreSQL-backed implementation of `ExecutionStore`. Same idiom as
/// `PostgresQueue` and the teacher's `PostgresProcessStore`: raw
/// `sqlx::query` + `.bind`/`.get`, embedded migrations.
pub struct PostgresExecutionStore {
    pool: sqlx::PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run mediaforge-core migrations")?;
        Ok(())
    }
}

fn execution_row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, CoreError> {
    let plan_json: serde_json::Value = row.get("plan");
    let result_json: Option<serde_json::Value> = row.get("result");
    let provider_api_keys: Option<serde_json::Value> = row.get("provider_api_keys");
    Ok(Execution {
        id: row.get("id"),
        status: parse_execution_status(row.get("status")),
        plan: serde_json::from_value(plan_json).map_err(infra_err)?,
        base_execution_id: row.get("base_execution_id"),
        webhook: row.get("webhook"),
        webhook_secret: row.get("webhook_secret"),
        organization_id: row.get("organization_id"),
        api_key_id: row.get("api_key_id"),
        provider_api_keys,
        result: result_json.map(serde_json::from_value).transpose().map_err(infra_err)?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        webhook_delivered_at: row.get("webhook_delivered_at"),
    })
}

fn job_row_to_node(row: &sqlx::postgres::PgRow) -> Result<JobNode, CoreError> {
    let params: serde_json::Value = row.get("params");
    let result_json: Option<serde_json::Value> = row.get("result");
    let waiting_strategy: Option<String> = row.get("waiting_strategy");
    Ok(JobNode {
        record_id: row.get("record_id"),
        id: row.get("job_id"),
        operation: serde_json::from_value(serde_json::Value::String(row.get("operation")))
            .map_err(infra_err)?,
        params,
        dependencies: serde_json::from_value(row.get("dependencies")).map_err(infra_err)?,
        result: result_json.map(serde_json::from_value).transpose().map_err(infra_err)?,
        error: row.get("error"),
        status: parse_job_status(row.get("status")),
        provider_job_id: row.get("provider_job_id"),
        waiting_strategy: waiting_strategy.as_deref().map(parse_waiting_strategy),
        next_poll_at: row.get("next_poll_at"),
        progress_stage: row.get("progress_stage"),
        progress_percent: row.get("progress_percent"),
        attempts: {
            let a: i32 = row.get("attempts");
            a.max(0) as u32
        },
        action_logged: row.get("action_logged"),
        queue_ticket_id: row.get("queue_ticket_id"),
        webhook_delivered_at: row.get("webhook_delivered_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

#[async_trait::async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn save_execution(&self, execution: &Execution, jobs: &[JobNode]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(infra_err)?;

        let plan_json = serde_json::to_value(&execution.plan).map_err(infra_err)?;
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, status, plan, base_execution_id, webhook, webhook_secret,
                organization_id, api_key_id, provider_api_keys, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.id)
        .bind(execution_status_str(execution.status))
        .bind(&plan_json)
        .bind(execution.base_execution_id)
        .bind(&execution.webhook)
        .bind(&execution.webhook_secret)
        .bind(&execution.organization_id)
        .bind(&execution.api_key_id)
        .bind(&execution.provider_api_keys)
        .bind(execution.created_at)
        .execute(&mut *tx)
        .await
        .map_err(infra_err)?;

        for job in jobs {
            let dependencies_json = serde_json::to_value(&job.dependencies).map_err(infra_err)?;
            sqlx::query(
                r#"
                INSERT INTO job_nodes (
                    record_id, execution_id, job_id, operation, params, dependencies,
                    status, attempts, action_logged
                ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, false)
                "#,
            )
            .bind(job.record_id)
            .bind(execution.id)
            .bind(&job.id)
            .bind(job.operation.topic())
            .bind(&job.params)
            .bind(&dependencies_json)
            .execute(&mut *tx)
            .await
            .map_err(infra_err)?;
        }

        tx.commit().await.map_err(infra_err)?;
        Ok(())
    }

    async fn load_execution(&self, id: Uuid) -> Result<Option<Execution>, CoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infra_err)?;
        row.as_ref().map(execution_row_to_execution).transpose()
    }

    async fn try_mark_execution_processing(&self, id: Uuid) -> Result<bool, CoreError> {
        let updated = sqlx::query("UPDATE executions SET status = 'processing' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn finalize_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<JobResult>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result_json = result.map(|r| serde_json::to_value(r)).transpose().map_err(infra_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, result = $3, error = $4, completed_at = $5
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(execution_status_str(status))
        .bind(&result_json)
        .bind(&error)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn mark_execution_webhook_delivered(&self, id: Uuid) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            "UPDATE executions SET webhook_delivered_at = now() WHERE id = $1 AND webhook_delivered_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn list_non_terminal_executions(&self) -> Result<Vec<Uuid>, CoreError> {
        let rows = sqlx::query("SELECT id FROM executions WHERE status IN ('pending', 'processing')")
            .fetch_all(&self.pool)
            .await
            .map_err(infra_err)?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn load_job_node(&self, execution_id: Uuid, job_id: &str) -> Result<Option<JobNode>, CoreError> {
        let row = sqlx::query("SELECT * FROM job_nodes WHERE execution_id = $1 AND job_id = $2")
            .bind(execution_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infra_err)?;
        row.as_ref().map(job_row_to_node).transpose()
    }

    async fn load_job_node_by_record_id(
        &self,
        record_id: Uuid,
    ) -> Result<Option<(Uuid, JobNode)>, CoreError> {
        let row = sqlx::query("SELECT * FROM job_nodes WHERE record_id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infra_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let execution_id: Uuid = row.get("execution_id");
                Ok(Some((execution_id, job_row_to_node(&row)?)))
            }
        }
    }

    async fn load_job_nodes(&self, execution_id: Uuid) -> Result<Vec<JobNode>, CoreError> {
        let rows = sqlx::query("SELECT * FROM job_nodes WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(infra_err)?;
        rows.iter().map(job_row_to_node).collect()
    }

    async fn try_mark_processing(
        &self,
        execution_id: Uuid,
        job_id: &str,
        queue_ticket_id: Uuid,
    ) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE job_nodes
            SET status = 'processing', queue_ticket_id = $3, started_at = now(), attempts = attempts + 1
            WHERE execution_id = $1 AND job_id = $2 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(queue_ticket_id)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn complete_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        result: JobResult,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result_json = serde_json::to_value(&result).map_err(infra_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE job_nodes
            SET status = 'completed', result = $3, completed_at = $4
            WHERE execution_id = $1 AND job_id = $2 AND status = 'processing'
            "#,
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(&result_json)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn fail_job(
        &self,
        execution_id: Uuid,
        job_id: &str,
        error: String,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE job_nodes
            SET status = 'failed', error = $3, completed_at = $4
            WHERE execution_id = $1 AND job_id = $2 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(&error)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn update_job_async_state(
        &self,
        execution_id: Uuid,
        job_id: &str,
        waiting_strategy: WaitingStrategy,
        provider_job_id: Option<String>,
        next_poll_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE job_nodes
            SET waiting_strategy = $3, provider_job_id = $4, next_poll_at = $5
            WHERE execution_id = $1 AND job_id = $2
            "#,
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(waiting_strategy_str(waiting_strategy))
        .bind(&provider_job_id)
        .bind(next_poll_at)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(())
    }

    async fn update_job_progress(
        &self,
        execution_id: Uuid,
        job_id: &str,
        progress: JobProgress,
        stage: String,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE job_nodes SET progress_stage = $3, progress_percent = $4 WHERE execution_id = $1 AND job_id = $2",
        )
        .bind(execution_id)
        .bind(job_id)
        .bind(stage)
        .bind(progress.percent)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(())
    }

    async fn mark_action_logged(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            "UPDATE job_nodes SET action_logged = true WHERE execution_id = $1 AND job_id = $2 AND action_logged = false",
        )
        .bind(execution_id)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn mark_job_webhook_delivered(&self, execution_id: Uuid, job_id: &str) -> Result<bool, CoreError> {
        let updated = sqlx::query(
            "UPDATE job_nodes SET webhook_delivered_at = now() WHERE execution_id = $1 AND job_id = $2 AND webhook_delivered_at IS NULL",
        )
        .bind(execution_id)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn list_pollable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<(Uuid, JobNode)>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM job_nodes WHERE status = 'processing' AND waiting_strategy = 'polling' AND next_poll_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(infra_err)?;
        rows.iter()
            .map(|row| {
                let execution_id: Uuid = row.get("execution_id");
                Ok((execution_id, job_row_to_node(row)?))
            })
            .collect()
    }
}
