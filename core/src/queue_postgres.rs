use chrono::{Duration, Utc};
use sqlx::Row as _;
use uuid::Uuid;

use crate::error::CoreError;
use crate::queue::{backoff_delay_secs, Queue, QueueTicket, SendOptions, TicketPayload, TicketState};

fn infra_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::TransientInfra(e.to_string())
}

fn parse_state(s: &str) -> TicketState {
    match s {
        "active" => TicketState::Active,
        "completed" => TicketState::Completed,
        "failed" => TicketState::Failed,
        "expired" => TicketState::Expired,
        _ => TicketState::Created,
    }
}

/// PostgreSQL-backed implementation of `Queue`. Mirrors the teacher's
/// `PostgresProcessStore`: a thin wrapper over a `sqlx::PgPool` issuing raw
/// `sqlx::query` calls. Shares its schema's migrations with
/// `PostgresExecutionStore`, which runs them at startup.
pub struct PostgresQueue {
    pool: sqlx::PgPool,
}

impl PostgresQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_ticket(row: sqlx::postgres::PgRow) -> Result<QueueTicket, CoreError> {
    let payload_json: serde_json::Value = row.get("payload");
    let payload: TicketPayload =
        serde_json::from_value(payload_json).map_err(|e| infra_err(format!("bad ticket payload: {e}")))?;
    let attempts: i32 = row.get("attempts");
    let max_attempts: i32 = row.get("max_attempts");
    let visibility_timeout_secs: i32 = row.get("visibility_timeout_secs");
    Ok(QueueTicket {
        id: row.get("id"),
        topic: row.get("topic"),
        payload,
        state: parse_state(row.get("state")),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        visibility_timeout_secs: visibility_timeout_secs as i64,
        visible_at: row.get("visible_at"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    })
}

#[async_trait::async_trait]
impl Queue for PostgresQueue {
    async fn send(
        &self,
        topic: &str,
        payload: TicketPayload,
        opts: SendOptions,
    ) -> Result<Uuid, CoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload_json = serde_json::to_value(&payload).map_err(infra_err)?;
        let expires_at = now + Duration::hours(opts.expire_in_hours);

        sqlx::query(
            r#"
            INSERT INTO queue_tickets (
                id, topic, payload, state, attempts, max_attempts,
                visibility_timeout_secs, visible_at, expires_at, created_at
            ) VALUES ($1, $2, $3, 'created', 0, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(&payload_json)
        .bind(opts.max_attempts as i32)
        .bind(opts.visibility_timeout_secs as i32)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;

        Ok(id)
    }

    async fn pull(&self, topic: &str) -> Result<Option<QueueTicket>, CoreError> {
        let now = Utc::now();

        // SKIP LOCKED gives us "first-available-wins" delivery across
        // concurrent workers without serializing the whole topic (spec
        // §4.5 "Concurrency model"). The new `visible_at` is derived from
        // each ticket's own `visibility_timeout_secs` (spec §4.1(b)),
        // rather than a fleet-wide constant.
        let row = sqlx::query(
            r#"
            UPDATE queue_tickets
            SET state = 'active',
                attempts = attempts + 1,
                visible_at = $2 + make_interval(secs => visibility_timeout_secs)
            WHERE id = (
                SELECT id FROM queue_tickets
                WHERE topic = $1
                  AND state IN ('created', 'active')
                  AND visible_at <= $2
                  AND expires_at > $2
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, topic, payload, state, attempts, max_attempts,
                      visibility_timeout_secs, visible_at, expires_at, created_at
            "#,
        )
        .bind(topic)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra_err)?;

        row.map(row_to_ticket).transpose()
    }

    async fn complete(&self, ticket_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE queue_tickets SET state = 'completed' WHERE id = $1")
            .bind(ticket_id)
            .execute(&self.pool)
            .await
            .map_err(infra_err)?;
        Ok(())
    }

    async fn fail(&self, ticket_id: Uuid, reason: &str) -> Result<(), CoreError> {
        tracing::warn!(ticket_id = %ticket_id, reason, "queue ticket failed");

        let current = sqlx::query("SELECT attempts, max_attempts FROM queue_tickets WHERE id = $1")
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(infra_err)?;
        let Some(row) = current else {
            return Ok(());
        };
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");

        if attempts >= max_attempts {
            sqlx::query("UPDATE queue_tickets SET state = 'failed' WHERE id = $1")
                .bind(ticket_id)
                .execute(&self.pool)
                .await
                .map_err(infra_err)?;
        } else {
            let next_visible = Utc::now() + Duration::seconds(backoff_delay_secs(attempts as u32));
            sqlx::query("UPDATE queue_tickets SET state = 'created', visible_at = $2 WHERE id = $1")
                .bind(ticket_id)
                .bind(next_visible)
                .execute(&self.pool)
                .await
                .map_err(infra_err)?;
        }
        Ok(())
    }

    async fn release(&self, ticket_id: Uuid) -> Result<(), CoreError> {
        self.complete(ticket_id).await
    }

    async fn get(&self, ticket_id: Uuid) -> Result<Option<QueueTicket>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, topic, payload, state, attempts, max_attempts,
                   visibility_timeout_secs, visible_at, expires_at, created_at
            FROM queue_tickets WHERE id = $1
            "#,
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra_err)?;
        row.map(row_to_ticket).transpose()
    }

    async fn archive_expired(&self) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE queue_tickets SET state = 'expired' WHERE expires_at <= $1 AND state != 'completed'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(infra_err)?;
        Ok(result.rows_affected())
    }
}
