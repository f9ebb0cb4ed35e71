use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::queue::{backoff_delay_secs, Queue, QueueTicket, SendOptions, TicketPayload, TicketState};

struct Inner {
    tickets: HashMap<Uuid, QueueTicket>,
}

/// In-memory implementation of `Queue`, for tests and single-process dev
/// runs. Mirrors the teacher's `MemoryStore`: one `RwLock`-guarded inner
/// struct, no cross-ticket coordination beyond the lock.
pub struct MemoryQueue {
    inner: RwLock<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tickets: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(
        &self,
        topic: &str,
        payload: TicketPayload,
        opts: SendOptions,
    ) -> Result<Uuid, CoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let ticket = QueueTicket {
            id,
            topic: topic.to_string(),
            payload,
            state: TicketState::Created,
            attempts: 0,
            max_attempts: opts.max_attempts,
            visibility_timeout_secs: opts.visibility_timeout_secs,
            visible_at: now,
            expires_at: now + Duration::hours(opts.expire_in_hours),
            created_at: now,
        };
        let mut w = self.inner.write().await;
        w.tickets.insert(id, ticket);
        Ok(id)
    }

    async fn pull(&self, topic: &str) -> Result<Option<QueueTicket>, CoreError> {
        let now = Utc::now();
        let mut w = self.inner.write().await;
        // First-available-wins within the topic (spec §4.5 "Concurrency
        // model"): the queue is FIFO but we don't serialize delivery order
        // across concurrent pullers, we just take the oldest visible one.
        let candidate = w
            .tickets
            .values()
            .filter(|t| {
                t.topic == topic
                    && matches!(t.state, TicketState::Created | TicketState::Active)
                    && t.visible_at <= now
                    && t.expires_at > now
            })
            .min_by_key(|t| t.created_at)
            .map(|t| t.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let ticket = w.tickets.get_mut(&id).unwrap();
        ticket.state = TicketState::Active;
        ticket.attempts += 1;
        ticket.visible_at = now + Duration::seconds(ticket.visibility_timeout_secs);
        Ok(Some(ticket.clone()))
    }

    async fn complete(&self, ticket_id: Uuid) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        if let Some(t) = w.tickets.get_mut(&ticket_id) {
            t.state = TicketState::Completed;
        }
        Ok(())
    }

    async fn fail(&self, ticket_id: Uuid, _reason: &str) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        if let Some(t) = w.tickets.get_mut(&ticket_id) {
            if t.attempts >= t.max_attempts {
                t.state = TicketState::Failed;
            } else {
                t.state = TicketState::Created;
                t.visible_at = Utc::now() + Duration::seconds(backoff_delay_secs(t.attempts));
            }
        }
        Ok(())
    }

    async fn release(&self, ticket_id: Uuid) -> Result<(), CoreError> {
        let mut w = self.inner.write().await;
        if let Some(t) = w.tickets.get_mut(&ticket_id) {
            t.state = TicketState::Completed;
        }
        Ok(())
    }

    async fn get(&self, ticket_id: Uuid) -> Result<Option<QueueTicket>, CoreError> {
        let r = self.inner.read().await;
        Ok(r.tickets.get(&ticket_id).cloned())
    }

    async fn archive_expired(&self) -> Result<u64, CoreError> {
        let now = Utc::now();
        let mut w = self.inner.write().await;
        let mut count = 0u64;
        for t in w.tickets.values_mut() {
            if t.expires_at <= now && !matches!(t.state, TicketState::Completed) {
                t.state = TicketState::Expired;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobPayload;
    use crate::types::{DepResults, OperationKind};

    fn job_payload() -> TicketPayload {
        TicketPayload::Job(JobPayload {
            execution_id: Uuid::new_v4(),
            job_record_id: Uuid::new_v4(),
            job_id: "j1".to_string(),
            operation: OperationKind::Generate,
            params: serde_json::json!({}),
            dependencies: DepResults::new(),
        })
    }

    #[tokio::test]
    async fn pull_returns_none_when_empty() {
        let q = MemoryQueue::new();
        assert!(q.pull("generate").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_then_pull_then_complete() {
        let q = MemoryQueue::new();
        let id = q.send("generate", job_payload(), SendOptions::default()).await.unwrap();
        let ticket = q.pull("generate").await.unwrap().unwrap();
        assert_eq!(ticket.id, id);
        // Invisible to a second puller until the visibility timeout lapses.
        assert!(q.pull("generate").await.unwrap().is_none());
        q.complete(id).await.unwrap();
        assert_eq!(q.get(id).await.unwrap().unwrap().state, TicketState::Completed);
    }

    #[tokio::test]
    async fn fail_retries_until_max_attempts_then_terminal() {
        let q = MemoryQueue::new();
        let opts = SendOptions {
            visibility_timeout_secs: 0,
            max_attempts: 2,
            expire_in_hours: 1,
        };
        let id = q.send("generate", job_payload(), opts).await.unwrap();
        q.pull("generate").await.unwrap();
        q.fail(id, "boom").await.unwrap();
        let t = q.get(id).await.unwrap().unwrap();
        assert_eq!(t.attempts, 1);
        assert_eq!(t.state, TicketState::Created);
    }

    #[tokio::test]
    async fn archive_expired_marks_stale_tickets() {
        let q = MemoryQueue::new();
        let opts = SendOptions {
            visibility_timeout_secs: 30,
            max_attempts: 5,
            expire_in_hours: 0,
        };
        let id = q.send("generate", job_payload(), opts).await.unwrap();
        let archived = q.archive_expired().await.unwrap();
        assert_eq!(archived, 1);
        assert_eq!(q.get(id).await.unwrap().unwrap().state, TicketState::Expired);
    }
}
