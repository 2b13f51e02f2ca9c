use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing_error::SpanTrace;

use crate::transport::{CountMessages, Driver, RawPayload, RawRecord};

/// Default time after which an unresolved delivery is handed out again.
pub const DEFAULT_REDELIVER_TIMEOUT: Duration = Duration::from_secs(3600);

/// PostgreSQL-backed queue driver.
///
/// Records live in the `mailslot_messages` table, one logical queue per
/// `queue_name`. Fetching locks candidate rows with `FOR UPDATE SKIP LOCKED`
/// and stamps them with `delivered_at`, so concurrent receivers never share a
/// record. A delivered row becomes eligible again once `redeliver_timeout`
/// has passed without a commit or discard.
///
/// By default resolved rows are only marked as deleted. Use
/// [`with_permanent_delete`](PgQueue::with_permanent_delete) to remove them.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    queue_name: String,
    redeliver_timeout: Duration,
    logical_delete: bool,
}

/// Handle of one delivery attempt of a PostgreSQL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgDelivery {
    id: i64,
    attempt: i32,
}

impl PgDelivery {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl PgQueue {
    /// Creates a driver without touching the schema.
    pub fn new_uninitialized(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            redeliver_timeout: DEFAULT_REDELIVER_TIMEOUT,
            logical_delete: true,
        }
    }

    /// Creates a driver and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(
        pool: PgPool,
        queue_name: impl Into<String>,
    ) -> Result<Self, PgQueueError> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool, queue_name))
    }

    pub fn with_redeliver_timeout(mut self, timeout: Duration) -> Self {
        self.redeliver_timeout = timeout;
        self
    }

    /// Uses permanent deletion instead of logical deletion.
    pub fn with_permanent_delete(mut self) -> Self {
        self.logical_delete = false;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Enqueue a message encoded as JSON, returning its row id.
    pub async fn send<M>(&self, message: &M) -> Result<i64, PgQueueError>
    where
        M: Serialize,
    {
        self.send_delayed(message, Duration::ZERO).await
    }

    /// Enqueue a message that becomes available after `delay`.
    #[tracing::instrument(skip_all, fields(queue = %self.queue_name))]
    pub async fn send_delayed<M>(&self, message: &M, delay: Duration) -> Result<i64, PgQueueError>
    where
        M: Serialize,
    {
        let body = serde_json::to_vec(message)?;
        let id = sqlx::query_scalar(
            "INSERT INTO mailslot_messages (queue_name, body, available_at)
             VALUES ($1, $2, NOW() + make_interval(secs => $3))
             RETURNING id",
        )
        .bind(&self.queue_name)
        .bind(body)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Enqueue raw bytes, returning the row id.
    pub async fn push_raw(&self, payload: impl Into<RawPayload>) -> Result<i64, PgQueueError> {
        let id = sqlx::query_scalar(
            "INSERT INTO mailslot_messages (queue_name, body) VALUES ($1, $2) RETURNING id",
        )
        .bind(&self.queue_name)
        .bind(payload.into().into_inner())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn resolve(&self, delivery: PgDelivery, rejected: bool) -> Result<(), PgQueueError> {
        let result = if self.logical_delete {
            sqlx::query(
                "UPDATE mailslot_messages SET deleted_at = NOW(), rejected = $3
                 WHERE id = $1 AND delivery_count = $2 AND deleted_at IS NULL",
            )
            .bind(delivery.id)
            .bind(delivery.attempt)
            .bind(rejected)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("DELETE FROM mailslot_messages WHERE id = $1 AND delivery_count = $2")
                .bind(delivery.id)
                .bind(delivery.attempt)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(PgQueueError::not_found(delivery.id));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for PgQueue {
    type Error = PgQueueError;
    type Handle = PgDelivery;

    #[tracing::instrument(skip_all, fields(queue = %self.queue_name))]
    async fn fetch(&mut self, max: usize) -> Result<Vec<RawRecord<PgDelivery>>, PgQueueError> {
        let rows = sqlx::query(
            "UPDATE mailslot_messages
             SET delivered_at = NOW(), delivery_count = delivery_count + 1
             WHERE id IN (
                 SELECT id FROM mailslot_messages
                 WHERE queue_name = $1
                   AND deleted_at IS NULL
                   AND available_at <= NOW()
                   AND (delivered_at IS NULL OR delivered_at < NOW() - make_interval(secs => $2))
                 ORDER BY available_at, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, body, delivery_count",
        )
        .bind(&self.queue_name)
        .bind(self.redeliver_timeout.as_secs_f64())
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let body: Vec<u8> = row.try_get("body")?;
            let attempt: i32 = row.try_get("delivery_count")?;
            records.push(RawRecord {
                handle: PgDelivery { id, attempt },
                message_id: id.to_string(),
                payload: body.into(),
                redeliveries: u32::try_from(attempt - 1).unwrap_or(0),
            });
        }
        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|record| record.handle.id);

        Ok(records)
    }

    async fn commit(&mut self, delivery: PgDelivery) -> Result<(), PgQueueError> {
        self.resolve(delivery, false).await
    }

    async fn discard(&mut self, delivery: PgDelivery) -> Result<(), PgQueueError> {
        self.resolve(delivery, true).await
    }
}

#[async_trait]
impl CountMessages for PgQueue {
    type Error = PgQueueError;

    async fn message_count(&self) -> Result<usize, PgQueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mailslot_messages
             WHERE queue_name = $1
               AND deleted_at IS NULL
               AND available_at <= NOW()
               AND (delivered_at IS NULL OR delivered_at < NOW() - make_interval(secs => $2))",
        )
        .bind(&self.queue_name)
        .bind(self.redeliver_timeout.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

/// Ensures the queue table exists.
async fn create_table(pool: &PgPool) -> Result<(), PgQueueError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mailslot_messages (
            id BIGSERIAL PRIMARY KEY,
            queue_name TEXT NOT NULL,
            body BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            delivered_at TIMESTAMPTZ,
            delivery_count INT NOT NULL DEFAULT 0,
            deleted_at TIMESTAMPTZ,
            rejected BOOL NOT NULL DEFAULT FALSE
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS mailslot_messages_available_idx
         ON mailslot_messages (queue_name, available_at)
         WHERE deleted_at IS NULL",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// PostgreSQL queue errors.
#[derive(Debug)]
pub struct PgQueueError {
    context: SpanTrace,
    kind: PgQueueErrorKind,
}

/// Kinds of PostgreSQL queue errors.
#[derive(Debug)]
pub enum PgQueueErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    /// The row was resolved already or handed to someone else after the
    /// redeliver timeout.
    NotFound(i64),
}

impl PgQueueError {
    fn not_found(id: i64) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PgQueueErrorKind::NotFound(id),
        }
    }

    pub fn kind(&self) -> &PgQueueErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PgQueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgQueueErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgQueueErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            PgQueueErrorKind::NotFound(id) => {
                writeln!(f, "Message {id} is not delivered to this receiver")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PgQueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgQueueErrorKind::Database(err) => Some(err),
            PgQueueErrorKind::Serde(err) => Some(err),
            PgQueueErrorKind::NotFound(_) => None,
        }
    }
}

impl From<sqlx::Error> for PgQueueError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PgQueueErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for PgQueueError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PgQueueErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::{
        Receiver,
        transport::{Json, Transport},
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: u32,
    }

    #[sqlx::test]
    async fn fetch_leases_rows_and_commit_hides_them(pool: PgPool) {
        let mut queue = PgQueue::try_new(pool, "invoices").await.unwrap();
        let first = queue.send(&Invoice { number: 1 }).await.unwrap();
        let second = queue.send(&Invoice { number: 2 }).await.unwrap();

        let records = queue.fetch(10).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.handle.id()).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(queue.fetch(10).await.unwrap().is_empty());

        for record in records {
            queue.commit(record.handle).await.unwrap();
        }
        assert_eq!(queue.message_count().await.unwrap(), 0);
    }

    #[sqlx::test]
    async fn queues_do_not_see_each_other(pool: PgPool) {
        let mut invoices = PgQueue::try_new(pool.clone(), "invoices").await.unwrap();
        let refunds = PgQueue::new_uninitialized(pool, "refunds");
        refunds.send(&Invoice { number: 9 }).await.unwrap();

        assert!(invoices.fetch(10).await.unwrap().is_empty());
        assert_eq!(refunds.message_count().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn stale_delivery_cannot_resolve_redelivered_row(pool: PgPool) {
        let mut queue = PgQueue::try_new(pool, "invoices")
            .await
            .unwrap()
            .with_redeliver_timeout(Duration::ZERO);
        queue.send(&Invoice { number: 1 }).await.unwrap();

        let stale = queue.fetch(1).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fresh = queue.fetch(1).await.unwrap().remove(0);

        assert_eq!(fresh.redeliveries, 1);
        let err = queue.commit(stale.handle).await.unwrap_err();
        assert!(matches!(err.kind(), PgQueueErrorKind::NotFound(_)));
        queue.commit(fresh.handle).await.unwrap();
    }

    #[sqlx::test]
    async fn permanent_delete_removes_rows(pool: PgPool) {
        let mut queue = PgQueue::try_new(pool.clone(), "invoices")
            .await
            .unwrap()
            .with_permanent_delete();
        queue.send(&Invoice { number: 1 }).await.unwrap();

        let record = queue.fetch(1).await.unwrap().remove(0);
        queue.discard(record.handle).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mailslot_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[sqlx::test]
    async fn delayed_message_is_not_fetched_early(pool: PgPool) {
        let mut queue = PgQueue::try_new(pool, "invoices").await.unwrap();
        queue
            .send_delayed(&Invoice { number: 1 }, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(queue.fetch(1).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn transport_rejects_poison_rows(pool: PgPool) {
        let queue = PgQueue::try_new(pool.clone(), "invoices").await.unwrap();
        queue.push_raw("not json").await.unwrap();
        queue.send(&Invoice { number: 7 }).await.unwrap();
        let mut receiver: Transport<Invoice, _, _> = Transport::new(queue.clone(), Json);

        let err = receiver.get().await.unwrap_err();
        assert!(err.is_decoding());

        let batch = receiver.get().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message(), &Invoice { number: 7 });

        let rejected: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mailslot_messages WHERE rejected AND deleted_at IS NOT NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(rejected, 1);
    }
}
