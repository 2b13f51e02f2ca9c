use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};

use crate::transport::{CountMessages, Driver, RawPayload, RawRecord};

/// In-memory queue backend for testing or local pipelines.
///
/// Clones share the same queue, so several receivers can compete for the
/// same records. It is useful for:
/// - Unit and integration testing
/// - Simulating redelivery and backend outages without a real broker
/// - Debugging message flows
///
/// ## Delivery model
///
/// Records are handed out in FIFO order. A fetched record is leased to the
/// fetching receiver. If a visibility timeout is configured and the lease
/// expires before it is committed or discarded, the record goes back to the
/// queue and is redelivered; the stale lease can no longer resolve it.
/// Without a visibility timeout leases never expire.
#[derive(Clone, Default)]
pub struct InMemory {
    state: Arc<Mutex<State>>,
    visibility_timeout: Option<Duration>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    ready: VecDeque<Stored>,
    leased: BTreeMap<u64, Leased>,
    acknowledged: Vec<u64>,
    rejected: Vec<u64>,
    failures: u32,
}

struct Stored {
    id: u64,
    payload: RawPayload,
    deliveries: u32,
}

struct Leased {
    record: Stored,
    deadline: Option<Instant>,
}

/// Handle of one delivery attempt of an in-memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    id: u64,
    attempt: u32,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease fetched records for `timeout`; expired leases are redelivered.
    ///
    /// The timeout applies to records fetched through this handle.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Enqueue a message encoded as JSON, returning its id.
    pub async fn send<M>(&self, message: &M) -> Result<u64, serde_json::Error>
    where
        M: Serialize,
    {
        let payload = serde_json::to_vec(message)?;
        Ok(self.push_raw(payload).await)
    }

    /// Enqueue raw bytes, returning the record id.
    pub async fn push_raw(&self, payload: impl Into<RawPayload>) -> u64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.ready.push_back(Stored {
            id,
            payload: payload.into(),
            deliveries: 0,
        });
        tracing::debug!(id, "Message queued in memory");
        id
    }

    /// Make the next `count` driver calls fail, simulating an outage.
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.failures = count;
    }

    /// Records waiting to be fetched, including expired leases.
    pub async fn pending(&self) -> usize {
        let mut state = self.state.lock().await;
        state.reclaim_expired(Instant::now());
        state.ready.len()
    }

    /// Records currently leased to a receiver.
    pub async fn in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        state.reclaim_expired(Instant::now());
        state.leased.len()
    }

    /// Ids of committed records, in commit order.
    pub async fn acknowledged(&self) -> Vec<u64> {
        self.state.lock().await.acknowledged.clone()
    }

    /// Ids of discarded records, in discard order.
    pub async fn rejected(&self) -> Vec<u64> {
        self.state.lock().await.rejected.clone()
    }
}

impl State {
    fn check_available(&mut self) -> Result<(), InMemoryError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(InMemoryError::unavailable());
        }
        Ok(())
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }

        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                tracing::debug!(id, "Lease expired, message back in queue");
                self.ready.push_back(lease.record);
            }
        }
        self.ready.make_contiguous().sort_by_key(|record| record.id);
    }

    fn release(&mut self, lease: Lease) -> Result<Stored, InMemoryError> {
        match self.leased.get(&lease.id) {
            Some(current) if current.record.deliveries == lease.attempt => self
                .leased
                .remove(&lease.id)
                .map(|leased| leased.record)
                .ok_or_else(|| InMemoryError::not_found(lease.id)),
            _ => Err(InMemoryError::not_found(lease.id)),
        }
    }
}

#[async_trait::async_trait]
impl Driver for InMemory {
    type Error = InMemoryError;
    type Handle = Lease;

    async fn fetch(&mut self, max: usize) -> Result<Vec<RawRecord<Lease>>, InMemoryError> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let now = Instant::now();
        state.reclaim_expired(now);
        let deadline = self.visibility_timeout.map(|timeout| now + timeout);

        let mut records = Vec::new();
        while records.len() < max {
            let Some(mut stored) = state.ready.pop_front() else {
                break;
            };
            stored.deliveries += 1;
            records.push(RawRecord {
                handle: Lease {
                    id: stored.id,
                    attempt: stored.deliveries,
                },
                message_id: stored.id.to_string(),
                payload: stored.payload.clone(),
                redeliveries: stored.deliveries - 1,
            });
            state.leased.insert(
                stored.id,
                Leased {
                    record: stored,
                    deadline,
                },
            );
        }

        Ok(records)
    }

    async fn commit(&mut self, lease: Lease) -> Result<(), InMemoryError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let record = state.release(lease)?;
        state.acknowledged.push(record.id);
        tracing::debug!(id = record.id, "Message acknowledged in memory");
        Ok(())
    }

    async fn discard(&mut self, lease: Lease) -> Result<(), InMemoryError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let record = state.release(lease)?;
        state.rejected.push(record.id);
        tracing::debug!(id = record.id, "Message discarded in memory");
        Ok(())
    }
}

#[async_trait::async_trait]
impl CountMessages for InMemory {
    type Error = InMemoryError;

    async fn message_count(&self) -> Result<usize, InMemoryError> {
        Ok(self.pending().await)
    }
}

/// Error type for `InMemory` operations.
#[derive(Debug)]
pub struct InMemoryError {
    kind: InMemoryErrorKind,
}

impl InMemoryError {
    fn not_found(id: u64) -> Self {
        Self {
            kind: InMemoryErrorKind::NotFound(id),
        }
    }

    fn unavailable() -> Self {
        Self {
            kind: InMemoryErrorKind::Unavailable,
        }
    }
}

impl std::fmt::Display for InMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryErrorKind::NotFound(id) => {
                write!(f, "Message {id} is not leased in in-memory driver")
            }
            InMemoryErrorKind::Unavailable => write!(f, "In-memory driver is unavailable"),
        }
    }
}

impl std::error::Error for InMemoryError {}

#[derive(Debug)]
enum InMemoryErrorKind {
    NotFound(u64),
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_leases_records_in_order() {
        let mut queue = InMemory::new();
        let first = queue.push_raw("a").await;
        let second = queue.push_raw("b").await;

        let records = queue.fetch(10).await.unwrap();

        let ids: Vec<_> = records.iter().map(|r| r.handle.id()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(queue.pending().await, 0);
        assert_eq!(queue.in_flight().await, 2);
        assert!(queue.fetch(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_stale_lease_refused() {
        let mut queue = InMemory::new().with_visibility_timeout(Duration::from_secs(30));
        queue.push_raw("a").await;

        let stale = queue.fetch(1).await.unwrap().remove(0);
        assert_eq!(stale.redeliveries, 0);

        tokio::time::advance(Duration::from_secs(31)).await;

        let fresh = queue.fetch(1).await.unwrap().remove(0);
        assert_eq!(fresh.redeliveries, 1);
        assert!(queue.commit(stale.handle).await.is_err());
        queue.commit(fresh.handle).await.unwrap();
        assert_eq!(queue.acknowledged().await, vec![fresh.handle.id()]);
    }

    #[tokio::test]
    async fn outage_fails_the_configured_number_of_calls() {
        let mut queue = InMemory::new();
        queue.push_raw("a").await;
        queue.fail_next(2).await;

        assert!(queue.fetch(1).await.is_err());
        assert!(queue.fetch(1).await.is_err());
        assert_eq!(queue.fetch(1).await.unwrap().len(), 1);
    }
}
