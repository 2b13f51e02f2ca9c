//! Driver-backed receivers.
//!
//! This module composes a backend [`Driver`] and a [`Decode`] codec into a
//! [`Transport`], the [`Receiver`] implementation shared by every backend.
//!
//! Drivers only know three raw primitives: fetch a few records, commit one,
//! discard one. Everything the receiver contract adds on top lives in
//! [`Transport`], so each backend gets it for free:
//!
//! - batch size capping
//! - receiver-bound delivery identity and in-flight bookkeeping
//! - the poison-message policy (discard, then fail with a decoding error)
//! - transport stamps ([`TransportMessageIdStamp`], [`RedeliveryStamp`])
//!
//! ## Key components
//!
//! - [`Transport`]: generic receiver over a driver and a codec
//! - [`Driver`]: trait implemented by concrete backends
//! - [`RawRecord`]: a fetched, not yet decoded record
//! - [`codec`]: built-in decoders

pub mod codec;
mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::collections::{HashMap, VecDeque};

use crate::{
    Envelope,
    envelope::{Delivery, ReceiverId, RedeliveryStamp, Stamps, TransportMessageIdStamp},
    receiver::{MessageDecodingError, ReceiveError, Receiver, TransportError},
};

pub use codec::{Decode, Json};
pub use inmemory::{InMemory, InMemoryError, Lease};

/// Default upper bound on the number of envelopes returned by one `get()`.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Generic receiver over a backend driver and a message codec.
///
/// `Transport` owns its driver exclusively. Each instance gets its own
/// [`ReceiverId`], so envelopes from two transports over the same backend
/// cannot be resolved through the wrong one.
///
/// ## Resolution
///
/// `ack` and `reject` on an envelope that was not produced by this instance
/// fail with [`ForeignEnvelope`](crate::receiver::TransportErrorKind::ForeignEnvelope).
/// Resolving the same delivery twice fails with
/// [`UnknownDelivery`](crate::receiver::TransportErrorKind::UnknownDelivery).
/// Neither case reaches the backend.
///
/// ## Poison records
///
/// Records the codec rejects are discarded at the backend before `get` fails.
/// Records of the same batch that decoded fine stay in flight and are handed
/// out by the next `get` call, before anything new is fetched. If a discard
/// fails, the remaining poison records are kept and discarded again at the
/// start of the next `get`.
///
/// ## Abandoning
///
/// An envelope that is neither acked nor rejected must be handed back through
/// [`Receiver::abandon`], which forgets its tag without contacting the
/// backend. Envelopes dropped without that call keep their tag until the
/// transport is dropped.
pub struct Transport<M, D, C>
where
    D: Driver,
{
    id: ReceiverId,
    driver: D,
    decoder: C,
    batch_size: usize,
    next_tag: u64,
    in_flight: HashMap<u64, D::Handle>,
    ready: VecDeque<Envelope<M>>,
    poisoned: VecDeque<Poisoned<D::Handle>>,
}

/// An undecodable record still waiting to be discarded.
struct Poisoned<H> {
    message_id: String,
    handle: H,
    source: tower::BoxError,
}

impl<M, D, C> Transport<M, D, C>
where
    D: Driver,
{
    /// Create a receiver from a backend driver and a codec.
    pub fn new(driver: D, decoder: C) -> Self {
        Self {
            id: ReceiverId::next(),
            driver,
            decoder,
            batch_size: DEFAULT_BATCH_SIZE,
            next_tag: 0,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
            poisoned: VecDeque::new(),
        }
    }

    /// Cap the number of envelopes returned by one `get()`.
    ///
    /// Values below one are raised to one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of envelopes handed out, or buffered, and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Number of records waiting at the backend.
    pub async fn message_count(&self) -> Result<usize, TransportError>
    where
        D: CountMessages,
    {
        self.driver
            .message_count()
            .await
            .map_err(TransportError::backend)
    }

    fn track(&mut self, handle: D::Handle) -> Delivery {
        self.next_tag += 1;
        self.in_flight.insert(self.next_tag, handle);
        Delivery::new(self.id, self.next_tag)
    }

    fn take_ready(&mut self) -> Vec<Envelope<M>> {
        let count = self.ready.len().min(self.batch_size);
        self.ready.drain(..count).collect()
    }

    /// Discard queued poison records, oldest first.
    ///
    /// Stops at the first failing discard; that record and the ones after it
    /// stay queued for the next call. The failure is only returned when
    /// nothing was discarded before it.
    async fn discard_poisoned(
        &mut self,
    ) -> Result<Option<MessageDecodingError>, TransportError> {
        let mut first = None;
        let mut discarded = 0;

        loop {
            let Some(handle) = self.poisoned.front().map(|poison| {
                tracing::warn!(
                    message_id = %poison.message_id,
                    error = %poison.source,
                    "Discarding undecodable message"
                );
                poison.handle.clone()
            }) else {
                break;
            };
            if let Err(err) = self.driver.discard(handle).await {
                if first.is_some() {
                    break;
                }
                return Err(TransportError::backend(err));
            }

            if let Some(poison) = self.poisoned.pop_front() {
                first.get_or_insert((poison.message_id, poison.source));
                discarded += 1;
            }
        }

        Ok(first.map(|(message_id, source)| {
            MessageDecodingError::new(message_id, source, discarded)
        }))
    }

    fn release(&mut self, delivery: Delivery) -> Result<D::Handle, TransportError> {
        if delivery.receiver() != self.id {
            return Err(TransportError::foreign_envelope(
                self.id,
                delivery.receiver(),
            ));
        }
        self.in_flight
            .remove(&delivery.tag())
            .ok_or_else(|| TransportError::unknown_delivery(delivery.tag()))
    }
}

#[async_trait::async_trait]
impl<M, D, C> Receiver for Transport<M, D, C>
where
    M: Send,
    D: Driver,
    C: Decode<M> + Send,
{
    type Message = M;

    #[tracing::instrument(skip_all, fields(receiver = %self.id))]
    async fn get(&mut self) -> Result<Vec<Envelope<M>>, ReceiveError> {
        if let Some(err) = self.discard_poisoned().await? {
            return Err(err.into());
        }
        if !self.ready.is_empty() {
            return Ok(self.take_ready());
        }

        let records = self
            .driver
            .fetch(self.batch_size)
            .await
            .map_err(TransportError::backend)?;

        let mut envelopes = Vec::with_capacity(records.len());
        for record in records {
            let mut stamps = Stamps::default();
            stamps.push(TransportMessageIdStamp::new(record.message_id.clone()));
            if record.redeliveries > 0 {
                stamps.push(RedeliveryStamp::new(record.redeliveries));
            }

            match self.decoder.decode(record.payload.as_bytes(), &mut stamps) {
                Ok(message) => {
                    let delivery = self.track(record.handle);
                    envelopes.push(Envelope::with_stamps(delivery, message, stamps));
                }
                Err(err) => self.poisoned.push_back(Poisoned {
                    message_id: record.message_id,
                    handle: record.handle,
                    source: err.into(),
                }),
            }
        }

        if self.poisoned.is_empty() {
            tracing::trace!(count = envelopes.len(), "Fetched envelopes");
            return Ok(envelopes);
        }

        // Decoded siblings stay in flight and go out with the next call.
        self.ready.extend(envelopes);

        match self.discard_poisoned().await? {
            Some(err) => Err(err.into()),
            None => Ok(self.take_ready()),
        }
    }

    #[tracing::instrument(skip_all, fields(receiver = %self.id, tag = envelope.delivery().tag()))]
    async fn ack(&mut self, envelope: Envelope<M>) -> Result<(), TransportError> {
        let handle = self.release(envelope.delivery())?;
        self.driver
            .commit(handle)
            .await
            .map_err(TransportError::backend)
    }

    #[tracing::instrument(skip_all, fields(receiver = %self.id, tag = envelope.delivery().tag()))]
    async fn reject(&mut self, envelope: Envelope<M>) -> Result<(), TransportError> {
        let handle = self.release(envelope.delivery())?;
        self.driver
            .discard(handle)
            .await
            .map_err(TransportError::backend)
    }

    fn abandon(&mut self, delivery: Delivery) -> Result<(), TransportError> {
        self.release(delivery).map(drop)
    }
}

/// Trait implemented by concrete backends.
///
/// A driver exposes the raw primitives every queue-like backend can express,
/// whatever its native mechanism (visibility timeouts, row locks, offsets).
///
/// - `fetch` must mark returned records in flight, so they are not handed to
///   any other consumer until committed, discarded or timed out
/// - `commit` removes a record permanently after successful handling
/// - `discard` removes a record permanently without handling it
#[async_trait::async_trait]
pub trait Driver: Send {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Backend-native handle used to resolve one fetched record.
    type Handle: Clone + Send;

    /// Fetch at most `max` records.
    async fn fetch(&mut self, max: usize) -> Result<Vec<RawRecord<Self::Handle>>, Self::Error>;

    /// Permanently remove a handled record.
    async fn commit(&mut self, handle: Self::Handle) -> Result<(), Self::Error>;

    /// Permanently remove a record that must not be retried.
    async fn discard(&mut self, handle: Self::Handle) -> Result<(), Self::Error>;
}

/// Optional driver capability: count records waiting to be fetched.
#[async_trait::async_trait]
pub trait CountMessages {
    type Error: Into<tower::BoxError>;

    async fn message_count(&self) -> Result<usize, Self::Error>;
}

/// A record fetched by a [`Driver`], before decoding.
#[derive(Debug)]
pub struct RawRecord<H> {
    /// Handle passed back to `commit` or `discard`.
    pub handle: H,
    /// Backend-native id, used for observability.
    pub message_id: String,
    /// Encoded message body.
    pub payload: RawPayload,
    /// How many times the backend delivered this record before.
    pub redeliveries: u32,
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for RawPayload {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for RawPayload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for RawPayload {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::receiver::{ReceiveErrorKind, TransportErrorKind};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    fn receiver(queue: &InMemory) -> Transport<Order, InMemory, Json> {
        Transport::new(queue.clone(), Json)
    }

    /// Refuses the first `failures` discards, then defers to the queue.
    struct FlakyDiscard {
        queue: InMemory,
        failures: u32,
    }

    #[async_trait::async_trait]
    impl Driver for FlakyDiscard {
        type Error = tower::BoxError;
        type Handle = Lease;

        async fn fetch(&mut self, max: usize) -> Result<Vec<RawRecord<Lease>>, tower::BoxError> {
            self.queue.fetch(max).await.map_err(Into::into)
        }

        async fn commit(&mut self, lease: Lease) -> Result<(), tower::BoxError> {
            self.queue.commit(lease).await.map_err(Into::into)
        }

        async fn discard(&mut self, lease: Lease) -> Result<(), tower::BoxError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err("discard refused".into());
            }
            self.queue.discard(lease).await.map_err(Into::into)
        }
    }

    #[tokio::test]
    async fn empty_queue_yields_empty_batch() {
        let queue = InMemory::new();
        let mut orders = receiver(&queue);

        let batch = orders.get().await.unwrap();

        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn batch_size_caps_each_get() {
        let queue = InMemory::new();
        for id in 0..5 {
            queue.send(&Order { id }).await.unwrap();
        }
        let mut orders = receiver(&queue).with_batch_size(2);

        assert_eq!(orders.get().await.unwrap().len(), 2);
        assert_eq!(orders.get().await.unwrap().len(), 2);
        assert_eq!(orders.get().await.unwrap().len(), 1);
        assert_eq!(orders.in_flight(), 5);
        assert_eq!(queue.in_flight().await, 5);
    }

    #[tokio::test]
    async fn envelopes_carry_transport_stamps() {
        let queue = InMemory::new();
        let id = queue.send(&Order { id: 1 }).await.unwrap();
        let mut orders = receiver(&queue);

        let envelope = orders.get().await.unwrap().remove(0);

        assert_eq!(envelope.message(), &Order { id: 1 });
        assert_eq!(
            envelope
                .last_stamp::<TransportMessageIdStamp>()
                .map(|s| s.as_str().to_owned()),
            Some(id.to_string())
        );
        assert!(envelope.last_stamp::<RedeliveryStamp>().is_none());
    }

    #[tokio::test]
    async fn acked_envelope_never_reappears_on_any_receiver() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut first = receiver(&queue);
        let mut second = receiver(&queue);

        let envelope = first.get().await.unwrap().remove(0);
        assert!(second.get().await.unwrap().is_empty());

        first.ack(envelope).await.unwrap();

        assert!(first.get().await.unwrap().is_empty());
        assert!(second.get().await.unwrap().is_empty());
        assert_eq!(queue.acknowledged().await.len(), 1);
        assert_eq!(orders_pending(&first).await, 0);
    }

    async fn orders_pending(orders: &Transport<Order, InMemory, Json>) -> usize {
        orders.message_count().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_with_stamp() {
        let queue = InMemory::new().with_visibility_timeout(Duration::from_secs(10));
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut first = receiver(&queue);
        let mut second = receiver(&queue);

        let stale = first.get().await.unwrap().remove(0);
        tokio::time::advance(Duration::from_secs(11)).await;
        let redelivered = second.get().await.unwrap().remove(0);

        assert_eq!(
            redelivered.last_stamp::<RedeliveryStamp>().map(|s| s.count()),
            Some(1)
        );
        assert!(first.ack(stale).await.is_err());
        second.ack(redelivered).await.unwrap();
        assert_eq!(queue.acknowledged().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_envelope_is_discarded() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut orders = receiver(&queue);

        let envelope = orders.get().await.unwrap().remove(0);
        orders.reject(envelope).await.unwrap();

        assert!(orders.get().await.unwrap().is_empty());
        assert_eq!(queue.rejected().await.len(), 1);
        assert!(queue.acknowledged().await.is_empty());
    }

    #[tokio::test]
    async fn poison_record_is_removed_before_the_error() {
        let queue = InMemory::new();
        let poison = queue.push_raw("{not json").await;
        let mut orders = receiver(&queue);

        let err = orders.get().await.unwrap_err();

        match err.kind() {
            ReceiveErrorKind::Decoding(inner) => {
                assert_eq!(inner.message_id(), poison.to_string());
                assert_eq!(inner.discarded(), 1);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(queue.pending().await, 0);
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.rejected().await, vec![poison]);
        assert!(orders.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decoded_siblings_of_poison_come_with_next_get() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        queue.push_raw("oops").await;
        queue.send(&Order { id: 2 }).await.unwrap();
        let mut orders = receiver(&queue);

        assert!(orders.get().await.unwrap_err().is_decoding());

        let batch = orders.get().await.unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.message().id).collect();
        assert_eq!(ids, vec![1, 2]);
        for envelope in batch {
            orders.ack(envelope).await.unwrap();
        }
        assert_eq!(queue.acknowledged().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_poison_discard_is_retried_on_next_get() {
        let queue = InMemory::new();
        let first = queue.push_raw("oops").await;
        let second = queue.push_raw("{broken").await;
        queue.send(&Order { id: 3 }).await.unwrap();
        let driver = FlakyDiscard {
            queue: queue.clone(),
            failures: 1,
        };
        let mut orders: Transport<Order, _, _> = Transport::new(driver, Json);

        assert!(orders.get().await.unwrap_err().is_transport());
        assert_eq!(queue.in_flight().await, 3);
        assert!(queue.rejected().await.is_empty());

        match orders.get().await.unwrap_err().kind() {
            ReceiveErrorKind::Decoding(inner) => {
                assert_eq!(inner.message_id(), first.to_string());
                assert_eq!(inner.discarded(), 2);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(queue.rejected().await, vec![first, second]);

        let batch = orders.get().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message(), &Order { id: 3 });
        assert_eq!(queue.in_flight().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_envelopes_release_their_tags() {
        let queue = InMemory::new().with_visibility_timeout(Duration::from_secs(1));
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut orders = receiver(&queue);

        for _ in 0..100 {
            let batch = orders.get().await.unwrap();
            assert_eq!(batch.len(), 1);
            for envelope in batch {
                orders.abandon(envelope.delivery()).unwrap();
            }
            tokio::time::advance(Duration::from_millis(1001)).await;
        }

        assert_eq!(orders.in_flight(), 0);
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.pending().await, 1);
    }

    #[tokio::test]
    async fn abandon_checks_delivery_ownership() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut first = receiver(&queue);
        let mut second = receiver(&queue);

        let envelope = first.get().await.unwrap().remove(0);
        let delivery = envelope.delivery();

        let err = second.abandon(delivery).unwrap_err();
        assert!(matches!(
            err.kind(),
            TransportErrorKind::ForeignEnvelope { .. }
        ));
        first.abandon(delivery).unwrap();
        let err = first.ack(envelope).await.unwrap_err();
        assert!(matches!(err.kind(), TransportErrorKind::UnknownDelivery(1)));
        assert_eq!(queue.in_flight().await, 1);
    }

    #[tokio::test]
    async fn double_ack_is_reported() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut orders = receiver(&queue);

        let envelope = orders.get().await.unwrap().remove(0);
        orders.ack(envelope.clone()).await.unwrap();
        let err = orders.ack(envelope).await.unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::UnknownDelivery(1)));
        assert_eq!(queue.acknowledged().await.len(), 1);
    }

    #[tokio::test]
    async fn foreign_envelope_is_refused() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        let mut first = receiver(&queue);
        let mut second = receiver(&queue);

        let envelope = first.get().await.unwrap().remove(0);
        let err = second.reject(envelope.clone()).await.unwrap_err();

        assert!(matches!(
            err.kind(),
            TransportErrorKind::ForeignEnvelope { .. }
        ));
        assert_eq!(queue.in_flight().await, 1);
        first.ack(envelope).await.unwrap();
    }

    #[tokio::test]
    async fn backend_outage_surfaces_as_transport_error() {
        let queue = InMemory::new();
        queue.send(&Order { id: 1 }).await.unwrap();
        queue.fail_next(1).await;
        let mut orders = receiver(&queue);

        let err = orders.get().await.unwrap_err();
        assert!(err.is_transport());

        assert_eq!(orders.get().await.unwrap().len(), 1);
    }
}
