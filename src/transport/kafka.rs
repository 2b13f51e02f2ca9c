use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    Message, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::BorrowedMessage,
};
use tracing_error::SpanTrace;

use crate::transport::{Driver, RawRecord};

/// Kafka consumer driver.
///
/// Wraps an already subscribed `StreamConsumer`. The consumer should be
/// created with `enable.auto.commit=false`; offsets are committed by this
/// driver only.
///
/// ## Offset semantics
///
/// Kafka cannot delete a single record, so `commit` and `discard` both mark
/// the record as consumed. Offsets are committed per partition up to the
/// lowest record still in flight: resolving offset 7 while 5 is pending does
/// not move the committed position past 5. After a restart or rebalance,
/// every unresolved record is delivered again.
pub struct Kafka {
    /// Kafka consumer handle
    consumer: StreamConsumer,
    /// How long `fetch` waits for the first record
    poll_timeout: Duration,
    partitions: HashMap<(String, i32), PartitionState>,
}

/// Handle of one fetched Kafka record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Kafka {
    /// Create a driver over a subscribed consumer.
    ///
    /// Default poll timeout is 1 second.
    pub fn new(consumer: StreamConsumer) -> Self {
        Self {
            consumer,
            poll_timeout: Duration::from_secs(1),
            partitions: HashMap::new(),
        }
    }

    /// Set how long `fetch` waits before reporting an empty batch.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn track(&mut self, handle: &KafkaOffset) {
        self.partitions
            .entry((handle.topic.clone(), handle.partition))
            .or_default()
            .fetched(handle.offset);
    }

    #[tracing::instrument(
        skip_all,
        fields(
            topic = %handle.topic,
            partition = handle.partition,
            offset = handle.offset,
        )
    )]
    fn resolve(&mut self, handle: KafkaOffset) -> Result<(), KafkaDriverError> {
        let state = self
            .partitions
            .get_mut(&(handle.topic.clone(), handle.partition))
            .ok_or_else(|| KafkaDriverError::not_in_flight(&handle))?;
        if !state.resolve(handle.offset) {
            return Err(KafkaDriverError::not_in_flight(&handle));
        }

        let Some(position) = state.advance() else {
            return Ok(());
        };

        let mut partitions = TopicPartitionList::new();
        partitions.add_partition_offset(
            &handle.topic,
            handle.partition,
            Offset::Offset(position),
        )?;
        self.consumer.commit(&partitions, CommitMode::Async)?;
        tracing::debug!(position, "Committed Kafka offset");
        Ok(())
    }
}

#[async_trait]
impl Driver for Kafka {
    type Error = KafkaDriverError;
    type Handle = KafkaOffset;

    async fn fetch(
        &mut self,
        max: usize,
    ) -> Result<Vec<RawRecord<KafkaOffset>>, KafkaDriverError> {
        let mut records = Vec::new();
        let mut wait = self.poll_timeout;

        while records.len() < max {
            let received = match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(received) => received,
                Err(_) => break,
            };
            let record = match received {
                Ok(message) => raw_record(&message),
                Err(err) if records.is_empty() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(error = %err, "Kafka error after partial batch");
                    break;
                }
            };
            self.track(&record.handle);
            records.push(record);
            // Only take what is already buffered once the batch has started.
            wait = Duration::ZERO;
        }

        Ok(records)
    }

    async fn commit(&mut self, handle: KafkaOffset) -> Result<(), KafkaDriverError> {
        self.resolve(handle)
    }

    async fn discard(&mut self, handle: KafkaOffset) -> Result<(), KafkaDriverError> {
        self.resolve(handle)
    }
}

fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord<KafkaOffset> {
    let handle = KafkaOffset {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
    };
    RawRecord {
        message_id: format!("{}/{}/{}", handle.topic, handle.partition, handle.offset),
        payload: message.payload().unwrap_or_default().into(),
        redeliveries: 0,
        handle,
    }
}

/// In-flight offsets of one partition.
#[derive(Debug, Default)]
struct PartitionState {
    outstanding: BTreeSet<i64>,
    /// One past the highest fetched offset.
    next: i64,
    committed: Option<i64>,
}

impl PartitionState {
    fn fetched(&mut self, offset: i64) {
        self.outstanding.insert(offset);
        self.next = self.next.max(offset + 1);
    }

    fn resolve(&mut self, offset: i64) -> bool {
        self.outstanding.remove(&offset)
    }

    /// New position to commit, if it moved forward.
    fn advance(&mut self) -> Option<i64> {
        let position = self.outstanding.first().copied().unwrap_or(self.next);
        if self.committed.is_some_and(|committed| committed >= position) {
            return None;
        }
        self.committed = Some(position);
        Some(position)
    }
}

/// Kafka driver errors.
#[derive(Debug)]
pub struct KafkaDriverError {
    context: SpanTrace,
    kind: KafkaDriverErrorKind,
}

/// Kinds of Kafka driver errors.
#[derive(Debug)]
pub enum KafkaDriverErrorKind {
    Kafka(KafkaError),
    /// The offset was not fetched by this driver or was resolved already.
    NotInFlight(KafkaOffset),
}

impl KafkaDriverError {
    fn not_in_flight(handle: &KafkaOffset) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: KafkaDriverErrorKind::NotInFlight(handle.clone()),
        }
    }

    pub fn kind(&self) -> &KafkaDriverErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for KafkaDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            KafkaDriverErrorKind::Kafka(err) => writeln!(f, "Kafka error: {err}"),
            KafkaDriverErrorKind::NotInFlight(handle) => writeln!(
                f,
                "Offset {} of {}/{} is not in flight",
                handle.offset, handle.topic, handle.partition
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for KafkaDriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            KafkaDriverErrorKind::Kafka(err) => Some(err),
            KafkaDriverErrorKind::NotInFlight(_) => None,
        }
    }
}

impl From<KafkaError> for KafkaDriverError {
    fn from(err: KafkaError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: KafkaDriverErrorKind::Kafka(err),
        }
    }
}
