//! Consumption loop driving one or more receivers.
//!
//! The [`Worker`] repeatedly:
//!
//! - Picks the next receiver in round-robin order
//! - Polls it for a batch of envelopes
//! - Hands each envelope to a `tower::Service` handler
//! - Acknowledges handled envelopes and rejects (or abandons) failed ones
//!
//! Fairness between receivers is explicit: each receiver has its own backoff
//! state. A receiver that returned an empty batch is skipped for
//! [`idle_delay`](WorkerConfig::idle_delay); one whose backend is unreachable is
//! skipped according to the [`Backoff`] policy. While every receiver is
//! waiting, the worker sleeps.
//!
//! The worker runs until its [`CancellationToken`] is triggered. It then stops
//! polling, lets the current batch finish within
//! [`shutdown_grace`](WorkerConfig::shutdown_grace), and leaves whatever is
//! still unresolved to the backend's liveness timeout. Envelopes left behind
//! that way are handed back with [`Receiver::abandon`] so the receiver forgets
//! them.

mod config;
mod hook;

use std::{pin::pin, time::Duration};

use futures::StreamExt as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::{Delivery, ReceivedStamp},
    receiver::{ReceiveError, ReceiveErrorKind, Receiver},
};

pub use config::{Backoff, FailurePolicy, WorkerConfig};
pub use hook::{DefaultWorkerHook, WorkerHook};

/// Multi-receiver consumption loop.
///
/// Generic parameters:
/// - `M`: message type shared by every registered receiver
/// - `S`: handler service, called once per envelope
/// - `HK`: hook implementation for lifecycle events
pub struct Worker<M, S, HK = DefaultWorkerHook> {
    slots: Vec<Slot<M>>,
    handler: S,
    hook: HK,
    config: WorkerConfig,
    cursor: usize,
}

struct Slot<M> {
    name: String,
    receiver: Box<dyn Receiver<Message = M>>,
    failures: u32,
    resume_at: Option<Instant>,
}

/// Result of a single [`Worker::poll_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// A non-empty batch was dispatched and resolved.
    Dispatched(BatchOutcome),
    /// The polled receiver had nothing to deliver.
    Empty,
    /// Polling failed; the receiver is skipped for `retry_in`.
    TransportFailure { retry_in: Duration },
    /// Poison records were discarded; polling goes on.
    Poisoned,
    /// Every receiver is backing off until `until`.
    Waiting { until: Instant },
    /// Cancellation was requested before a batch was received.
    Cancelled,
}

/// How the envelopes of one batch were resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: usize,
    pub acked: usize,
    pub rejected: usize,
    /// Left unresolved by policy or because the shutdown grace elapsed.
    pub abandoned: usize,
    /// `ack` or `reject` failed; the backend state is indeterminate.
    pub resolve_failures: usize,
}

impl BatchOutcome {
    fn unresolved(&self) -> usize {
        self.received - self.acked - self.rejected - self.abandoned - self.resolve_failures
    }
}

impl<M, S> Worker<M, S, DefaultWorkerHook> {
    /// Create a worker with the default hook and settings.
    pub fn new(handler: S) -> Self {
        Self {
            slots: Vec::new(),
            handler,
            hook: DefaultWorkerHook,
            config: WorkerConfig::default(),
            cursor: 0,
        }
    }
}

impl<M, S, HK> Worker<M, S, HK> {
    /// Register a receiver. Receivers are polled in registration order.
    pub fn with_receiver<R>(mut self, name: impl Into<String>, receiver: R) -> Self
    where
        R: Receiver<Message = M> + 'static,
    {
        self.slots.push(Slot {
            name: name.into(),
            receiver: Box::new(receiver),
            failures: 0,
            resume_at: None,
        });
        self
    }

    /// Replace the worker hook while keeping all other generics unchanged.
    pub fn with_hook<HK2>(self, hook: HK2) -> Worker<M, S, HK2> {
        Worker {
            slots: self.slots,
            handler: self.handler,
            hook,
            config: self.config,
            cursor: self.cursor,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.config.idle_delay = delay;
        self
    }

    /// Handle up to `limit` envelopes of a batch at the same time.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency = limit;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.on_failure = policy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn validate(&self) -> Result<(), WorkerRunError> {
        if self.slots.is_empty() {
            return Err(WorkerRunError::no_receivers());
        }
        if self.config.concurrency == 0 {
            return Err(WorkerRunError::invalid_config(
                "concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    /// Index of the next receiver allowed to poll, or the earliest instant
    /// one becomes available.
    fn next_ready(&mut self, now: Instant) -> Result<usize, Instant> {
        let count = self.slots.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.slots[index].resume_at.is_none_or(|at| at <= now) {
                self.cursor = (index + 1) % count;
                return Ok(index);
            }
        }
        Err(self
            .slots
            .iter()
            .filter_map(|slot| slot.resume_at)
            .min()
            .unwrap_or(now))
    }
}

impl<M, S, HK> Worker<M, S, HK>
where
    M: Clone + Send + 'static,
    S: Service<Envelope<M>> + Clone + Send + Sync + 'static,
    S::Response: Send,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
    HK: WorkerHook<M>,
{
    /// Run the worker loop.
    ///
    /// The loop only ends when `cancel` is triggered, or immediately with an
    /// error if the worker is misconfigured (no receivers, zero concurrency).
    #[tracing::instrument(skip_all, fields(receivers = self.slots.len()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerRunError> {
        self.validate()?;
        self.hook.on_startup();

        loop {
            match self.poll_cycle(&cancel).await? {
                Cycle::Cancelled => break,
                Cycle::Waiting { until } => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                _ if cancel.is_cancelled() => break,
                _ => {}
            }
        }

        self.hook.on_shutdown();
        Ok(())
    }

    /// Perform one poll, dispatch and resolve step on the next receiver.
    ///
    /// A `get()` still pending when `cancel` fires is dropped. A batch already
    /// received keeps running for at most the shutdown grace period.
    pub async fn poll_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Cycle, WorkerRunError> {
        self.validate()?;
        if cancel.is_cancelled() {
            return Ok(Cycle::Cancelled);
        }

        let index = match self.next_ready(Instant::now()) {
            Ok(index) => index,
            Err(until) => return Ok(Cycle::Waiting { until }),
        };

        let Self {
            slots,
            handler,
            hook,
            config,
            ..
        } = self;
        let slot = &mut slots[index];

        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Cycle::Cancelled),
            polled = slot.receiver.get() => polled,
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(err) => return Ok(receive_failed(slot, &*hook, config, err)),
        };

        slot.failures = 0;
        if batch.is_empty() {
            hook.on_empty_poll(&slot.name);
            slot.resume_at = Some(Instant::now() + config.idle_delay);
            return Ok(Cycle::Empty);
        }
        slot.resume_at = None;

        let mut outcome = BatchOutcome {
            received: batch.len(),
            ..BatchOutcome::default()
        };
        let mut unsettled: Vec<Delivery> = batch.iter().map(Envelope::delivery).collect();
        let completed = {
            let mut work = pin!(dispatch(
                slot,
                &*handler,
                &*hook,
                config,
                batch,
                &mut outcome,
                &mut unsettled,
            ));
            tokio::select! {
                _ = &mut work => true,
                _ = cancel.cancelled() => {
                    tokio::time::timeout(config.shutdown_grace, &mut work).await.is_ok()
                }
            }
        };

        if !completed {
            let unresolved = outcome.unresolved();
            outcome.abandoned += unresolved;
            for delivery in unsettled {
                if let Err(err) = slot.receiver.abandon(delivery) {
                    hook.on_resolve_error(&slot.name, &err);
                }
            }
            hook.on_abandoned(&slot.name, unresolved);
        }

        Ok(Cycle::Dispatched(outcome))
    }
}

fn receive_failed<M, HK>(
    slot: &mut Slot<M>,
    hook: &HK,
    config: &WorkerConfig,
    err: ReceiveError,
) -> Cycle
where
    HK: WorkerHook<M>,
{
    match err.into_kind() {
        ReceiveErrorKind::Transport(err) => {
            slot.failures = slot.failures.saturating_add(1);
            let retry_in = config.backoff.delay(slot.failures);
            slot.resume_at = Some(Instant::now() + retry_in);
            hook.on_transport_error(&slot.name, &err, retry_in);
            Cycle::TransportFailure { retry_in }
        }
        ReceiveErrorKind::Decoding(err) => {
            slot.failures = 0;
            slot.resume_at = None;
            hook.on_decoding_error(&slot.name, &err);
            Cycle::Poisoned
        }
    }
}

/// Hand every envelope of `batch` to the handler and resolve it.
///
/// Up to `config.concurrency` handler calls run at once; resolution calls on
/// the receiver stay sequential. A delivery leaves `unsettled` right before
/// its resolution is attempted.
async fn dispatch<M, S, HK>(
    slot: &mut Slot<M>,
    handler: &S,
    hook: &HK,
    config: &WorkerConfig,
    batch: Vec<Envelope<M>>,
    outcome: &mut BatchOutcome,
    unsettled: &mut Vec<Delivery>,
) where
    M: Clone + Send + 'static,
    S: Service<Envelope<M>> + Clone,
    S::Error: Into<tower::BoxError>,
    HK: WorkerHook<M>,
{
    let Slot { name, receiver, .. } = slot;
    let name = name.as_str();

    let mut handled = futures::stream::iter(batch)
        .map(|mut envelope| {
            envelope.stamps_mut().push(ReceivedStamp::new(name));
            hook.on_message_received(name, &envelope);
            let service = handler.clone();
            async move {
                let result: Result<(), tower::BoxError> = call(service, envelope.clone())
                    .await
                    .map(|_| ())
                    .map_err(Into::into);
                (envelope, result)
            }
        })
        .buffer_unordered(config.concurrency);

    while let Some((envelope, result)) = handled.next().await {
        let delivery = envelope.delivery();
        unsettled.retain(|pending| *pending != delivery);
        let resolved = match result {
            Ok(()) => {
                hook.on_message_handled(name, &envelope);
                receiver.ack(envelope).await.map(|()| &mut outcome.acked)
            }
            Err(err) => {
                hook.on_handler_error(name, err.as_ref());
                match config.on_failure {
                    FailurePolicy::Reject => receiver
                        .reject(envelope)
                        .await
                        .map(|()| &mut outcome.rejected),
                    FailurePolicy::Abandon => {
                        hook.on_abandoned(name, 1);
                        receiver
                            .abandon(delivery)
                            .map(|()| &mut outcome.abandoned)
                    }
                }
            }
        };

        match resolved {
            Ok(counter) => *counter += 1,
            Err(err) => {
                hook.on_resolve_error(name, &err);
                outcome.resolve_failures += 1;
            }
        }
    }
}

async fn call<M, S>(mut service: S, envelope: Envelope<M>) -> Result<S::Response, S::Error>
where
    S: Service<Envelope<M>>,
{
    service.ready().await?.call(envelope).await
}

/// Error returned when the worker cannot run.
#[derive(Debug)]
pub struct WorkerRunError {
    context: SpanTrace,
    kind: WorkerRunErrorKind,
}

/// Classification of worker errors.
#[derive(Debug)]
pub enum WorkerRunErrorKind {
    /// No receiver was registered.
    NoReceivers,
    /// A setting is out of range.
    InvalidConfig(String),
}

impl WorkerRunError {
    fn no_receivers() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerRunErrorKind::NoReceivers,
        }
    }

    fn invalid_config(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerRunErrorKind::InvalidConfig(reason.into()),
        }
    }

    pub fn kind(&self) -> &WorkerRunErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for WorkerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            WorkerRunErrorKind::NoReceivers => writeln!(f, "Worker has no receivers"),
            WorkerRunErrorKind::InvalidConfig(reason) => {
                writeln!(f, "Invalid worker configuration: {reason}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerRunError {}
