//! The receiver contract and its error taxonomy.
//!
//! A [`Receiver`] pulls small batches of [`Envelope`]s from one backend
//! resource and is told, per envelope, whether processing succeeded
//! ([`ack`](Receiver::ack)) or must never be retried
//! ([`reject`](Receiver::reject)).
//!
//! ## Errors
//!
//! - [`TransportError`]: the backend could not be reached, or the caller broke
//!   the addressing rules (foreign or already resolved envelope)
//! - [`MessageDecodingError`]: a record could not be decoded; it has already
//!   been removed from the backend when the error is returned
//! - [`ReceiveError`]: what `get()` returns, one of the two above
//!
//! All errors capture a [`SpanTrace`] where they are created.

use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::{Delivery, ReceiverId},
};

/// Stateful adapter over a single queue-like backend resource.
///
/// A receiver instance is meant to be owned by a single caller; every method
/// takes `&mut self` and calls are expected to be sequential.
///
/// ## Contract
///
/// - [`get`](Receiver::get) returns a finite, small batch. An empty batch means
///   no work is available and is not an error. Every returned envelope is
///   in-flight until resolved or until the backend's own liveness timeout.
/// - Undecodable records are removed from the backend before `get` fails with
///   [`ReceiveErrorKind::Decoding`]; they are never redelivered.
/// - [`ack`](Receiver::ack) and [`reject`](Receiver::reject) consume the
///   envelope. Both only accept envelopes obtained from `get` on the same
///   instance, anything else is reported as a contract violation.
/// - [`abandon`](Receiver::abandon) gives up on an envelope without resolving
///   it. The backend redelivers it once its own liveness timeout expires.
#[async_trait::async_trait]
pub trait Receiver: Send {
    /// Decoded message type.
    type Message: Send;

    /// Fetch a bounded batch of envelopes.
    async fn get(&mut self) -> Result<Vec<Envelope<Self::Message>>, ReceiveError>;

    /// Permanently commit a handled envelope.
    async fn ack(&mut self, envelope: Envelope<Self::Message>) -> Result<(), TransportError>;

    /// Permanently discard an envelope that must not be retried.
    async fn reject(&mut self, envelope: Envelope<Self::Message>) -> Result<(), TransportError>;

    /// Forget an in-flight delivery without contacting the backend.
    ///
    /// Takes the [`Delivery`] rather than the envelope so envelopes lost with
    /// a dropped handler future can still be handed back. Receivers that keep
    /// no per-delivery state can rely on the default, which does nothing.
    fn abandon(&mut self, _delivery: Delivery) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R> Receiver for Box<R>
where
    R: Receiver + ?Sized,
{
    type Message = R::Message;

    async fn get(&mut self) -> Result<Vec<Envelope<Self::Message>>, ReceiveError> {
        (**self).get().await
    }

    async fn ack(&mut self, envelope: Envelope<Self::Message>) -> Result<(), TransportError> {
        (**self).ack(envelope).await
    }

    async fn reject(&mut self, envelope: Envelope<Self::Message>) -> Result<(), TransportError> {
        (**self).reject(envelope).await
    }

    fn abandon(&mut self, delivery: Delivery) -> Result<(), TransportError> {
        (**self).abandon(delivery)
    }
}

/// Error returned by `get`, `ack` and `reject` when the backend is unreachable
/// or the envelope cannot be addressed.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport error kinds.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Communication with the backend failed. Usually transient.
    Backend(tower::BoxError),
    /// The envelope was produced by another receiver instance.
    ForeignEnvelope {
        expected: ReceiverId,
        found: ReceiverId,
    },
    /// The envelope's tag is not in-flight in this receiver, typically because
    /// it was already acknowledged or rejected.
    UnknownDelivery(u64),
}

impl TransportError {
    /// Create a backend communication error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Backend(err.into()),
        }
    }

    pub fn foreign_envelope(expected: ReceiverId, found: ReceiverId) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::ForeignEnvelope { expected, found },
        }
    }

    pub fn unknown_delivery(tag: u64) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::UnknownDelivery(tag),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether the caller violated the addressing rules rather than the
    /// backend failing.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Backend(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            TransportErrorKind::ForeignEnvelope { expected, found } => writeln!(
                f,
                "Envelope belongs to {found} and cannot be resolved by {expected}"
            ),
            TransportErrorKind::UnknownDelivery(tag) => {
                writeln!(f, "Delivery {tag} is not in flight")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// A record could not be decoded and was discarded at the backend.
#[derive(Debug)]
pub struct MessageDecodingError {
    context: SpanTrace,
    message_id: String,
    source: tower::BoxError,
    discarded: usize,
}

impl MessageDecodingError {
    /// `discarded` counts every poison record removed by the same `get` call,
    /// including the one described by `message_id`.
    pub fn new(message_id: impl Into<String>, source: tower::BoxError, discarded: usize) -> Self {
        Self {
            context: SpanTrace::capture(),
            message_id: message_id.into(),
            source,
            discarded,
        }
    }

    /// Backend-native id of the first undecodable record.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }
}

impl std::fmt::Display for MessageDecodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Could not decode message {} ({} discarded): {}",
            self.message_id, self.discarded, self.source
        )?;
        self.context.fmt(f)
    }
}

impl std::error::Error for MessageDecodingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Error returned by [`Receiver::get`].
#[derive(Debug)]
pub struct ReceiveError {
    context: SpanTrace,
    kind: ReceiveErrorKind,
}

/// Receive error kinds.
#[derive(Debug)]
pub enum ReceiveErrorKind {
    /// Polling failed; the caller may retry later.
    Transport(TransportError),
    /// A poison record was removed; never retry it.
    Decoding(MessageDecodingError),
}

impl ReceiveError {
    pub fn kind(&self) -> &ReceiveErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ReceiveErrorKind {
        self.kind
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ReceiveErrorKind::Transport(_))
    }

    pub fn is_decoding(&self) -> bool {
        matches!(self.kind, ReceiveErrorKind::Decoding(_))
    }
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ReceiveErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            ReceiveErrorKind::Decoding(err) => writeln!(f, "Decoding error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ReceiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ReceiveErrorKind::Transport(err) => Some(err),
            ReceiveErrorKind::Decoding(err) => Some(err),
        }
    }
}

impl From<TransportError> for ReceiveError {
    fn from(err: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ReceiveErrorKind::Transport(err),
        }
    }
}

impl From<MessageDecodingError> for ReceiveError {
    fn from(err: MessageDecodingError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ReceiveErrorKind::Decoding(err),
        }
    }
}
