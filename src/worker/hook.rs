use std::time::Duration;

use crate::{
    Envelope,
    envelope::TransportMessageIdStamp,
    receiver::{MessageDecodingError, TransportError},
};

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
/// Every method except startup and shutdown has an empty default body.
///
/// `receiver` is the name the receiver was registered under.
pub trait WorkerHook<M>: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_message_received(&self, _receiver: &str, _envelope: &Envelope<M>) {}
    fn on_message_handled(&self, _receiver: &str, _envelope: &Envelope<M>) {}
    fn on_handler_error(&self, _receiver: &str, _error: &dyn std::error::Error) {}
    fn on_empty_poll(&self, _receiver: &str) {}
    fn on_transport_error(&self, _receiver: &str, _error: &TransportError, _retry_in: Duration) {}
    fn on_decoding_error(&self, _receiver: &str, _error: &MessageDecodingError) {}
    fn on_resolve_error(&self, _receiver: &str, _error: &TransportError) {}
    /// Envelopes left unresolved, either by policy or because the shutdown
    /// grace period elapsed.
    fn on_abandoned(&self, _receiver: &str, _count: usize) {}
}

/// Default worker hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultWorkerHook;

impl<M> WorkerHook<M> for DefaultWorkerHook {
    fn on_startup(&self) {
        tracing::info!("Worker is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Worker is shutting down");
    }

    fn on_message_received(&self, receiver: &str, envelope: &Envelope<M>) {
        let message_id = envelope
            .last_stamp::<TransportMessageIdStamp>()
            .map(TransportMessageIdStamp::as_str);
        tracing::debug!(receiver, message_id, "Message received");
    }

    fn on_message_handled(&self, receiver: &str, _envelope: &Envelope<M>) {
        tracing::info!(receiver, "Message handled successfully");
    }

    fn on_handler_error(&self, receiver: &str, error: &dyn std::error::Error) {
        tracing::error!(receiver, %error, "Error handling message");
    }

    fn on_empty_poll(&self, receiver: &str) {
        tracing::trace!(receiver, "No message available");
    }

    fn on_transport_error(&self, receiver: &str, error: &TransportError, retry_in: Duration) {
        tracing::warn!(receiver, %error, ?retry_in, "Error receiving messages, backing off");
    }

    fn on_decoding_error(&self, receiver: &str, error: &MessageDecodingError) {
        tracing::error!(
            receiver,
            message_id = error.message_id(),
            discarded = error.discarded(),
            %error,
            "Discarded undecodable message"
        );
    }

    fn on_resolve_error(&self, receiver: &str, error: &TransportError) {
        tracing::error!(receiver, %error, "Failed to resolve message");
    }

    fn on_abandoned(&self, receiver: &str, count: usize) {
        tracing::warn!(receiver, count, "Messages left unresolved");
    }
}
