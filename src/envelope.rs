//! Envelopes handed out by receivers.
//!
//! An [`Envelope`] bundles a decoded message with the identity needed to
//! resolve it later and with an ordered list of [`Stamp`]s.
//!
//! ## Design
//!
//! - `M` is the decoded message payload, opaque to this crate
//! - [`Delivery`] is the receiver-bound identity: the id of the receiver
//!   instance that produced the envelope and a tag local to that receiver
//! - [`Stamps`] carry metadata attached by transports, codecs and the worker
//!
//! Envelopes are only ever created by a receiver during `get()`, and are
//! consumed by exactly one call to `ack` or `reject` on that same receiver.
//!
//! ## Example
//!
//! ```rust
//! use mailslot::envelope::{Delivery, ReceiverId, TransportMessageIdStamp};
//! use mailslot::Envelope;
//!
//! let receiver = ReceiverId::next();
//! let envelope = Envelope::new(Delivery::new(receiver, 1), "user.created")
//!     .with_stamp(TransportMessageIdStamp::new("42"));
//!
//! assert_eq!(envelope.delivery().receiver(), receiver);
//! assert_eq!(
//!     envelope.last_stamp::<TransportMessageIdStamp>().map(|s| s.as_str()),
//!     Some("42"),
//! );
//! ```

mod stamp;

use std::sync::atomic::{AtomicU64, Ordering};

pub use stamp::{ReceivedStamp, RedeliveryStamp, Stamp, Stamps, TransportMessageIdStamp};

#[cfg(feature = "cloud-events")]
pub use stamp::CloudEventsStamp;

/// A unit of work fetched from a receiver and not yet resolved.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    delivery: Delivery,
    message: M,
    stamps: Stamps,
}

impl<M> Envelope<M> {
    /// Create an envelope without stamps.
    pub fn new(delivery: Delivery, message: M) -> Self {
        Self {
            delivery,
            message,
            stamps: Stamps::default(),
        }
    }

    /// Create an envelope carrying already collected stamps.
    pub fn with_stamps(delivery: Delivery, message: M, stamps: Stamps) -> Self {
        Self {
            delivery,
            message,
            stamps,
        }
    }

    /// Append a stamp, returning the envelope.
    pub fn with_stamp<S: Stamp>(mut self, stamp: S) -> Self {
        self.stamps.push(stamp);
        self
    }

    /// Receiver-bound identity of this envelope.
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Borrow the decoded message.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Take the decoded message, dropping identity and stamps.
    pub fn into_message(self) -> M {
        self.message
    }

    pub fn stamps(&self) -> &Stamps {
        &self.stamps
    }

    pub fn stamps_mut(&mut self) -> &mut Stamps {
        &mut self.stamps
    }

    /// The most recently attached stamp of kind `S`, if any.
    pub fn last_stamp<S: Stamp>(&self) -> Option<&S> {
        self.stamps.last::<S>()
    }
}

/// Identity of an in-flight envelope.
///
/// The tag only has meaning for the receiver instance named by
/// [`receiver`](Delivery::receiver); receivers map it back to the backend
/// handle (delivery tag, row id, offset) when the envelope is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delivery {
    receiver: ReceiverId,
    tag: u64,
}

impl Delivery {
    pub fn new(receiver: ReceiverId, tag: u64) -> Self {
        Self { receiver, tag }
    }

    pub fn receiver(&self) -> ReceiverId {
        self.receiver
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// Process-unique identifier of a receiver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(u64);

impl ReceiverId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "receiver-{}", self.0)
    }
}
