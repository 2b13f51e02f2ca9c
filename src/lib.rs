#![doc = include_str!("../README.md")]

pub mod envelope;
pub mod receiver;
pub mod transport;
pub mod worker;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use receiver::{
    MessageDecodingError, ReceiveError, ReceiveErrorKind, Receiver, TransportError,
    TransportErrorKind,
};

#[doc(inline)]
pub use transport::Transport;

#[doc(inline)]
pub use worker::{
    Backoff, BatchOutcome, Cycle, DefaultWorkerHook, FailurePolicy, Worker, WorkerConfig,
    WorkerHook, WorkerRunError, WorkerRunErrorKind,
};
