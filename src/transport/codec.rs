//! Decoders turning raw backend payloads into messages.
//!
//! A codec is handed the payload bytes of each fetched record together with
//! the stamps collected so far, so it can attach metadata it finds on the way
//! (see the CloudEvents codec behind the `cloud-events` feature).
//!
//! A decode failure marks the record as poison: the [`Transport`] discards it
//! and `get()` fails with a decoding error.
//!
//! [`Transport`]: crate::transport::Transport

#[cfg(feature = "cloud-events")]
mod cloud_events;
#[cfg(feature = "cloud-events")]
pub use cloud_events::CloudEventsJson;

use serde::de::DeserializeOwned;

use crate::{envelope::Stamps, transport::RawPayload};

/// Trait implemented by message codecs.
pub trait Decode<M> {
    /// Codec-specific error type.
    type Error: Into<tower::BoxError>;

    /// Decode one payload, optionally attaching stamps.
    fn decode(&self, payload: &[u8], stamps: &mut Stamps) -> Result<M, Self::Error>;
}

/// Decodes JSON payloads into any `serde::de::DeserializeOwned` message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<M> Decode<M> for Json
where
    M: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn decode(&self, payload: &[u8], _stamps: &mut Stamps) -> Result<M, Self::Error> {
        serde_json::from_slice(payload)
    }
}

/// Passes payloads through untouched. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytes;

impl Decode<RawPayload> for Bytes {
    type Error = std::convert::Infallible;

    fn decode(&self, payload: &[u8], _stamps: &mut Stamps) -> Result<RawPayload, Self::Error> {
        Ok(RawPayload::from(payload))
    }
}

/// Codec built from a closure, see [`decode_fn`].
#[derive(Debug, Clone, Copy)]
pub struct DecodeFn<F>(F);

/// Build a codec from a plain decoding function.
///
/// ```rust
/// use mailslot::envelope::Stamps;
/// use mailslot::transport::codec::{Decode, decode_fn};
///
/// let utf8 = decode_fn(|bytes: &[u8]| std::str::from_utf8(bytes).map(str::to_owned));
///
/// let text: String = utf8.decode(b"hello", &mut Stamps::default()).unwrap();
/// assert_eq!(text, "hello");
/// let invalid: Result<String, _> = utf8.decode(&[0xff], &mut Stamps::default());
/// assert!(invalid.is_err());
/// ```
pub fn decode_fn<F>(f: F) -> DecodeFn<F> {
    DecodeFn(f)
}

impl<M, E, F> Decode<M> for DecodeFn<F>
where
    F: Fn(&[u8]) -> Result<M, E>,
    E: Into<tower::BoxError>,
{
    type Error = E;

    fn decode(&self, payload: &[u8], _stamps: &mut Stamps) -> Result<M, Self::Error> {
        (self.0)(payload)
    }
}
