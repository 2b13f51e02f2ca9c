use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    envelope::{CloudEventsStamp, Stamps},
    transport::codec::Decode,
};

const SPEC_VERSION: &str = "1.0";

/// Decodes structured-mode JSON CloudEvents.
///
/// The `data` member is decoded into the message type, the context
/// attributes are attached to the envelope as a [`CloudEventsStamp`]. Events
/// with a `specversion` other than `1.0` are treated as undecodable.
#[derive(Debug, Clone, Default)]
pub struct CloudEventsJson {
    source: Option<String>,
}

impl CloudEventsJson {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept events whose `source` attribute matches.
    pub fn with_source(mut self, source: impl ToString) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

#[derive(Deserialize)]
struct StructuredEvent<M> {
    #[serde(flatten)]
    attributes: CloudEventsStamp,
    data: M,
}

impl<M> Decode<M> for CloudEventsJson
where
    M: DeserializeOwned,
{
    type Error = tower::BoxError;

    fn decode(&self, payload: &[u8], stamps: &mut Stamps) -> Result<M, Self::Error> {
        let event: StructuredEvent<M> = serde_json::from_slice(payload)?;

        if event.attributes.specversion != SPEC_VERSION {
            return Err(format!(
                "unsupported CloudEvents specversion {}",
                event.attributes.specversion
            )
            .into());
        }
        if let Some(source) = &self.source {
            if *source != event.attributes.source {
                return Err(
                    format!("unexpected CloudEvents source {}", event.attributes.source).into(),
                );
            }
        }

        stamps.push(event.attributes);
        Ok(event.data)
    }
}
