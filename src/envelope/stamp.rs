use std::{any::Any, fmt, sync::Arc};

use chrono::{DateTime, Utc};

/// Marker trait for envelope metadata.
///
/// Any `'static` type can become a stamp by implementing this trait.
/// Stamps are looked up by their concrete type.
pub trait Stamp: Any + fmt::Debug + Send + Sync {}

/// Ordered, append-only collection of [`Stamp`]s.
///
/// Several stamps of the same kind may coexist; [`last`](Stamps::last)
/// returns the most recently attached one. Cloning is cheap, entries are
/// shared.
#[derive(Clone, Default)]
pub struct Stamps {
    entries: Vec<Arc<dyn Stamp>>,
}

impl Stamps {
    pub fn push<S: Stamp>(&mut self, stamp: S) {
        self.entries.push(Arc::new(stamp));
    }

    /// The most recently attached stamp of kind `S`.
    pub fn last<S: Stamp>(&self) -> Option<&S> {
        self.entries.iter().rev().find_map(downcast::<S>)
    }

    /// All stamps of kind `S`, oldest first.
    pub fn all<S: Stamp>(&self) -> impl Iterator<Item = &S> {
        self.entries.iter().filter_map(downcast::<S>)
    }

    /// Remove every stamp of kind `S`, returning how many were removed.
    pub fn remove_all<S: Stamp>(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| downcast::<S>(entry).is_none());
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Stamp> {
        self.entries.iter().map(|entry| &**entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Stamps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

fn downcast<S: Stamp>(entry: &Arc<dyn Stamp>) -> Option<&S> {
    let any: &dyn Any = &**entry;
    any.downcast_ref::<S>()
}

/// Backend-native identifier of the record an envelope was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessageIdStamp(String);

impl TransportMessageIdStamp {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Stamp for TransportMessageIdStamp {}

/// Number of times the backend reports having delivered the record before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryStamp {
    count: u32,
}

impl RedeliveryStamp {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Stamp for RedeliveryStamp {}

/// Attached by the worker when an envelope is handed to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStamp {
    transport: String,
    at: DateTime<Utc>,
}

impl ReceivedStamp {
    pub fn new(transport: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            at: Utc::now(),
        }
    }

    /// Name the receiver was registered under.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl Stamp for ReceivedStamp {}

/// CloudEvents context attributes of a structured-mode event.
#[cfg(feature = "cloud-events")]
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct CloudEventsStamp {
    pub specversion: String,
    pub id: String,
    pub source: String,
    pub r#type: String,
    pub subject: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

#[cfg(feature = "cloud-events")]
impl Stamp for CloudEventsStamp {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Priority(u8);

    impl Stamp for Priority {}

    #[test]
    fn lookup_by_kind_skips_other_kinds() {
        let mut stamps = Stamps::default();
        stamps.push(Priority(1));
        stamps.push(TransportMessageIdStamp::new("m-1"));
        stamps.push(Priority(5));

        assert_eq!(stamps.last::<Priority>(), Some(&Priority(5)));
        assert_eq!(
            stamps.all::<Priority>().collect::<Vec<_>>(),
            vec![&Priority(1), &Priority(5)]
        );
        assert!(stamps.last::<RedeliveryStamp>().is_none());
        assert_eq!(stamps.len(), 3);
    }

    #[test]
    fn remove_all_keeps_other_kinds_in_order() {
        let mut stamps = Stamps::default();
        stamps.push(Priority(1));
        stamps.push(RedeliveryStamp::new(3));
        stamps.push(Priority(2));

        assert_eq!(stamps.remove_all::<Priority>(), 2);
        assert_eq!(stamps.len(), 1);
        assert_eq!(stamps.last::<RedeliveryStamp>().map(|s| s.count()), Some(3));
    }

    #[test]
    fn clones_share_entries() {
        let mut stamps = Stamps::default();
        stamps.push(ReceivedStamp::new("orders"));
        let copy = stamps.clone();

        assert_eq!(
            copy.last::<ReceivedStamp>().map(|s| s.transport()),
            Some("orders")
        );
        assert!(format!("{copy:?}").contains("orders"));
    }
}
