//! Stream entries as seen by handlers
//!
//! Wraps an entry id and its flat field map, with accessors for the reserved
//! `flowId` and `message` fields.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

use crate::error::StreamError;

/// Reserved field keys written by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum MessageKey {
    /// Correlation id propagated for tracing.
    FlowId,
    /// The opaque payload, usually JSON.
    Message,
}

impl MessageKey {
    pub fn is_reserved(key: &str) -> bool {
        key.parse::<MessageKey>().is_ok()
    }
}

/// Redis stream entry id (`<millis>-<seq>`), ordered by time then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible id, used to start a pending-list scan.
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::Internal(format!("invalid stream entry id '{s}'"));
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// A single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: EntryId, fields: BTreeMap<String, String>) -> Self {
        Self { id, fields }
    }

    /// Build an entry from the `(field, value)` pairs returned by Redis.
    pub fn from_pairs(id: EntryId, pairs: Vec<(String, String)>) -> Self {
        Self {
            id,
            fields: pairs.into_iter().collect(),
        }
    }

    /// Correlation id, empty when the publisher had none.
    pub fn flow_id(&self) -> &str {
        self.field(MessageKey::FlowId).unwrap_or_default()
    }

    /// The raw payload.
    pub fn message(&self) -> Option<&str> {
        self.field(MessageKey::Message)
    }

    /// Deserialize the payload as JSON.
    pub fn message_as<T: DeserializeOwned>(&self) -> Result<T, StreamError> {
        let raw = self
            .message()
            .ok_or_else(|| StreamError::Serialization(format!("entry {} has no message", self.id)))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// A caller-supplied parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Caller-supplied parameters, reserved keys excluded.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .filter(|(k, _)| !MessageKey::is_reserved(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// When the entry was appended, derived from its id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.id.millis)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    fn field(&self, key: MessageKey) -> Option<&str> {
        self.fields.get(key.as_ref()).map(String::as_str)
    }
}
