//! Core data model shared by the store and the engine. Domain-agnostic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an entity: its type tag plus its id within that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// An event in wire form: its type name plus serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedEvent {
    pub event_type: String,
    pub bytes: Vec<u8>,
}

impl EncodedEvent {
    pub fn new(event_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            bytes,
        }
    }
}

/// Intent to apply an event to an entity. Ephemeral until offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub key: EntityKey,
    pub event: EncodedEvent,
}

impl Signal {
    pub fn new(key: EntityKey, event: EncodedEvent) -> Self {
        Self { key, event }
    }
}

/// A signal that has been durably queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberedSignal {
    pub sequence_number: i64,
    pub signal: Signal,
}

impl NumberedSignal {
    pub fn key(&self) -> &EntityKey {
        &self.signal.key
    }

    pub fn event(&self) -> &EncodedEvent {
        &self.signal.event
    }
}

/// A signal waiting in the scheduler until `due_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedSignal {
    pub sequence_number: i64,
    pub from: EntityKey,
    pub signal: Signal,
    pub due_time: DateTime<Utc>,
}

/// A delayed signal that fired: the scheduler row it came from and the queue
/// row that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedSignal {
    pub delayed: DelayedSignal,
    pub queued: NumberedSignal,
}

/// Current persisted state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub key: EntityKey,
    pub state_tag: Option<String>,
    pub bytes: Vec<u8>,
}

/// Secondary index row projected from a snapshot. Rows with a range go to the
/// range index, the rest to the plain property index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityProperty {
    pub name: String,
    pub value: String,
    pub range: Option<PropertyRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyRange {
    pub name: String,
    pub value: i64,
}

impl EntityProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            range: None,
        }
    }

    pub fn ranged(
        name: impl Into<String>,
        value: impl Into<String>,
        range_name: impl Into<String>,
        range_value: i64,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            range: Some(PropertyRange {
                name: range_name.into(),
                value: range_value,
            }),
        }
    }
}

/// `name = value` match against the property index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPredicate {
    pub name: String,
    pub value: String,
}

impl PropertyPredicate {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Query over the range index: rows with `name = value` whose range column
/// `range_name` lies within the bounds. Results ascend by range value, then id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub name: String,
    pub value: String,
    pub range_name: String,
    pub lower: Option<i64>,
    pub lower_inclusive: bool,
    pub upper: Option<i64>,
    pub upper_inclusive: bool,
    pub limit: usize,
}

impl RangeQuery {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        range_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            range_name: range_name.into(),
            lower: None,
            lower_inclusive: true,
            upper: None,
            upper_inclusive: false,
            limit: usize::MAX,
        }
    }

    pub fn lower(mut self, bound: i64, inclusive: bool) -> Self {
        self.lower = Some(bound);
        self.lower_inclusive = inclusive;
        self
    }

    pub fn upper(mut self, bound: i64, inclusive: bool) -> Self {
        self.upper = Some(bound);
        self.upper_inclusive = inclusive;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `v` satisfies both bounds.
    pub fn contains(&self, v: i64) -> bool {
        let above = match self.lower {
            None => true,
            Some(lo) if self.lower_inclusive => v >= lo,
            Some(lo) => v > lo,
        };
        let below = match self.upper {
            None => true,
            Some(hi) if self.upper_inclusive => v <= hi,
            Some(hi) => v < hi,
        };
        above && below
    }
}

/// One applied signal in the append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalLogEntry {
    pub sequence_number: i64,
    pub key: EntityKey,
    pub event: EncodedEvent,
    pub applied_at: DateTime<Utc>,
}

/// A signal removed from the queue because it can never be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub sequence_number: i64,
    pub signal: Signal,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
